/// Which backend an [`crate::InteropEngine`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// Host-resident memory; always available.
    #[default]
    Host,
    /// A CUDA device by ordinal. Needs the `cuda` feature.
    Cuda { ordinal: usize },
}

#[derive(Debug, Clone)]
pub struct InteropConfig {
    pub device: DeviceSelector,
    /// Refuse to export managed, pinned or unregistered memory over IPC.
    pub require_device_memory_for_ipc: bool,
    /// Count every allocation and free made through the engine's resource.
    pub track_allocations: bool,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Host,
            require_device_memory_for_ipc: true,
            track_allocations: false,
        }
    }
}

impl InteropConfig {
    pub fn cuda(ordinal: usize) -> Self {
        Self {
            device: DeviceSelector::Cuda { ordinal },
            ..Default::default()
        }
    }
}
