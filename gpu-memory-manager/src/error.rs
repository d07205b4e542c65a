use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Failures reported by the device, its driver or the OS-level handle primitives.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to allocate {bytes} bytes: {reason}")]
    Allocation { bytes: usize, reason: String },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("IPC handle error: {0}")]
    Ipc(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Kernel error: {0}")]
    Kernel(String),

    #[error("Unsupported memory: {0}")]
    UnsupportedMemory(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for DeviceError {
    fn from(e: cudarc::driver::DriverError) -> Self {
        DeviceError::Driver(e.to_string())
    }
}
