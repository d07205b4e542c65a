use std::fmt;

use tracing::{debug, warn};

use crate::device::{Backend, Device};
use crate::error::{DeviceError, Result};
use crate::host;
use crate::DevicePtr;

#[cfg(feature = "cuda")]
use crate::cuda;

/// Size of an opaque IPC memory handle (`CUipcMemHandle`).
pub const IPC_HANDLE_SIZE: usize = 64;

/// Opaque token that lets another process map a device allocation.
///
/// A handle always names a whole allocation; sub-ranges are addressed with an
/// offset from the allocation base (see [`IpcExport`]).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IpcMemHandle([u8; IPC_HANDLE_SIZE]);

impl IpcMemHandle {
    pub fn from_array(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; IPC_HANDLE_SIZE] = bytes.try_into().map_err(|_| {
            DeviceError::Ipc(format!(
                "IPC handle must be {} bytes, got {}",
                IPC_HANDLE_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for IpcMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcMemHandle(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// Handle for the allocation containing a pointer, plus the pointer's offset
/// from the allocation base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcExport {
    pub handle: IpcMemHandle,
    pub offset: usize,
}

impl Device {
    /// Produce an IPC handle for the allocation that contains `ptr`.
    pub fn ipc_export(&self, ptr: DevicePtr) -> Result<IpcExport> {
        let (base, _) = self.address_range(ptr)?;
        let handle = match self.backend() {
            Backend::Host => host::ipc_get_handle(base)?,
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::ipc_get_handle(dev, base)?,
        };
        let offset = (ptr - base) as usize;
        debug!("IPC export of {:#x} (base {:#x}, offset {})", ptr, base, offset);
        Ok(IpcExport { handle, offset })
    }
}

/// A peer allocation mapped into this process. The mapping is closed on drop.
pub struct ImportedPtr {
    device: Device,
    base: DevicePtr,
}

impl ImportedPtr {
    pub fn open(device: &Device, handle: &IpcMemHandle) -> Result<Self> {
        let base = match device.backend() {
            Backend::Host => host::ipc_open(handle)?,
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::ipc_open(dev, handle)?,
        };
        debug!("Opened IPC mapping at {:#x} on {:?}", base, device);
        Ok(Self {
            device: device.clone(),
            base,
        })
    }

    /// Base address of the mapped allocation in this process.
    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for ImportedPtr {
    fn drop(&mut self) {
        let closed = match self.device.backend() {
            Backend::Host => host::ipc_close(self.base),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::ipc_close(dev, self.base),
        };
        match closed {
            Ok(()) => debug!("Closed IPC mapping at {:#x}", self.base),
            Err(e) => warn!("Failed to close IPC mapping at {:#x}: {}", self.base, e),
        }
    }
}

impl fmt::Debug for ImportedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedPtr")
            .field("device", &self.device)
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceBuffer, DeviceMemoryResource};

    #[test]
    fn handle_length_is_checked() {
        assert!(IpcMemHandle::from_bytes(&[0u8; 63]).is_err());
        assert!(IpcMemHandle::from_bytes(&[0u8; IPC_HANDLE_SIZE]).is_ok());
    }

    #[test]
    fn export_reports_offset_from_base() {
        let device = Device::host();
        let stream = device.default_stream();
        let mr = DeviceMemoryResource::shared(device.clone());
        let buffer = DeviceBuffer::new(128, &stream, &mr).unwrap();

        let export = device.ipc_export(buffer.ptr() + 48).unwrap();
        assert_eq!(export.offset, 48);
        assert_eq!(export, IpcExport { handle: device.ipc_export(buffer.ptr()).unwrap().handle, offset: 48 });
    }

    #[test]
    fn imported_mapping_closes_on_drop() {
        let device = Device::host();
        let stream = device.default_stream();
        let mr = DeviceMemoryResource::shared(device.clone());
        let buffer = DeviceBuffer::from_host(&[7u8; 32], &stream, &mr).unwrap();

        let export = device.ipc_export(buffer.ptr()).unwrap();
        let imported = ImportedPtr::open(&device, &export.handle).unwrap();
        assert_eq!(imported.base(), buffer.ptr());
        assert_eq!(host::open_ipc_mappings(buffer.ptr()), 1);
        drop(imported);
        assert_eq!(host::open_ipc_mappings(buffer.ptr()), 0);
    }
}
