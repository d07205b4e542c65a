use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::host;
use crate::stream::Stream;
use crate::DevicePtr;

#[cfg(feature = "cuda")]
use crate::cuda;
#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;

/// Where a device's memory lives, numbered as in the Arrow C Device Data
/// Interface (`ArrowDeviceType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    /// Page-locked host memory addressable from the device.
    CudaHost,
    /// Unified memory migrating between host and device.
    CudaManaged,
}

impl DeviceKind {
    pub fn arrow_device_type(self) -> i32 {
        match self {
            DeviceKind::Cpu => 1,
            DeviceKind::Cuda => 2,
            DeviceKind::CudaHost => 3,
            DeviceKind::CudaManaged => 13,
        }
    }

    pub fn from_arrow_device_type(code: i32) -> Option<Self> {
        match code {
            1 => Some(DeviceKind::Cpu),
            2 => Some(DeviceKind::Cuda),
            3 => Some(DeviceKind::CudaHost),
            13 => Some(DeviceKind::CudaManaged),
            _ => None,
        }
    }
}

/// Kind of allocation a pointer belongs to, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Ordinary device allocation; the only kind that can be shared over IPC.
    Device,
    Managed,
    Pinned,
    /// Not an allocation this device knows about.
    Unregistered,
}

/// Implementation behind a [`Device`]; kernel launchers match on it to pick
/// a code path.
pub enum Backend {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaDevice>),
}

/// Cheaply clonable handle to one accelerator (or to the host backend).
#[derive(Clone)]
pub struct Device {
    inner: Arc<Backend>,
}

impl Device {
    /// The host-resident backend. Always available.
    pub fn host() -> Self {
        Self {
            inner: Arc::new(Backend::Host),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: usize) -> Result<Self> {
        tracing::info!("Opening CUDA device {}", ordinal);
        let dev = cuda::open(ordinal)?;
        Ok(Self {
            inner: Arc::new(Backend::Cuda(dev)),
        })
    }

    /// Re-open a device from the `(kind, id)` pair recorded by an exporter.
    pub fn from_descriptor(kind: DeviceKind, id: i64) -> Result<Self> {
        match kind {
            DeviceKind::Cpu => Ok(Self::host()),
            #[cfg(feature = "cuda")]
            DeviceKind::Cuda => {
                let ordinal = usize::try_from(id).map_err(|_| {
                    DeviceError::InvalidArgument(format!("invalid CUDA device id {}", id))
                })?;
                Self::cuda(ordinal)
            }
            other => Err(DeviceError::InvalidArgument(format!(
                "no backend available for {:?} device {}",
                other, id
            ))),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self.inner.as_ref() {
            Backend::Host => DeviceKind::Cpu,
            #[cfg(feature = "cuda")]
            Backend::Cuda(_) => DeviceKind::Cuda,
        }
    }

    /// Device ordinal; `-1` for the host backend, following the Arrow CPU convention.
    pub fn id(&self) -> i64 {
        match self.inner.as_ref() {
            Backend::Host => -1,
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => dev.ordinal() as i64,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.inner
    }

    /// The device's implicit stream.
    pub fn default_stream(&self) -> Stream {
        Stream::default_for(self.clone())
    }

    /// A new stream, independent from the default one.
    pub fn create_stream(&self) -> Result<Stream> {
        Stream::new(self.clone())
    }

    /// Copy host bytes into device memory at `dst`. Returns once the source
    /// slice may be reused.
    pub fn copy_to_device(&self, dst: DevicePtr, src: &[u8], stream: &Stream) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        debug!("HtoD copy: {} bytes to {:#x}", src.len(), dst);
        match self.inner.as_ref() {
            Backend::Host => {
                // Earlier work on the stream may still read `dst`.
                stream.synchronize()?;
                host::check_range(dst, src.len())?;
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::copy_to_device(dev, dst, src, stream.cu_stream()),
        }
    }

    /// Copy device memory at `src` into `dst`, waiting for `stream` to drain first.
    pub fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8], stream: &Stream) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        debug!("DtoH copy: {} bytes from {:#x}", dst.len(), src);
        match self.inner.as_ref() {
            Backend::Host => {
                stream.synchronize()?;
                host::check_range(src, dst.len())?;
                unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::copy_to_host(dev, src, dst, stream.cu_stream()),
        }
    }

    /// Convenience wrapper around [`Device::copy_to_host`] returning a new vector.
    pub fn read(&self, src: DevicePtr, len: usize, stream: &Stream) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.copy_to_host(src, &mut out, stream)?;
        Ok(out)
    }

    pub fn memory_kind(&self, ptr: DevicePtr) -> Result<MemoryKind> {
        match self.inner.as_ref() {
            Backend::Host => Ok(host::memory_kind(ptr)),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::memory_kind(dev, ptr),
        }
    }

    /// Base address and size of the allocation containing `ptr`.
    pub fn address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, usize)> {
        match self.inner.as_ref() {
            Backend::Host => host::address_range(ptr).ok_or_else(|| {
                DeviceError::InvalidArgument(format!("{:#x} is not inside a live allocation", ptr))
            }),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::address_range(dev, ptr),
        }
    }

    /// Block the calling thread until the event behind an Arrow `sync_event`
    /// pointer has completed.
    ///
    /// # Safety
    ///
    /// `sync_event` must be null or point to a live event handle created on
    /// this device (see [`crate::Event::as_sync_ptr`]).
    pub unsafe fn wait_sync_event(&self, sync_event: *mut c_void) -> Result<()> {
        if sync_event.is_null() {
            return Ok(());
        }
        match self.inner.as_ref() {
            Backend::Host => Ok(()),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::synchronize_event(dev, *(sync_event as *const *mut c_void)),
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.id() == other.id()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_device_type_codes() {
        assert_eq!(DeviceKind::Cpu.arrow_device_type(), 1);
        assert_eq!(DeviceKind::Cuda.arrow_device_type(), 2);
        assert_eq!(DeviceKind::CudaManaged.arrow_device_type(), 13);
        for kind in [DeviceKind::Cpu, DeviceKind::Cuda, DeviceKind::CudaHost, DeviceKind::CudaManaged] {
            assert_eq!(DeviceKind::from_arrow_device_type(kind.arrow_device_type()), Some(kind));
        }
        assert_eq!(DeviceKind::from_arrow_device_type(7), None);
    }

    #[test]
    fn host_device_identity() {
        let device = Device::host();
        assert_eq!(device.kind(), DeviceKind::Cpu);
        assert_eq!(device.id(), -1);
        assert_eq!(Device::from_descriptor(DeviceKind::Cpu, -1).unwrap(), device);
    }

    #[test]
    fn unknown_pointer_is_unregistered() {
        let device = Device::host();
        let local = [0u8; 16];
        let kind = device.memory_kind(local.as_ptr() as DevicePtr).unwrap();
        assert_eq!(kind, MemoryKind::Unregistered);
        assert!(device.address_range(local.as_ptr() as DevicePtr).is_err());
    }

    #[test]
    fn host_copies_are_range_checked() {
        use crate::memory_resource::{DeviceMemoryResource, MemoryResource};

        let device = Device::host();
        let stream = device.create_stream().unwrap();
        let mr = DeviceMemoryResource::new(device.clone());
        let ptr = mr.allocate(8, &stream).unwrap();

        device.copy_to_device(ptr, &[1, 2, 3, 4, 5, 6, 7, 8], &stream).unwrap();
        assert_eq!(device.read(ptr + 4, 4, &stream).unwrap(), vec![5, 6, 7, 8]);
        assert!(device.copy_to_device(ptr + 4, &[0; 8], &stream).is_err());

        unsafe { mr.deallocate(ptr, 8, &stream) };
    }
}
