use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::device::{Backend, Device};
use crate::error::Result;
use crate::host;

#[cfg(feature = "cuda")]
use crate::cuda;
#[cfg(feature = "cuda")]
use cudarc::driver::{sys, CudaStream};

enum StreamInner {
    Host,
    #[cfg(feature = "cuda")]
    CudaDefault(sys::CUstream),
    #[cfg(feature = "cuda")]
    Cuda(CudaStream),
}

// CUstream handles may be used from any thread.
unsafe impl Send for StreamInner {}
unsafe impl Sync for StreamInner {}

/// Ordered queue of device work. Work on one stream runs in submission order;
/// work on different streams is unordered unless joined through an [`Event`].
#[derive(Clone)]
pub struct Stream {
    device: Device,
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn default_for(device: Device) -> Self {
        let inner = match device.backend() {
            Backend::Host => StreamInner::Host,
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => StreamInner::CudaDefault(*dev.cu_stream()),
        };
        Self {
            device,
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn new(device: Device) -> Result<Self> {
        let inner = match device.backend() {
            Backend::Host => StreamInner::Host,
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => StreamInner::Cuda(dev.fork_default_stream()?),
        };
        debug!("Created stream on {:?}", device);
        Ok(Self {
            device,
            inner: Arc::new(inner),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Block until all work enqueued on this stream has finished.
    pub fn synchronize(&self) -> Result<()> {
        match self.inner.as_ref() {
            StreamInner::Host => Ok(()),
            #[cfg(feature = "cuda")]
            _ => cuda::synchronize_stream(self.cu_stream()),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn cu_stream(&self) -> sys::CUstream {
        match self.inner.as_ref() {
            StreamInner::CudaDefault(stream) => *stream,
            StreamInner::Cuda(stream) => stream.stream,
            StreamInner::Host => std::ptr::null_mut(),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.as_ref() {
            StreamInner::Host => "host",
            #[cfg(feature = "cuda")]
            StreamInner::CudaDefault(_) => "cuda-default",
            #[cfg(feature = "cuda")]
            StreamInner::Cuda(_) => "cuda",
        };
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("kind", &kind)
            .finish()
    }
}

/// Device completion token. Destroyed when dropped.
///
/// The raw handle is boxed so that [`Event::as_sync_ptr`] stays valid for the
/// event's whole life, which is what the Arrow `sync_event` field expects
/// (a pointer *to* the backend event, e.g. `CUevent*`).
pub struct Event {
    device: Device,
    raw: Box<*mut c_void>,
}

// Event handles are thread-safe driver objects.
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    pub fn new(device: &Device) -> Result<Self> {
        let raw = match device.backend() {
            Backend::Host => host::create_event(),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::create_event(dev)?,
        };
        Ok(Self {
            device: device.clone(),
            raw: Box::new(raw),
        })
    }

    /// Capture all work currently enqueued on `stream`.
    pub fn record(&self, stream: &Stream) -> Result<()> {
        debug!("Recording event {:p} on {:?}", *self.raw, stream);
        match self.device.backend() {
            Backend::Host => Ok(()),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::record_event(dev, *self.raw, stream.cu_stream()),
        }
    }

    pub fn synchronize(&self) -> Result<()> {
        match self.device.backend() {
            Backend::Host => Ok(()),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::synchronize_event(dev, *self.raw),
        }
    }

    /// Pointer to the boxed backend handle, suitable for `ArrowDeviceArray::sync_event`.
    pub fn as_sync_ptr(&self) -> *mut c_void {
        &*self.raw as *const *mut c_void as *mut c_void
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        match self.device.backend() {
            Backend::Host => {}
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => {
                if let Err(e) = cuda::destroy_event(dev, *self.raw) {
                    tracing::warn!("Failed to destroy event: {}", e);
                }
            }
        }
        debug!("Destroyed event {:p}", *self.raw);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("device", &self.device)
            .field("raw", &*self.raw)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_ptr_points_at_raw_handle() {
        let device = Device::host();
        let event = Event::new(&device).unwrap();
        let stream = device.create_stream().unwrap();
        event.record(&stream).unwrap();
        event.synchronize().unwrap();
        let ptr = event.as_sync_ptr();
        assert!(!ptr.is_null());
        let raw = unsafe { *(ptr as *const *mut c_void) };
        assert!(!raw.is_null());
        unsafe { device.wait_sync_event(ptr).unwrap() };
    }

    #[test]
    fn host_events_are_distinct() {
        let device = Device::host();
        let a = Event::new(&device).unwrap();
        let b = Event::new(&device).unwrap();
        let raw_a = unsafe { *(a.as_sync_ptr() as *const *mut c_void) };
        let raw_b = unsafe { *(b.as_sync_ptr() as *const *mut c_void) };
        assert_ne!(raw_a, raw_b);
    }
}
