use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::memory_resource::MemoryResource;
use crate::stream::Stream;
use crate::DevicePtr;

/// Owning, untyped device allocation. Freed on drop through the resource and
/// stream it was allocated with.
///
/// A zero-length buffer owns nothing and reports a null pointer.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    stream: Stream,
    mr: Arc<dyn MemoryResource>,
}

impl DeviceBuffer {
    /// Allocate `len` uninitialized bytes.
    pub fn new(len: usize, stream: &Stream, mr: &Arc<dyn MemoryResource>) -> Result<Self> {
        let ptr = if len == 0 {
            0
        } else {
            mr.allocate(len, stream)?
        };
        Ok(Self {
            ptr,
            len,
            stream: stream.clone(),
            mr: Arc::clone(mr),
        })
    }

    /// Allocate and fill from host memory.
    pub fn from_host(bytes: &[u8], stream: &Stream, mr: &Arc<dyn MemoryResource>) -> Result<Self> {
        let buffer = Self::new(bytes.len(), stream, mr)?;
        mr.device().copy_to_device(buffer.ptr, bytes, stream)?;
        Ok(buffer)
    }

    /// Copy the whole buffer back to the host, waiting for pending work.
    pub fn to_host(&self) -> Result<Vec<u8>> {
        self.device().read(self.ptr, self.len, &self.stream)
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> &Device {
        self.mr.device()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn memory_resource(&self) -> &Arc<dyn MemoryResource> {
        &self.mr
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ptr != 0 {
            unsafe { self.mr.deallocate(self.ptr, self.len, &self.stream) };
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("len", &self.len)
            .field("device", self.device())
            .finish()
    }
}
