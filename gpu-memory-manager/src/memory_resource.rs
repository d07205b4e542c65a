use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::{Backend, Device};
use crate::error::Result;
use crate::host;
use crate::stream::Stream;
use crate::DevicePtr;

#[cfg(feature = "cuda")]
use crate::cuda;

/// Stream-ordered device allocator.
///
/// Memory returned by `allocate` may be used by work enqueued on `stream`
/// after the call; memory passed to `deallocate` may be reused once work
/// already enqueued on `stream` has finished.
pub trait MemoryResource: Send + Sync + fmt::Debug {
    fn device(&self) -> &Device;

    fn allocate(&self, bytes: usize, stream: &Stream) -> Result<DevicePtr>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this resource with the same `bytes`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: DevicePtr, bytes: usize, stream: &Stream);
}

/// Allocates straight from the device.
///
/// On CUDA this uses `cuMemAlloc` rather than the stream-ordered pool so that
/// every allocation can be exported through `cuIpcGetMemHandle`.
#[derive(Debug, Clone)]
pub struct DeviceMemoryResource {
    device: Device,
}

impl DeviceMemoryResource {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn shared(device: Device) -> Arc<dyn MemoryResource> {
        Arc::new(Self::new(device))
    }
}

impl MemoryResource for DeviceMemoryResource {
    fn device(&self) -> &Device {
        &self.device
    }

    fn allocate(&self, bytes: usize, _stream: &Stream) -> Result<DevicePtr> {
        match self.device.backend() {
            Backend::Host => host::allocate(bytes),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => cuda::allocate(dev, bytes),
        }
    }

    unsafe fn deallocate(&self, ptr: DevicePtr, _bytes: usize, _stream: &Stream) {
        match self.device.backend() {
            Backend::Host => host::deallocate(ptr),
            #[cfg(feature = "cuda")]
            Backend::Cuda(dev) => {
                if let Err(e) = cuda::deallocate(dev, ptr) {
                    warn!("Failed to free device memory at {:#x}: {}", ptr, e);
                }
            }
        }
    }
}

/// Snapshot of a [`TrackingResource`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationStats {
    pub allocations: usize,
    pub deallocations: usize,
    /// Frees of pointers that were not outstanding (double or foreign frees).
    pub invalid_deallocations: usize,
    pub outstanding: usize,
    pub outstanding_bytes: usize,
}

/// Wraps another resource and counts every allocation and free passing
/// through it. Frees of unknown pointers are counted and not forwarded.
pub struct TrackingResource {
    upstream: Arc<dyn MemoryResource>,
    live: Mutex<HashMap<DevicePtr, usize>>,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    invalid_deallocations: AtomicUsize,
}

impl TrackingResource {
    pub fn new(upstream: Arc<dyn MemoryResource>) -> Self {
        Self {
            upstream,
            live: Mutex::new(HashMap::new()),
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            invalid_deallocations: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> AllocationStats {
        let live = self.live.lock();
        AllocationStats {
            allocations: self.allocations.load(Ordering::SeqCst),
            deallocations: self.deallocations.load(Ordering::SeqCst),
            invalid_deallocations: self.invalid_deallocations.load(Ordering::SeqCst),
            outstanding: live.len(),
            outstanding_bytes: live.values().sum(),
        }
    }

    pub fn is_outstanding(&self, ptr: DevicePtr) -> bool {
        self.live.lock().contains_key(&ptr)
    }
}

impl MemoryResource for TrackingResource {
    fn device(&self) -> &Device {
        self.upstream.device()
    }

    fn allocate(&self, bytes: usize, stream: &Stream) -> Result<DevicePtr> {
        let ptr = self.upstream.allocate(bytes, stream)?;
        self.live.lock().insert(ptr, bytes);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        debug!("tracked allocate {} bytes at {:#x}", bytes, ptr);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: DevicePtr, bytes: usize, stream: &Stream) {
        let known = self.live.lock().remove(&ptr);
        match known {
            Some(size) => {
                if size != bytes {
                    warn!(
                        "free of {:#x} with size {} but it was allocated with {}",
                        ptr, bytes, size
                    );
                }
                self.deallocations.fetch_add(1, Ordering::SeqCst);
                self.upstream.deallocate(ptr, size, stream);
            }
            None => {
                warn!("free of {:#x} which is not outstanding", ptr);
                self.invalid_deallocations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl fmt::Debug for TrackingResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingResource")
            .field("upstream", &self.upstream)
            .field("stats", &self.stats())
            .finish()
    }
}
