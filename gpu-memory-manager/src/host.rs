//! Host-resident backend.
//!
//! Allocations come from the global allocator with 64-byte alignment and are
//! registered in a process-wide table, so pointer queries, address ranges and
//! IPC handles behave like their driver counterparts. IPC handles produced
//! here can only be opened inside the exporting process.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::device::MemoryKind;
use crate::error::{DeviceError, Result};
use crate::ipc::{IpcMemHandle, IPC_HANDLE_SIZE};
use crate::DevicePtr;

pub const HOST_ALIGNMENT: usize = 64;

const IPC_MAGIC: &[u8; 8] = b"HOSTIPC\0";

/// base address -> requested size
static ALLOCATIONS: LazyLock<DashMap<DevicePtr, usize>> = LazyLock::new(DashMap::new);
/// base address -> number of outstanding opens
static OPENED: LazyLock<DashMap<DevicePtr, usize>> = LazyLock::new(DashMap::new);

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

fn layout_for(bytes: usize) -> Result<Layout> {
    Layout::from_size_align(bytes.max(1), HOST_ALIGNMENT).map_err(|e| DeviceError::Allocation {
        bytes,
        reason: e.to_string(),
    })
}

pub(crate) fn allocate(bytes: usize) -> Result<DevicePtr> {
    let layout = layout_for(bytes)?;
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(DeviceError::Allocation {
            bytes,
            reason: "host allocator returned null".into(),
        });
    }
    let addr = ptr as DevicePtr;
    ALLOCATIONS.insert(addr, bytes);
    debug!("host allocate {} bytes at {:#x}", bytes, addr);
    Ok(addr)
}

/// # Safety
///
/// `ptr` must have been returned by [`allocate`] and not freed since.
pub(crate) unsafe fn deallocate(ptr: DevicePtr) {
    let Some((_, bytes)) = ALLOCATIONS.remove(&ptr) else {
        warn!("host deallocate of unknown pointer {:#x}", ptr);
        return;
    };
    if OPENED.contains_key(&ptr) {
        warn!("freeing {:#x} while IPC mappings of it are still open", ptr);
    }
    debug!("host free {} bytes at {:#x}", bytes, ptr);
    if let Ok(layout) = layout_for(bytes) {
        alloc::dealloc(ptr as *mut u8, layout);
    }
}

pub(crate) fn address_range(ptr: DevicePtr) -> Option<(DevicePtr, usize)> {
    if let Some(len) = ALLOCATIONS.get(&ptr) {
        return Some((ptr, *len));
    }
    ALLOCATIONS
        .iter()
        .find(|entry| ptr >= *entry.key() && ptr < *entry.key() + *entry.value() as u64)
        .map(|entry| (*entry.key(), *entry.value()))
}

pub(crate) fn memory_kind(ptr: DevicePtr) -> MemoryKind {
    if address_range(ptr).is_some() {
        MemoryKind::Device
    } else {
        MemoryKind::Unregistered
    }
}

/// Rejects copies that would run past the end of the owning allocation.
pub(crate) fn check_range(ptr: DevicePtr, len: usize) -> Result<()> {
    let (base, size) = address_range(ptr).ok_or_else(|| {
        DeviceError::InvalidArgument(format!("{:#x} is not inside a live allocation", ptr))
    })?;
    if ptr + len as u64 > base + size as u64 {
        return Err(DeviceError::InvalidArgument(format!(
            "range {:#x}+{} overruns allocation {:#x}+{}",
            ptr, len, base, size
        )));
    }
    Ok(())
}

pub(crate) fn create_event() -> *mut c_void {
    NEXT_EVENT.fetch_add(1, Ordering::Relaxed) as usize as *mut c_void
}

pub(crate) fn ipc_get_handle(base: DevicePtr) -> Result<IpcMemHandle> {
    let len = ALLOCATIONS
        .get(&base)
        .map(|len| *len)
        .ok_or_else(|| DeviceError::Ipc(format!("{:#x} is not an allocation base", base)))?;
    let mut bytes = [0u8; IPC_HANDLE_SIZE];
    bytes[..8].copy_from_slice(IPC_MAGIC);
    bytes[8..12].copy_from_slice(&std::process::id().to_le_bytes());
    bytes[12..20].copy_from_slice(&base.to_le_bytes());
    bytes[20..28].copy_from_slice(&(len as u64).to_le_bytes());
    Ok(IpcMemHandle::from_array(bytes))
}

pub(crate) fn ipc_open(handle: &IpcMemHandle) -> Result<DevicePtr> {
    let bytes = handle.as_bytes();
    if &bytes[..8] != IPC_MAGIC {
        return Err(DeviceError::Ipc("not a host IPC handle".into()));
    }
    let pid = u32::from_le_bytes(bytes[8..12].try_into().unwrap_or_default());
    if pid != std::process::id() {
        return Err(DeviceError::Ipc(format!(
            "host IPC handle belongs to process {}",
            pid
        )));
    }
    let base = u64::from_le_bytes(bytes[12..20].try_into().unwrap_or_default());
    let len = u64::from_le_bytes(bytes[20..28].try_into().unwrap_or_default()) as usize;
    match ALLOCATIONS.get(&base) {
        Some(live) if *live == len => {}
        _ => {
            return Err(DeviceError::Ipc(format!(
                "allocation {:#x} behind the handle is no longer live",
                base
            )))
        }
    }
    *OPENED.entry(base).or_insert(0) += 1;
    Ok(base)
}

pub(crate) fn ipc_close(base: DevicePtr) -> Result<()> {
    let remaining = {
        let mut count = OPENED
            .get_mut(&base)
            .ok_or_else(|| DeviceError::Ipc(format!("{:#x} has no open IPC mapping", base)))?;
        *count -= 1;
        *count
    };
    if remaining == 0 {
        OPENED.remove(&base);
    }
    Ok(())
}

/// Number of outstanding opens of the host IPC handle for `base`.
pub fn open_ipc_mappings(base: DevicePtr) -> usize {
    OPENED.get(&base).map(|count| *count).unwrap_or(0)
}

/// Whether `ptr` is the base of a live host allocation.
pub fn is_live_allocation(ptr: DevicePtr) -> bool {
    ALLOCATIONS.contains_key(&ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_aligned_and_zeroed() {
        let ptr = allocate(100).unwrap();
        assert_eq!(ptr % HOST_ALIGNMENT as u64, 0);
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, 100) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert_eq!(address_range(ptr + 40), Some((ptr, 100)));
        unsafe { deallocate(ptr) };
        assert!(!is_live_allocation(ptr));
    }

    #[test]
    fn range_check_rejects_overrun() {
        let ptr = allocate(16).unwrap();
        assert!(check_range(ptr + 8, 8).is_ok());
        assert!(check_range(ptr + 8, 9).is_err());
        unsafe { deallocate(ptr) };
    }

    #[test]
    fn ipc_open_close_counts() {
        let ptr = allocate(32).unwrap();
        let handle = ipc_get_handle(ptr).unwrap();
        assert_eq!(ipc_open(&handle).unwrap(), ptr);
        assert_eq!(ipc_open(&handle).unwrap(), ptr);
        assert_eq!(open_ipc_mappings(ptr), 2);
        ipc_close(ptr).unwrap();
        ipc_close(ptr).unwrap();
        assert_eq!(open_ipc_mappings(ptr), 0);
        assert!(ipc_close(ptr).is_err());
        unsafe { deallocate(ptr) };
        assert!(ipc_open(&handle).is_err());
    }
}
