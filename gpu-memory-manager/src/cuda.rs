//! CUDA driver backend.
//!
//! Thin wrappers over `cudarc`'s result layer. Anything the safe layer does not
//! cover (IPC, pointer attributes, event waits) goes through `sys::lib()`.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaDevice, DriverError};
use tracing::{debug, info};

use crate::device::MemoryKind;
use crate::error::{DeviceError, Result};
use crate::ipc::IpcMemHandle;
use crate::DevicePtr;

pub(crate) fn open(ordinal: usize) -> Result<Arc<CudaDevice>> {
    let dev = CudaDevice::new(ordinal)?;
    info!("CUDA device {} ready: {}", ordinal, dev.name().unwrap_or_default());
    Ok(dev)
}

pub(crate) fn allocate(dev: &Arc<CudaDevice>, bytes: usize) -> Result<DevicePtr> {
    dev.bind_to_thread()?;
    let ptr = unsafe { result::malloc_sync(bytes) }.map_err(|e| DeviceError::Allocation {
        bytes,
        reason: e.to_string(),
    })?;
    debug!("cuMemAlloc {} bytes at {:#x}", bytes, ptr);
    Ok(ptr)
}

pub(crate) fn deallocate(dev: &Arc<CudaDevice>, ptr: DevicePtr) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe { result::free_sync(ptr)? };
    Ok(())
}

pub(crate) fn copy_to_device(
    dev: &Arc<CudaDevice>,
    dst: DevicePtr,
    src: &[u8],
    stream: sys::CUstream,
) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe {
        result::memcpy_htod_async(dst, src, stream)?;
        // The source is borrowed; it must not be touched by the copy after we return.
        result::stream::synchronize(stream)?;
    }
    Ok(())
}

pub(crate) fn copy_to_host(
    dev: &Arc<CudaDevice>,
    src: DevicePtr,
    dst: &mut [u8],
    stream: sys::CUstream,
) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe {
        result::memcpy_dtoh_async(dst, src, stream)?;
        result::stream::synchronize(stream)?;
    }
    Ok(())
}

pub(crate) fn synchronize_stream(stream: sys::CUstream) -> Result<()> {
    unsafe { result::stream::synchronize(stream)? };
    Ok(())
}

pub(crate) fn memory_kind(dev: &Arc<CudaDevice>, ptr: DevicePtr) -> Result<MemoryKind> {
    dev.bind_to_thread()?;
    let mut memory_type = MaybeUninit::<u32>::zeroed();
    let status = unsafe {
        sys::lib().cuPointerGetAttribute(
            memory_type.as_mut_ptr() as *mut c_void,
            sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
            ptr,
        )
    };
    if status == sys::CUresult::CUDA_ERROR_INVALID_VALUE {
        return Ok(MemoryKind::Unregistered);
    }
    status.result()?;

    let mut managed = MaybeUninit::<u32>::zeroed();
    unsafe {
        sys::lib()
            .cuPointerGetAttribute(
                managed.as_mut_ptr() as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_IS_MANAGED,
                ptr,
            )
            .result()?;
    }

    let memory_type = unsafe { memory_type.assume_init() };
    let managed = unsafe { managed.assume_init() } != 0;
    Ok(if managed {
        MemoryKind::Managed
    } else if memory_type == sys::CUmemorytype::CU_MEMORYTYPE_HOST as u32 {
        MemoryKind::Pinned
    } else if memory_type == sys::CUmemorytype::CU_MEMORYTYPE_DEVICE as u32 {
        MemoryKind::Device
    } else {
        MemoryKind::Unregistered
    })
}

pub(crate) fn address_range(dev: &Arc<CudaDevice>, ptr: DevicePtr) -> Result<(DevicePtr, usize)> {
    dev.bind_to_thread()?;
    let mut base: sys::CUdeviceptr = 0;
    let mut size: usize = 0;
    unsafe {
        sys::lib()
            .cuMemGetAddressRange_v2(&mut base, &mut size, ptr)
            .result()?;
    }
    Ok((base, size))
}

pub(crate) fn create_event(dev: &Arc<CudaDevice>) -> Result<*mut c_void> {
    dev.bind_to_thread()?;
    let event = result::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
        .map_err(|e| DeviceError::Event(e.to_string()))?;
    Ok(event as *mut c_void)
}

pub(crate) fn record_event(
    dev: &Arc<CudaDevice>,
    event: *mut c_void,
    stream: sys::CUstream,
) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe { result::event::record(event as sys::CUevent, stream) }
        .map_err(|e| DeviceError::Event(e.to_string()))
}

pub(crate) fn synchronize_event(dev: &Arc<CudaDevice>, event: *mut c_void) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe { sys::lib().cuEventSynchronize(event as sys::CUevent) }
        .result()
        .map_err(|e| DeviceError::Event(e.to_string()))
}

pub(crate) fn destroy_event(dev: &Arc<CudaDevice>, event: *mut c_void) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe { result::event::destroy(event as sys::CUevent) }
        .map_err(|e| DeviceError::Event(e.to_string()))
}

pub(crate) fn ipc_get_handle(dev: &Arc<CudaDevice>, base: DevicePtr) -> Result<IpcMemHandle> {
    dev.bind_to_thread()?;
    let mut handle = MaybeUninit::<sys::CUipcMemHandle>::zeroed();
    unsafe {
        sys::lib()
            .cuIpcGetMemHandle(handle.as_mut_ptr(), base)
            .result()
            .map_err(ipc_error)?;
    }
    let handle = unsafe { handle.assume_init() };
    let mut bytes = [0u8; crate::IPC_HANDLE_SIZE];
    for (dst, src) in bytes.iter_mut().zip(handle.reserved.iter()) {
        *dst = *src as u8;
    }
    Ok(IpcMemHandle::from_array(bytes))
}

pub(crate) fn ipc_open(dev: &Arc<CudaDevice>, handle: &IpcMemHandle) -> Result<DevicePtr> {
    dev.bind_to_thread()?;
    let mut raw = unsafe { MaybeUninit::<sys::CUipcMemHandle>::zeroed().assume_init() };
    for (dst, src) in raw.reserved.iter_mut().zip(handle.as_bytes().iter()) {
        *dst = *src as _;
    }
    let mut ptr: sys::CUdeviceptr = 0;
    unsafe {
        sys::lib()
            .cuIpcOpenMemHandle_v2(
                &mut ptr,
                raw,
                sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32,
            )
            .result()
            .map_err(ipc_error)?;
    }
    Ok(ptr)
}

pub(crate) fn ipc_close(dev: &Arc<CudaDevice>, base: DevicePtr) -> Result<()> {
    dev.bind_to_thread()?;
    unsafe { sys::lib().cuIpcCloseMemHandle(base) }
        .result()
        .map_err(ipc_error)
}

fn ipc_error(e: DriverError) -> DeviceError {
    DeviceError::Ipc(e.to_string())
}
