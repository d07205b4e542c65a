//! Arrow C Data Interface and C Device Data Interface structures.
//!
//! [`ArrowArray`] has the exact `struct ArrowArray` layout (and is therefore
//! interchangeable with arrow-rs' `FFI_ArrowArray`). Nodes produced here own
//! their buffers through `private_data`; calling `release` (or dropping the
//! Rust value) frees them and, for the top-level node, the sync event.

use std::ffi::c_void;
use std::ptr;

use arrow_buffer::Buffer;
use gpu_memory_manager::{Device, DeviceKind, Event};

use crate::error::Result;

#[repr(C)]
#[derive(Debug)]
pub struct ArrowArray {
    pub length: i64,
    pub null_count: i64,
    pub offset: i64,
    pub n_buffers: i64,
    pub n_children: i64,
    pub buffers: *mut *const c_void,
    pub children: *mut *mut ArrowArray,
    pub dictionary: *mut ArrowArray,
    pub release: Option<unsafe extern "C" fn(arg1: *mut ArrowArray)>,
    pub private_data: *mut c_void,
}

// The node exclusively owns everything behind its pointers.
unsafe impl Send for ArrowArray {}

struct ArrayPrivateData {
    /// Keeps the slot owners alive; `None` slots are absent buffers.
    _buffers: Vec<Option<Buffer>>,
    buffer_ptrs: Box<[*const c_void]>,
    children: Box<[*mut ArrowArray]>,
    _sync: Option<Event>,
}

unsafe extern "C" fn release_array(array: *mut ArrowArray) {
    if array.is_null() {
        return;
    }
    let array = &mut *array;
    if array.release.is_none() {
        return;
    }
    let private = Box::from_raw(array.private_data as *mut ArrayPrivateData);
    for child in private.children.iter() {
        // A consumer may have moved a child out and released it already;
        // dropping the box releases it only if that has not happened.
        drop(Box::from_raw(*child));
    }
    drop(private);
    array.private_data = ptr::null_mut();
    array.release = None;
}

impl ArrowArray {
    /// A released (empty) node.
    pub fn empty() -> Self {
        Self {
            length: 0,
            null_count: 0,
            offset: 0,
            n_buffers: 0,
            n_children: 0,
            buffers: ptr::null_mut(),
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }

    /// A node owning `buffers` (in Arrow slot order) and `children`.
    pub(crate) fn new(
        length: usize,
        null_count: usize,
        buffers: Vec<Option<Buffer>>,
        children: Vec<ArrowArray>,
        sync: Option<Event>,
    ) -> Self {
        let buffer_ptrs: Box<[*const c_void]> = buffers
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map_or(ptr::null(), |b| b.as_ptr() as *const c_void)
            })
            .collect();
        let children: Box<[*mut ArrowArray]> = children
            .into_iter()
            .map(|child| Box::into_raw(Box::new(child)))
            .collect();

        let mut private = Box::new(ArrayPrivateData {
            _buffers: buffers,
            buffer_ptrs,
            children,
            _sync: sync,
        });
        let n_buffers = private.buffer_ptrs.len() as i64;
        let n_children = private.children.len() as i64;
        let buffers_ptr = private.buffer_ptrs.as_mut_ptr();
        let children_ptr = private.children.as_mut_ptr();

        Self {
            length: length as i64,
            null_count: null_count as i64,
            offset: 0,
            n_buffers,
            n_children,
            buffers: buffers_ptr,
            children: children_ptr,
            dictionary: ptr::null_mut(),
            release: Some(release_array),
            private_data: Box::into_raw(private) as *mut c_void,
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Pointer held in buffer slot `i`, null when the slot is empty.
    pub fn buffer(&self, i: usize) -> Option<*const c_void> {
        if self.is_released() || i >= self.n_buffers as usize {
            return None;
        }
        Some(unsafe { *self.buffers.add(i) })
    }

    pub fn child(&self, i: usize) -> Option<&ArrowArray> {
        if self.is_released() || i >= self.n_children as usize {
            return None;
        }
        unsafe { (*self.children.add(i)).as_ref() }
    }
}

impl Drop for ArrowArray {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            unsafe { release(self) };
        }
    }
}

/// `struct ArrowDeviceArray` from the Arrow C Device Data Interface.
#[repr(C)]
#[derive(Debug)]
pub struct ArrowDeviceArray {
    pub array: ArrowArray,
    pub device_id: i64,
    pub device_type: i32,
    /// Points at the backend event handle (`CUevent*` on CUDA); null means
    /// the data is ready.
    pub sync_event: *mut c_void,
    pub reserved: [i64; 3],
}

// `sync_event` points into the top-level array's private data.
unsafe impl Send for ArrowDeviceArray {}

impl ArrowDeviceArray {
    pub fn device_kind(&self) -> Option<DeviceKind> {
        DeviceKind::from_arrow_device_type(self.device_type)
    }

    /// Block until the producing work has completed.
    pub fn wait(&self, device: &Device) -> Result<()> {
        unsafe { device.wait_sync_event(self.sync_event)? };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_drops_children_and_marks_released() {
        let buffer = Buffer::from_vec(vec![1u8, 2, 3, 4]);
        let child = ArrowArray::new(4, 0, vec![None, Some(buffer)], Vec::new(), None);
        let mut parent = ArrowArray::new(4, 0, vec![None], vec![child], None);

        assert_eq!(parent.n_children, 1);
        assert_eq!(parent.child(0).unwrap().n_buffers, 2);
        assert!(parent.child(0).unwrap().buffer(0).unwrap().is_null());
        assert!(!parent.child(0).unwrap().buffer(1).unwrap().is_null());

        let release = parent.release.unwrap();
        unsafe { release(&mut parent) };
        assert!(parent.is_released());
        assert!(parent.child(0).is_none());
        // Releasing twice is a no-op.
        unsafe { release_array(&mut parent) };
    }

    #[test]
    fn layout_matches_c_abi() {
        assert_eq!(std::mem::size_of::<ArrowArray>(), 80);
        assert_eq!(std::mem::size_of::<ArrowDeviceArray>(), 80 + 8 + 8 + 8 + 24);
    }
}
