//! Device memory management for columnar interop.
//!
//! A [`Device`] is either the always-available host-resident backend (buffers
//! live in host RAM and device pointers are plain host addresses) or, with the
//! `cuda` feature, a CUDA device driven through `cudarc`. On top of it this
//! crate provides:
//!
//! - [`Stream`] / [`Event`] – ordered device work queues and completion tokens
//! - [`MemoryResource`] – stream-ordered allocators, with a counting
//!   [`TrackingResource`] wrapper
//! - [`DeviceBuffer`] – an owning device allocation freed on drop
//! - [`IpcMemHandle`] / [`ImportedPtr`] – shareable memory handles and the
//!   owning side of an opened handle

pub mod buffer;
pub mod device;
pub mod error;
pub mod host;
pub mod ipc;
pub mod memory_resource;
pub mod stream;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use buffer::DeviceBuffer;
pub use device::{Backend, Device, DeviceKind, MemoryKind};
pub use error::{DeviceError, Result};
pub use ipc::{ImportedPtr, IpcExport, IpcMemHandle, IPC_HANDLE_SIZE};
pub use memory_resource::{AllocationStats, DeviceMemoryResource, MemoryResource, TrackingResource};
pub use stream::{Event, Stream};

/// Raw device address (`CUdeviceptr` on CUDA, a host address on the host backend).
pub type DevicePtr = u64;
