//! Device-resident columns to Arrow.
//!
//! This crate turns a [`Table`] of device columns into Arrow C Data Interface
//! descriptors without copying device memory:
//!
//! - [`to_arrow_schema`] builds the `ArrowSchema` tree from a [`TableView`]
//!   and caller-supplied [`ColumnMetadata`] names.
//! - [`to_arrow_device`] moves each column's buffers into an
//!   [`ArrowDeviceArray`] whose release callback frees them, and attaches an
//!   event the consumer can wait on before reading.
//!
//! Fixed-width columns are exported zero-copy. 32/64-bit decimals are widened
//! to 128 bits and `Bool8` columns are packed into bitmasks on the producer's
//! stream.

pub mod column;
pub mod device_array;
pub mod error;
pub mod ffi;
pub mod schema;
mod sync;
pub mod type_mapper;

pub use column::{
    ColumnContents, ColumnMetadata, ColumnView, DataType, DeviceColumn, Table, TableView, TypeId,
};
pub use device_array::{build_array, check_exportable, to_arrow_device};
pub use error::{InteropError, Result};
pub use ffi::{ArrowArray, ArrowDeviceArray};
pub use schema::{build_field, to_arrow_fields, to_arrow_schema};
pub use type_mapper::{from_arrow_type, to_arrow_type};
