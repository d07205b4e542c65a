//! Conversion of device columns into Arrow device arrays.
//!
//! Buffers are moved, not copied: each Arrow buffer slot is an
//! `arrow_buffer::Buffer` whose owner is the original [`DeviceBuffer`], so the
//! memory goes back to its resource when the consumer releases the array.
//! Only decimals narrower than 128 bits and `Bool8` need new storage, which
//! the conversion kernels allocate on the caller's stream.

use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::Arc;

use arrow_buffer::Buffer;
use gpu_kernel_compiler::{pack_bools, widen_decimals, DecimalWidth};
use gpu_memory_manager::{DeviceBuffer, DeviceError, Event, MemoryResource, Stream};
use tracing::{debug, info};

use crate::column::{DeviceColumn, Table, TypeId};
use crate::error::{InteropError, Result};
use crate::ffi::{ArrowArray, ArrowDeviceArray};
use crate::sync;

/// Fail if `column` cannot be exported as a flat Arrow device array.
pub fn check_exportable(column: &DeviceColumn) -> Result<()> {
    match column.dtype().id() {
        TypeId::String
        | TypeId::List
        | TypeId::Dictionary32
        | TypeId::Struct
        | TypeId::DurationDays => Err(InteropError::UnsupportedType(format!(
            "{:?} columns cannot be exported to an Arrow device array",
            column.dtype().id()
        ))),
        _ => Ok(()),
    }
}

/// Hand a device buffer to an Arrow slot. The slot owns the buffer from now on.
fn into_slot(buffer: DeviceBuffer) -> Option<Buffer> {
    let ptr = NonNull::new(buffer.ptr() as *mut u8)?;
    let len = buffer.len();
    // Device memory is never dereferenced on the host through this Buffer.
    Some(unsafe { Buffer::from_custom_allocation(ptr, len, Arc::new(AssertUnwindSafe(buffer))) })
}

/// Convert one column, moving its buffers into the returned node.
///
/// On error the column is left untouched.
pub fn build_array(
    column: &mut DeviceColumn,
    stream: &Stream,
    mr: &Arc<dyn MemoryResource>,
) -> Result<ArrowArray> {
    check_exportable(column)?;
    let id = column.dtype().id();
    let size = column.size();
    let null_count = column.null_count();

    if id == TypeId::Empty {
        column.release();
        return Ok(ArrowArray::new(size, size, Vec::new(), Vec::new(), None));
    }

    let data_ptr = column.data().map_or(0, DeviceBuffer::ptr);
    let replacement = match id {
        TypeId::Decimal32 => Some(widen_decimals(data_ptr, DecimalWidth::Bits32, size, stream, mr)?),
        TypeId::Decimal64 => Some(widen_decimals(data_ptr, DecimalWidth::Bits64, size, stream, mr)?),
        TypeId::Bool8 => Some(pack_bools(data_ptr, size, stream, mr)?),
        _ => None,
    };

    let contents = column.release();
    let data = match replacement {
        Some(converted) => {
            debug!("{:?} column of {} rows converted into new storage", id, size);
            Some(converted)
        }
        None => contents.data,
    };

    let buffers = vec![
        contents.null_mask.and_then(into_slot),
        data.and_then(into_slot),
    ];
    Ok(ArrowArray::new(size, null_count, buffers, Vec::new(), None))
}

/// Export every column of `table` as one struct-typed Arrow device array.
///
/// All columns are checked before any is touched; on success each column of
/// `table` has been released. The returned array carries an event recorded on
/// `stream` after all conversion work.
pub fn to_arrow_device(
    table: &mut Table,
    stream: &Stream,
    mr: &Arc<dyn MemoryResource>,
) -> Result<ArrowDeviceArray> {
    if mr.device() != table.device() || stream.device() != table.device() {
        return Err(DeviceError::InvalidArgument(format!(
            "table lives on {:?} but the stream/resource belong to {:?}/{:?}",
            table.device(),
            stream.device(),
            mr.device()
        ))
        .into());
    }
    for column in table.columns() {
        check_exportable(column)?;
    }

    let device = table.device().clone();
    let rows = table.num_rows();
    info!(
        "Exporting {} columns x {} rows to an Arrow device array on {:?}",
        table.num_columns(),
        rows,
        device
    );

    let event = Event::new(&device)?;
    let children = table
        .columns_mut()
        .iter_mut()
        .map(|column| build_array(column, stream, mr))
        .collect::<Result<Vec<_>>>()?;

    sync::attach(&device, stream, event, rows, children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::DataType;
    use gpu_memory_manager::{Device, DeviceMemoryResource, TrackingResource};

    fn host() -> (Device, Stream, Arc<dyn MemoryResource>) {
        let device = Device::host();
        let stream = device.create_stream().unwrap();
        let mr = DeviceMemoryResource::shared(device.clone());
        (device, stream, mr)
    }

    fn read_slot(device: &Device, stream: &Stream, array: &ArrowArray, slot: usize, len: usize) -> Vec<u8> {
        let ptr = array.buffer(slot).unwrap() as u64;
        device.read(ptr, len, stream).unwrap()
    }

    #[test]
    fn fixed_width_is_zero_copy() {
        let (device, stream, mr) = host();
        let mut col = DeviceColumn::from_slice(
            TypeId::Int64,
            &[10i64, 20, 30],
            Some(&[true, false, true]),
            &stream,
            &mr,
        )
        .unwrap();
        let data_ptr = col.data().unwrap().ptr();
        let mask_ptr = col.null_mask().unwrap().ptr();

        let array = build_array(&mut col, &stream, &mr).unwrap();
        assert_eq!(array.length, 3);
        assert_eq!(array.null_count, 1);
        assert_eq!(array.buffer(0).unwrap() as u64, mask_ptr);
        assert_eq!(array.buffer(1).unwrap() as u64, data_ptr);
        assert!(col.data().is_none());
        assert_eq!(col.size(), 0);

        let values: Vec<i64> = bytemuck::pod_collect_to_vec(&read_slot(&device, &stream, &array, 1, 24));
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn decimal32_is_widened() {
        let (device, stream, mr) = host();
        let mut col = DeviceColumn::from_slice(
            DataType::decimal(TypeId::Decimal32, -2),
            &[-5i32, 7],
            None,
            &stream,
            &mr,
        )
        .unwrap();
        let array = build_array(&mut col, &stream, &mr).unwrap();
        assert!(array.buffer(0).unwrap().is_null());

        let bytes = read_slot(&device, &stream, &array, 1, 32);
        let values: Vec<i128> = bytes.chunks_exact(16).map(|c| i128::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(values, vec![-5, 7]);
    }

    #[test]
    fn bool8_is_packed() {
        let (device, stream, mr) = host();
        let mut col = DeviceColumn::from_bools(&[true, false, true, true], None, &stream, &mr).unwrap();
        let array = build_array(&mut col, &stream, &mr).unwrap();
        assert_eq!(read_slot(&device, &stream, &array, 1, 1), vec![0b1101]);
    }

    #[test]
    fn empty_column_becomes_null_array() {
        let (_, stream, mr) = host();
        let mut col = DeviceColumn::new_empty(5);
        let array = build_array(&mut col, &stream, &mr).unwrap();
        assert_eq!(array.length, 5);
        assert_eq!(array.null_count, 5);
        assert_eq!(array.n_buffers, 0);
    }

    #[test]
    fn unsupported_column_leaves_table_intact() {
        let (device, stream, mr) = host();
        let ints = DeviceColumn::from_slice(TypeId::Int32, &[1i32, 2], None, &stream, &mr).unwrap();
        let strings = DeviceColumn::new_strings(&[Some("a"), Some("b")], &stream, &mr).unwrap();
        let mut table = Table::new(device, vec![ints, strings]).unwrap();

        let err = to_arrow_device(&mut table, &stream, &mr).unwrap_err();
        assert!(matches!(err, InteropError::UnsupportedType(_)));
        assert_eq!(table.column(0).size(), 2);
        assert!(table.column(0).data().is_some());
        assert!(table.column(1).data().is_some());
    }

    #[test]
    fn release_frees_every_buffer_once() {
        let (device, stream, _) = host();
        let tracker = Arc::new(TrackingResource::new(DeviceMemoryResource::shared(device.clone())));
        let mr: Arc<dyn MemoryResource> = tracker.clone();

        let a = DeviceColumn::from_slice(TypeId::Float32, &[1.0f32, 2.0], Some(&[true, false]), &stream, &mr).unwrap();
        let b = DeviceColumn::from_slice(DataType::decimal(TypeId::Decimal64, 0), &[1i64, -1], None, &stream, &mr).unwrap();
        let c = DeviceColumn::from_bools(&[false, true], None, &stream, &mr).unwrap();
        let mut table = Table::new(device, vec![a, b, c]).unwrap();

        let exported = to_arrow_device(&mut table, &stream, &mr).unwrap();
        // Narrow decimal and byte booleans were replaced and freed.
        let stats = tracker.stats();
        assert_eq!(stats.deallocations, 2);
        assert_eq!(stats.outstanding, 4);
        assert!(table.columns().iter().all(|c| c.size() == 0 && c.data().is_none()));

        drop(exported);
        let stats = tracker.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.invalid_deallocations, 0);
        assert_eq!(stats.allocations, stats.deallocations);
    }

    #[test]
    fn empty_table_exports_empty_struct() {
        let (device, stream, mr) = host();
        let mut table = Table::new(device, Vec::new()).unwrap();
        let exported = to_arrow_device(&mut table, &stream, &mr).unwrap();
        assert_eq!(exported.array.n_children, 0);
        assert_eq!(exported.array.length, 0);
    }
}
