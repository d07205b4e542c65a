//! Integration tests for the interop engine.
//!
//! Everything runs on the host backend, so exported arrays can be handed
//! straight to arrow-rs through the C Data Interface and checked there.

use std::ffi::c_void;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Decimal128Array, Float64Array, Int32Array, StructArray};
use arrow::ffi::{from_ffi, FFI_ArrowArray};
use arrow_schema::ffi::FFI_ArrowSchema;
use gpu_interop::{
    ArrowDeviceArray, ColumnMetadata, DataType, DeviceColumn, DeviceKind, InteropConfig, InteropEngine, InteropError,
    Table, TypeId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_engine() -> InteropEngine {
    InteropEngine::new(InteropConfig {
        track_allocations: true,
        ..Default::default()
    })
    .unwrap()
}

fn sales_table(engine: &InteropEngine) -> (Table, Vec<ColumnMetadata>) {
    let stream = engine.stream();
    let mr = engine.memory_resource();
    let ids = DeviceColumn::from_slice(
        TypeId::Int32,
        &[10i32, 20, 30, 40, 50],
        Some(&[true, true, false, true, true]),
        stream,
        mr,
    )
    .unwrap();
    let prices = DeviceColumn::from_slice(
        DataType::decimal(TypeId::Decimal32, -2),
        &[1999i32, -5, 0, 100, 123456],
        None,
        stream,
        mr,
    )
    .unwrap();
    let shipped = DeviceColumn::from_bools(
        &[true, false, true, true, false],
        Some(&[true, true, true, false, true]),
        stream,
        mr,
    )
    .unwrap();
    let weight = DeviceColumn::from_slice(TypeId::Float64, &[0.5f64, 1.0, 1.5, 2.0, 2.5], None, stream, mr).unwrap();

    let table = engine.table(vec![ids, prices, shipped, weight]).unwrap();
    let meta = vec![
        ColumnMetadata::new("id"),
        ColumnMetadata::new("price"),
        ColumnMetadata::new("shipped"),
        ColumnMetadata::new("weight"),
    ];
    (table, meta)
}

/// Hand the device array to arrow-rs. Only valid for host-resident arrays.
fn import_into_arrow(device_array: &mut ArrowDeviceArray, schema: &FFI_ArrowSchema) -> StructArray {
    let ffi_array = unsafe { FFI_ArrowArray::from_raw(&mut device_array.array as *mut _ as *mut FFI_ArrowArray) };
    let data = unsafe { from_ffi(ffi_array, schema) }.unwrap();
    StructArray::from(data)
}

// ---------------------------------------------------------------------------
// Arrow device export
// ---------------------------------------------------------------------------

#[test]
fn test_export_reads_back_through_arrow_rs() {
    let engine = make_engine();
    let (mut table, meta) = sales_table(&engine);
    let schema = engine.to_arrow_schema(&table.view(), &meta).unwrap();

    let mut exported = engine.to_arrow_device(&mut table).unwrap();
    assert_eq!(exported.device_kind(), Some(DeviceKind::Cpu));
    assert_eq!(exported.device_id, -1);
    exported.wait(engine.device()).unwrap();

    let batch = import_into_arrow(&mut exported, &schema);
    assert!(exported.array.is_released());
    assert_eq!(batch.len(), 5);
    assert_eq!(batch.num_columns(), 4);

    let ids = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
    assert_eq!(ids.null_count(), 1);
    assert!(ids.is_null(2));
    assert_eq!(ids.value(0), 10);
    assert_eq!(ids.value(4), 50);

    let prices = batch.column(1).as_any().downcast_ref::<Decimal128Array>().unwrap();
    assert_eq!(prices.precision(), 9);
    assert_eq!(prices.scale(), 2);
    assert_eq!(prices.values().to_vec(), vec![1999i128, -5, 0, 100, 123456]);

    let shipped = batch.column(2).as_any().downcast_ref::<BooleanArray>().unwrap();
    assert!(shipped.value(0));
    assert!(!shipped.value(1));
    assert!(shipped.value(2));
    assert!(shipped.is_null(3));
    assert!(!shipped.value(4));

    let weight = batch.column(3).as_any().downcast_ref::<Float64Array>().unwrap();
    assert_eq!(weight.values().to_vec(), vec![0.5, 1.0, 1.5, 2.0, 2.5]);
}

#[test]
fn test_export_moves_ownership_to_consumer() {
    let engine = make_engine();
    let (mut table, _) = sales_table(&engine);
    let id_ptr = table.column(0).data().unwrap().ptr();

    let exported = engine.to_arrow_device(&mut table).unwrap();
    // The table no longer owns anything.
    assert!(table.columns().iter().all(|c| c.data().is_none() && c.null_mask().is_none()));
    // Fixed-width buffers are handed over in place.
    assert_eq!(exported.array.child(0).unwrap().buffer(1), Some(id_ptr as *const c_void));

    let stats = engine.allocation_stats().unwrap();
    assert!(stats.outstanding > 0);
    drop(table);
    assert_eq!(engine.allocation_stats().unwrap().outstanding, stats.outstanding);

    drop(exported);
    let stats = engine.allocation_stats().unwrap();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.invalid_deallocations, 0);
}

#[test]
fn test_unsupported_column_leaves_table_intact() {
    let engine = make_engine();
    let stream = engine.stream();
    let mr = engine.memory_resource();
    let ints = DeviceColumn::from_slice(TypeId::Int32, &[1i32, 2], None, stream, mr).unwrap();
    let names = DeviceColumn::new_strings(&[Some("a"), None], stream, mr).unwrap();
    let mut table = engine.table(vec![ints, names]).unwrap();
    let before = engine.allocation_stats().unwrap();

    let err = engine.to_arrow_device(&mut table).unwrap_err();
    assert!(matches!(err, InteropError::UnsupportedType(_)));
    assert!(table.column(0).data().is_some());
    assert!(table.column(1).null_mask().is_some());
    assert_eq!(engine.allocation_stats().unwrap(), before);
}

#[test]
fn test_nested_columns_are_rejected_without_release() {
    let engine = make_engine();
    let stream = engine.stream();
    let mr = engine.memory_resource();
    let int16 = |values: &[i16]| DeviceColumn::from_slice(TypeId::Int16, values, None, stream, mr).unwrap();

    let dictionary = DeviceColumn::new_dictionary(
        DeviceColumn::from_slice(TypeId::Int32, &[0i32, 1, 0], None, stream, mr).unwrap(),
        int16(&[7, 9]),
        Some(&[true, true, false]),
        stream,
        mr,
    )
    .unwrap();
    let list = DeviceColumn::new_list(&[0, 1, 1, 3], int16(&[1, 2, 3]), None, stream, mr).unwrap();
    let s = DeviceColumn::new_struct(3, vec![int16(&[4, 5, 6])], None, stream, mr).unwrap();

    for (name, nested) in [("dictionary", dictionary), ("list", list), ("struct", s)] {
        let ints = DeviceColumn::from_slice(TypeId::Int32, &[1i32, 2, 3], None, stream, mr).unwrap();
        let num_children = nested.num_children();
        let mut table = engine.table(vec![ints, nested]).unwrap();
        let before = engine.allocation_stats().unwrap();

        let err = engine.to_arrow_device(&mut table).unwrap_err();
        assert!(matches!(err, InteropError::UnsupportedType(_)), "{}: {:?}", name, err);
        assert!(table.column(0).data().is_some(), "{}", name);
        assert_eq!(table.column(1).size(), 3, "{}", name);
        assert_eq!(table.column(1).num_children(), num_children, "{}", name);
        assert!(table.column(1).children().iter().all(|c| c.size() > 0), "{}", name);
        assert_eq!(engine.allocation_stats().unwrap(), before, "{}", name);
    }
}

#[test]
fn test_schema_rejects_mismatched_struct_metadata() {
    let engine = make_engine();
    let stream = engine.stream();
    let mr = engine.memory_resource();
    let a = DeviceColumn::from_slice(TypeId::Int64, &[1i64, 2], None, stream, mr).unwrap();
    let b = DeviceColumn::from_slice(TypeId::Int64, &[3i64, 4], None, stream, mr).unwrap();
    let s = DeviceColumn::new_struct(2, vec![a, b], None, stream, mr).unwrap();
    let table = engine.table(vec![s]).unwrap();

    let meta = [ColumnMetadata::new("point").child(ColumnMetadata::new("x"))];
    let err = engine.to_arrow_schema(&table.view(), &meta).unwrap_err();
    assert!(matches!(err, InteropError::ShapeMismatch(_)));

    let meta = [ColumnMetadata::with_children(
        "point",
        vec![ColumnMetadata::new("x"), ColumnMetadata::new("y")],
    )];
    let schema = engine.to_arrow_schema(&table.view(), &meta).unwrap();
    assert_eq!(schema.format(), "+s");
    assert_eq!(schema.child(0).format(), "+s");
}

// ---------------------------------------------------------------------------
// IPC
// ---------------------------------------------------------------------------

#[test]
fn test_ipc_round_trip_through_engine() {
    let engine = make_engine();
    let (table, meta) = sales_table(&engine);
    let buffer = engine.export_ipc(&table.view(), &meta).unwrap();

    let (view, owners) = engine.import_ipc(&buffer).unwrap();
    assert_eq!(view.num_rows(), 5);
    assert_eq!(owners.len(), 4);
    assert_eq!(owners[2].name(), "shipped");

    let device = engine.device();
    let stream = engine.stream();
    assert_eq!(
        view.column(0).data_to_host::<i32>(device, stream).unwrap(),
        vec![10, 20, 30, 40, 50]
    );
    // IPC shares storage as-is, so decimals keep their narrow width.
    assert_eq!(
        view.column(1).data_to_host::<i32>(device, stream).unwrap(),
        vec![1999, -5, 0, 100, 123456]
    );
    assert_eq!(
        view.column(2).validity_to_host(device, stream).unwrap(),
        Some(vec![true, true, true, false, true])
    );

    // Importer mappings do not keep the exporter's memory alive.
    drop(owners);
    assert!(table.column(0).data().is_some());
}

#[test]
fn test_relaxed_ipc_check_is_configurable() {
    let engine = InteropEngine::new(InteropConfig {
        require_device_memory_for_ipc: false,
        ..Default::default()
    })
    .unwrap();
    assert!(!engine.config().require_device_memory_for_ipc);
    let (table, meta) = sales_table(&engine);
    let buffer = engine.export_ipc(&table.view(), &meta).unwrap();
    assert!(!buffer.is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_exports_share_one_engine() {
    let engine = Arc::new(make_engine());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || {
                let values: Vec<i64> = (0..100).map(|v| v * i).collect();
                let col = DeviceColumn::from_slice(
                    TypeId::Int64,
                    values.as_slice(),
                    None,
                    engine.stream(),
                    engine.memory_resource(),
                )
                .unwrap();
                let mut table = engine.table(vec![col]).unwrap();
                engine.to_arrow_device(&mut table).unwrap()
            })
        })
        .collect();

    let mut arrays = Vec::new();
    for handle in handles {
        arrays.push(handle.await.unwrap());
    }
    assert!(arrays.iter().all(|a| a.array.length == 100 && a.array.n_children == 1));
    assert_eq!(engine.allocation_stats().unwrap().outstanding, 4);

    drop(arrays);
    assert_eq!(engine.allocation_stats().unwrap().outstanding, 0);
}
