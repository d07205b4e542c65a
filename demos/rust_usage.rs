use anyhow::{Context, Result};
use gpu_interop::{ColumnMetadata, DataType, DeviceColumn, InteropConfig, InteropEngine, Table, TypeId};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("GPU interop - Rust examples");

    // Example 1: Export to an Arrow device array
    arrow_device_example().await?;

    // Example 2: Share a table with another process
    ipc_example().await?;

    // Example 3: Allocation tracking
    tracking_example().await?;

    Ok(())
}

fn orders_table(engine: &InteropEngine) -> Result<(Table, Vec<ColumnMetadata>)> {
    let stream = engine.stream();
    let mr = engine.memory_resource();

    let order_id = DeviceColumn::from_slice(TypeId::Int64, &[1001i64, 1002, 1003, 1004], None, stream, mr)?;
    let amount = DeviceColumn::from_slice(
        DataType::decimal(TypeId::Decimal64, -2),
        &[1999i64, 4550, 120, 99999],
        Some(&[true, true, false, true]),
        stream,
        mr,
    )?;
    let express = DeviceColumn::from_bools(&[true, false, false, true], None, stream, mr)?;

    let table = engine.table(vec![order_id, amount, express])?;
    let metadata = vec![
        ColumnMetadata::new("order_id"),
        ColumnMetadata::new("amount"),
        ColumnMetadata::new("express"),
    ];
    Ok((table, metadata))
}

async fn arrow_device_example() -> Result<()> {
    info!("=== Example 1: Arrow device export ===");

    let engine = InteropEngine::new(InteropConfig::default())?;
    let (mut table, metadata) = orders_table(&engine)?;

    // The schema must be taken before the table hands its buffers over.
    let schema = engine
        .to_arrow_schema(&table.view(), &metadata)
        .context("building Arrow schema")?;
    let exported = engine
        .to_arrow_device(&mut table)
        .context("exporting to Arrow device array")?;
    exported.wait(engine.device())?;

    info!(
        "Exported schema {} with {} rows and {} columns on device type {}",
        schema.format(),
        exported.array.length,
        exported.array.n_children,
        exported.device_type
    );

    // Releasing the array returns its memory to the engine's resource.
    drop(exported);
    Ok(())
}

async fn ipc_example() -> Result<()> {
    info!("=== Example 2: Device-memory IPC ===");

    let engine = InteropEngine::new(InteropConfig::default())?;
    let (table, metadata) = orders_table(&engine)?;

    let buffer = engine
        .export_ipc(&table.view(), &metadata)
        .context("exporting IPC handles")?;
    info!("Transport buffer is {} bytes", buffer.len());

    // Normally the bytes travel to another process; here we import locally.
    let (view, owners) = engine.import_ipc(&buffer).context("importing IPC handles")?;
    let ids = view.column(0).data_to_host::<i64>(engine.device(), engine.stream())?;
    info!("Imported {} columns, order ids {:?}", owners.len(), ids);

    // The exporter's table must outlive every importer.
    drop(owners);
    drop(table);
    Ok(())
}

async fn tracking_example() -> Result<()> {
    info!("=== Example 3: Allocation tracking ===");

    let config = InteropConfig {
        track_allocations: true,
        ..Default::default()
    };
    let engine = InteropEngine::new(config)?;
    let (mut table, _) = orders_table(&engine)?;

    let exported = engine.to_arrow_device(&mut table)?;
    if let Some(stats) = engine.allocation_stats() {
        info!("After export: {} outstanding allocations ({} bytes)", stats.outstanding, stats.outstanding_bytes);
    }

    drop(exported);
    if let Some(stats) = engine.allocation_stats() {
        info!("After release: {} outstanding allocations", stats.outstanding);
    }
    Ok(())
}
