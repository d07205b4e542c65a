use arrow_interop::{to_arrow_fields, ColumnMetadata, ColumnView, InteropError, Result, TableView, TypeId};
use gpu_memory_manager::{Device, DeviceError, DevicePtr, MemoryKind};
use tracing::{debug, info};

use crate::transport::{BufferDescriptor, ColumnHandles, DeviceDescriptor, TransportBuffer, TransportMessage, FORMAT_VERSION};

/// Knobs for [`export_ipc_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcExportOptions {
    /// Reject buffers that are not plain device allocations (managed,
    /// pinned host or unregistered memory) before requesting a handle.
    pub require_device_memory: bool,
}

impl Default for IpcExportOptions {
    fn default() -> Self {
        Self {
            require_device_memory: true,
        }
    }
}

/// [`export_ipc_with`] using the default options.
pub fn export_ipc(table: &TableView, metadata: &[ColumnMetadata]) -> Result<TransportBuffer> {
    export_ipc_with(table, metadata, &IpcExportOptions::default())
}

/// Package IPC handles for every buffer of `table`, plus its Arrow schema,
/// into a transport buffer. No device memory is copied.
pub fn export_ipc_with(
    table: &TableView,
    metadata: &[ColumnMetadata],
    options: &IpcExportOptions,
) -> Result<TransportBuffer> {
    for column in table.columns() {
        check_shareable(column)?;
    }
    let schema = to_arrow_fields(table, metadata)?;

    let device = table.device();
    let columns = table
        .columns()
        .iter()
        .map(|column| export_column(device, column, options))
        .collect::<Result<Vec<_>>>()?;

    let message = TransportMessage {
        version: FORMAT_VERSION,
        device: DeviceDescriptor {
            device_type: device.kind().arrow_device_type(),
            device_id: device.id(),
        },
        schema,
        columns,
    };
    let buffer = message.encode()?;
    info!(
        "Exported {} columns x {} rows over IPC ({} bytes)",
        table.num_columns(),
        table.num_rows(),
        buffer.len()
    );
    Ok(buffer)
}

/// Fixed-width leaves, booleans, decimals and time types, and struct/list
/// trees of them.
fn check_shareable(column: &ColumnView) -> Result<()> {
    match column.dtype().id() {
        TypeId::String | TypeId::Dictionary32 | TypeId::Empty => Err(InteropError::UnsupportedType(
            format!("{:?} columns cannot be exported over IPC", column.dtype().id()),
        )),
        // Exported as an untyped Null field, which has no column to import into.
        TypeId::Struct if column.num_children() == 0 => Err(InteropError::UnsupportedType(
            "struct column without fields cannot be exported over IPC".into(),
        )),
        TypeId::List if column.num_children() != 2 => Err(InteropError::ShapeMismatch(format!(
            "list column has {} children, expected offsets and element",
            column.num_children()
        ))),
        TypeId::List | TypeId::Struct => column.children().iter().try_for_each(check_shareable),
        _ => Ok(()),
    }
}

fn export_column(device: &Device, column: &ColumnView, options: &IpcExportOptions) -> Result<ColumnHandles> {
    let data = match column.data() {
        Some(ptr) => Some(describe(device, ptr, column.data_bytes().unwrap_or(0), options)?),
        None => None,
    };
    let validity = match column.null_mask() {
        Some(ptr) => Some(describe(device, ptr, column.null_mask_bytes(), options)?),
        None => None,
    };
    let children = column
        .children()
        .iter()
        .map(|child| export_column(device, child, options))
        .collect::<Result<Vec<_>>>()?;

    Ok(ColumnHandles {
        size: column.size() as u64,
        null_count: column.null_count() as u64,
        data,
        validity,
        children,
    })
}

fn describe(device: &Device, ptr: DevicePtr, size: usize, options: &IpcExportOptions) -> Result<BufferDescriptor> {
    if options.require_device_memory {
        let kind = device.memory_kind(ptr)?;
        if kind != MemoryKind::Device {
            return Err(DeviceError::UnsupportedMemory(format!(
                "{:#x} is {:?} memory and cannot be shared over IPC",
                ptr, kind
            ))
            .into());
        }
    }
    let export = device.ipc_export(ptr)?;
    debug!("IPC descriptor for {:#x}: offset {} size {}", ptr, export.offset, size);
    Ok(BufferDescriptor {
        handle: export.handle.as_bytes().to_vec(),
        offset: export.offset as u64,
        size: size as u64,
    })
}
