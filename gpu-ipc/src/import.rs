use std::sync::Arc;

use arrow_interop::{from_arrow_type, ColumnView, InteropError, Result, TableView, TypeId};
use arrow_schema::DataType as ArrowType;
use gpu_memory_manager::{Device, DeviceKind, ImportedPtr, IpcMemHandle};
use tracing::{debug, info};

use crate::imported_column::ImportedColumn;
use crate::transport::{BufferDescriptor, ColumnHandles, TransportBuffer, TransportMessage};

/// Re-open every handle in `buffer` and describe the shared columns.
///
/// The returned view points into mappings owned by the returned
/// [`ImportedColumn`]s; it must not be dereferenced once they are dropped.
/// If any handle fails to open, the ones already opened are closed.
pub fn import_ipc(buffer: &TransportBuffer) -> Result<(TableView, Vec<Arc<ImportedColumn>>)> {
    let message = TransportMessage::decode(buffer)?;
    let kind = DeviceKind::from_arrow_device_type(message.device.device_type).ok_or_else(|| {
        InteropError::Transport(format!("unknown device type {}", message.device.device_type))
    })?;
    let device = Device::from_descriptor(kind, message.device.device_id)?;

    let fields = message.schema.fields();
    if fields.len() != message.columns.len() {
        return Err(InteropError::Transport(format!(
            "schema has {} fields but {} handle trees",
            fields.len(),
            message.columns.len()
        )));
    }

    let (views, owners): (Vec<_>, Vec<_>) = fields
        .iter()
        .zip(&message.columns)
        .map(|(field, handles)| import_column(&device, field.name(), field.data_type(), handles))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .map(|(view, owner)| (view, Arc::new(owner)))
        .unzip();

    info!("Imported {} columns over IPC on {:?}", views.len(), device);
    Ok((TableView::new(device, views), owners))
}

/// Fail unless `descriptor` spans at least `needed` bytes.
fn require(name: &str, what: &str, descriptor: &BufferDescriptor, needed: Option<u64>) -> Result<()> {
    match needed {
        Some(needed) if needed <= descriptor.size => Ok(()),
        _ => Err(InteropError::Transport(format!(
            "{} buffer of column '{}' spans {} bytes, too few for its rows",
            what, name, descriptor.size
        ))),
    }
}

fn open(device: &Device, descriptor: &BufferDescriptor) -> Result<(ImportedPtr, u64)> {
    let handle = IpcMemHandle::from_bytes(&descriptor.handle)?;
    let mapping = ImportedPtr::open(device, &handle)?;
    let (_, mapped) = device.address_range(mapping.base())?;
    let end = descriptor.offset.checked_add(descriptor.size);
    if end.map_or(true, |end| end > mapped as u64) {
        return Err(InteropError::Transport(format!(
            "buffer at offset {} of {} bytes overruns a {}-byte mapping",
            descriptor.offset, descriptor.size, mapped
        )));
    }
    let ptr = mapping.base() + descriptor.offset;
    debug!("Opened buffer at {:#x} ({} bytes)", ptr, descriptor.size);
    Ok((mapping, ptr))
}

fn import_column(
    device: &Device,
    name: &str,
    arrow_type: &ArrowType,
    handles: &ColumnHandles,
) -> Result<(ColumnView, ImportedColumn)> {
    let dtype = from_arrow_type(arrow_type)?;
    if matches!(dtype.id(), TypeId::String | TypeId::Dictionary32 | TypeId::Empty) {
        return Err(InteropError::UnsupportedType(format!(
            "{:?} columns cannot be imported over IPC",
            dtype.id()
        )));
    }

    if let (Some(descriptor), Some(width)) = (&handles.data, dtype.id().size_of()) {
        require(name, "data", descriptor, handles.size.checked_mul(width as u64))?;
    }
    if let Some(descriptor) = &handles.validity {
        require(name, "validity", descriptor, Some(handles.size.div_ceil(8)))?;
    }

    let (data, data_ptr) = match &handles.data {
        Some(descriptor) => {
            let (mapping, ptr) = open(device, descriptor)?;
            (Some(mapping), ptr)
        }
        None => (None, 0),
    };
    let (validity, mask_ptr) = match &handles.validity {
        Some(descriptor) => {
            let (mapping, ptr) = open(device, descriptor)?;
            (Some(mapping), ptr)
        }
        None => (None, 0),
    };

    let child_types: Vec<(String, ArrowType)> = match arrow_type {
        ArrowType::List(element) => vec![
            ("offsets".to_string(), ArrowType::Int32),
            (element.name().clone(), element.data_type().clone()),
        ],
        ArrowType::Struct(fields) => fields
            .iter()
            .map(|f| (f.name().clone(), f.data_type().clone()))
            .collect(),
        _ => Vec::new(),
    };
    if child_types.len() != handles.children.len() {
        return Err(InteropError::Transport(format!(
            "column '{}' has {} child handle trees, its type needs {}",
            name,
            handles.children.len(),
            child_types.len()
        )));
    }

    let (child_views, child_owners): (Vec<_>, Vec<_>) = child_types
        .iter()
        .zip(&handles.children)
        .map(|((child_name, child_type), child)| import_column(device, child_name, child_type, child))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();

    let view = ColumnView::new(
        dtype,
        handles.size as usize,
        data_ptr,
        mask_ptr,
        handles.null_count as usize,
        child_views,
    );
    let owner = ImportedColumn::new(name.to_string(), data, validity, child_owners);
    Ok((view, owner))
}
