//! Completion event attached to an exported table.

use gpu_memory_manager::{Device, Event, Stream};
use tracing::debug;

use crate::error::Result;
use crate::ffi::{ArrowArray, ArrowDeviceArray};

/// Record `event` on `stream` and wrap `children` in the top-level struct
/// node that owns the event. The event lives until that node is released.
pub(crate) fn attach(
    device: &Device,
    stream: &Stream,
    event: Event,
    rows: usize,
    children: Vec<ArrowArray>,
) -> Result<ArrowDeviceArray> {
    event.record(stream)?;
    let sync_event = event.as_sync_ptr();
    debug!("Attached sync event {:p} to {} columns", sync_event, children.len());

    // Struct parent: one (absent) validity slot, no nulls.
    let array = ArrowArray::new(rows, 0, vec![None], children, Some(event));
    Ok(ArrowDeviceArray {
        array,
        device_id: device.id(),
        device_type: device.kind().arrow_device_type(),
        sync_event,
        reserved: [0; 3],
    })
}
