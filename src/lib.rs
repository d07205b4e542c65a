//! Zero-copy export of device-resident columnar tables.
//!
//! [`InteropEngine`] bundles a device, a stream and a memory resource and
//! exposes the four entry points:
//!
//! - [`InteropEngine::to_arrow_schema`] / [`InteropEngine::to_arrow_device`]
//!   for in-process consumers of the Arrow C Data / C Device interfaces
//! - [`InteropEngine::export_ipc`] / [`InteropEngine::import_ipc`] for
//!   sharing device memory with another process
//!
//! The building blocks live in the member crates and are re-exported here.

use std::sync::Arc;

use arrow_schema::ffi::FFI_ArrowSchema;
use tracing::info;

pub mod config;

pub use arrow_interop::{
    ArrowArray, ArrowDeviceArray, ColumnMetadata, ColumnView, DataType, DeviceColumn, InteropError,
    Result, Table, TableView, TypeId,
};
pub use config::{DeviceSelector, InteropConfig};
pub use gpu_ipc::{ImportedColumn, IpcExportOptions, TransportBuffer};
pub use gpu_memory_manager::{
    AllocationStats, Device, DeviceError, DeviceKind, DeviceMemoryResource, MemoryResource, Stream,
    TrackingResource,
};

pub struct InteropEngine {
    config: InteropConfig,
    device: Device,
    stream: Stream,
    mr: Arc<dyn MemoryResource>,
    tracker: Option<Arc<TrackingResource>>,
}

impl InteropEngine {
    pub fn new(config: InteropConfig) -> Result<Self> {
        let device = open_device(config.device)?;
        let stream = device.create_stream()?;
        let upstream = DeviceMemoryResource::shared(device.clone());
        let (mr, tracker) = if config.track_allocations {
            let tracker = Arc::new(TrackingResource::new(upstream));
            (tracker.clone() as Arc<dyn MemoryResource>, Some(tracker))
        } else {
            (upstream, None)
        };
        info!("InteropEngine ready on {:?} (tracking: {})", device, config.track_allocations);
        Ok(Self {
            config,
            device,
            stream,
            mr,
            tracker,
        })
    }

    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn memory_resource(&self) -> &Arc<dyn MemoryResource> {
        &self.mr
    }

    /// Allocation counters, when `track_allocations` is enabled.
    pub fn allocation_stats(&self) -> Option<AllocationStats> {
        self.tracker.as_ref().map(|t| t.stats())
    }

    /// A table on this engine's device.
    pub fn table(&self, columns: Vec<DeviceColumn>) -> Result<Table> {
        Table::new(self.device.clone(), columns)
    }

    pub fn to_arrow_schema(&self, table: &TableView, metadata: &[ColumnMetadata]) -> Result<FFI_ArrowSchema> {
        arrow_interop::to_arrow_schema(table, metadata)
    }

    /// Move `table`'s buffers into an Arrow device array, converting on this
    /// engine's stream. The table's columns are released on success.
    pub fn to_arrow_device(&self, table: &mut Table) -> Result<ArrowDeviceArray> {
        arrow_interop::to_arrow_device(table, &self.stream, &self.mr)
    }

    pub fn export_ipc(&self, table: &TableView, metadata: &[ColumnMetadata]) -> Result<TransportBuffer> {
        let options = IpcExportOptions {
            require_device_memory: self.config.require_device_memory_for_ipc,
        };
        gpu_ipc::export_ipc_with(table, metadata, &options)
    }

    pub fn import_ipc(&self, buffer: &TransportBuffer) -> Result<(TableView, Vec<Arc<ImportedColumn>>)> {
        gpu_ipc::import_ipc(buffer)
    }
}

fn open_device(selector: DeviceSelector) -> Result<Device> {
    match selector {
        DeviceSelector::Host => Ok(Device::host()),
        #[cfg(feature = "cuda")]
        DeviceSelector::Cuda { ordinal } => Ok(Device::cuda(ordinal)?),
        #[cfg(not(feature = "cuda"))]
        DeviceSelector::Cuda { ordinal } => Err(DeviceError::InvalidArgument(format!(
            "CUDA device {} requested but built without the `cuda` feature",
            ordinal
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_creation() {
        let engine = InteropEngine::new(InteropConfig::default()).unwrap();
        assert_eq!(engine.device().kind(), DeviceKind::Cpu);
        assert!(engine.allocation_stats().is_none());
    }

    #[test]
    fn tracking_engine_counts_allocations() {
        let engine = InteropEngine::new(InteropConfig {
            track_allocations: true,
            ..Default::default()
        })
        .unwrap();
        let col = DeviceColumn::from_slice(TypeId::Int32, &[1i32, 2], None, engine.stream(), engine.memory_resource()).unwrap();
        assert_eq!(engine.allocation_stats().unwrap().outstanding, 1);
        drop(col);
        assert_eq!(engine.allocation_stats().unwrap().outstanding, 0);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_needs_feature() {
        let err = InteropEngine::new(InteropConfig::cuda(0)).err().unwrap();
        assert!(matches!(err, InteropError::Device(DeviceError::InvalidArgument(_))));
    }
}
