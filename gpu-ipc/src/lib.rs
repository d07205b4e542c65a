//! Device-memory IPC for columnar tables.
//!
//! [`export_ipc`] packages an IPC handle for every buffer of a table, plus
//! the table's Arrow schema, into an opaque [`TransportBuffer`]. Another
//! process on the same device passes that buffer to [`import_ipc`] to map
//! the same physical memory and get back a read-only [`arrow_interop::TableView`]
//! together with the [`ImportedColumn`]s that keep the mappings open.
//!
//! The exporter must keep its columns alive for as long as any importer
//! uses them.

pub mod export;
pub mod import;
pub mod imported_column;
pub mod transport;

pub use export::{export_ipc, export_ipc_with, IpcExportOptions};
pub use import::import_ipc;
pub use imported_column::ImportedColumn;
pub use transport::{TransportBuffer, FORMAT_VERSION, MAGIC};
