//! Wire format of the IPC transport buffer.
//!
//! ```text
//! magic (8 bytes) | bincode { version, device, arrow schema, handle tree }
//! ```
//!
//! The handle tree mirrors the column tree: one node per column with the
//! data and validity descriptors, children in column order (for lists the
//! offsets column comes first, as on the device).

use arrow_interop::{InteropError, Result};
use arrow_schema::Schema;
use bincode::Options;
use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 8] = *b"GPUIPC\0\0";
pub const FORMAT_VERSION: u32 = 1;

/// Opaque, immutable bytes produced by export and consumed by import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBuffer {
    bytes: Vec<u8>,
}

impl TransportBuffer {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DeviceDescriptor {
    pub device_type: i32,
    pub device_id: i64,
}

/// One shareable buffer: the handle of its allocation, where the buffer
/// starts inside that allocation, and how many bytes it spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BufferDescriptor {
    pub handle: Vec<u8>,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ColumnHandles {
    pub size: u64,
    pub null_count: u64,
    pub data: Option<BufferDescriptor>,
    pub validity: Option<BufferDescriptor>,
    pub children: Vec<ColumnHandles>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TransportMessage {
    pub version: u32,
    pub device: DeviceDescriptor,
    pub schema: Schema,
    pub columns: Vec<ColumnHandles>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
}

impl TransportMessage {
    pub fn encode(&self) -> Result<TransportBuffer> {
        let body = codec()
            .serialize(self)
            .map_err(|e| InteropError::Transport(format!("encode failed: {}", e)))?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&body);
        Ok(TransportBuffer::from_bytes(bytes))
    }

    pub fn decode(buffer: &TransportBuffer) -> Result<Self> {
        let bytes = buffer.as_bytes();
        if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
            return Err(InteropError::Transport("missing magic".into()));
        }
        let body = &bytes[MAGIC.len()..];
        let message: TransportMessage = codec()
            .with_limit(body.len() as u64)
            .deserialize(body)
            .map_err(|e| InteropError::Transport(format!("decode failed: {}", e)))?;
        if message.version != FORMAT_VERSION {
            return Err(InteropError::Transport(format!(
                "unsupported format version {} (expected {})",
                message.version, FORMAT_VERSION
            )));
        }
        Ok(message)
    }
}
