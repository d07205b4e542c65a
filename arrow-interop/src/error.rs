use arrow_schema::ArrowError;
use gpu_memory_manager::DeviceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InteropError>;

#[derive(Error, Debug)]
pub enum InteropError {
    /// The column's logical type has no representation on this path.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// Metadata or child structure does not line up with the columns.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Device resource error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to build Arrow ABI structure: {0}")]
    AbiBuild(#[from] ArrowError),

    #[error("Malformed transport buffer: {0}")]
    Transport(String),
}
