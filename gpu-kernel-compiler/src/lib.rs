pub mod bitmask_kernel;
pub mod codegen;
pub mod decimal_kernel;

pub use bitmask_kernel::{bitmask_allocation_size, pack_bits, pack_bools};
pub use codegen::{compute_launch_params, KernelCodegen};
pub use decimal_kernel::{widen_decimals, widen_host, DecimalWidth, DECIMAL128_WIDTH};
