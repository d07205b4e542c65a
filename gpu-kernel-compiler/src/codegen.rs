//! CUDA C source for the conversion kernels, compiled at runtime with NVRTC.
//!
//! Every kernel is one-thread-per-output-element with a bounds check, so any
//! grid from [`compute_launch_params`] covers the input.

use tracing::debug;

/// Threads per block for every conversion kernel.
pub const BLOCK_SIZE: u32 = 256;

pub const WIDEN_DECIMAL32: &str = "widen_decimal32";
pub const WIDEN_DECIMAL64: &str = "widen_decimal64";
pub const PACK_BOOLS: &str = "pack_bools";

const CONVERSION_KERNELS: &str = r#"
extern "C" __global__ void widen_decimal32(const int* src, long long* dst, unsigned long long n) {
    unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    long long v = (long long)src[i];
    dst[2 * i] = v;
    dst[2 * i + 1] = v < 0 ? -1LL : 0LL;
}

extern "C" __global__ void widen_decimal64(const long long* src, long long* dst, unsigned long long n) {
    unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    long long v = src[i];
    dst[2 * i] = v;
    dst[2 * i + 1] = v < 0 ? -1LL : 0LL;
}

extern "C" __global__ void pack_bools(const unsigned char* src, unsigned int* dst,
                                      unsigned long long n, unsigned long long words) {
    unsigned long long w = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    if (w >= words) return;
    unsigned int bits = 0;
    unsigned long long first = w * 32;
    for (unsigned int b = 0; b < 32; ++b) {
        unsigned long long idx = first + b;
        if (idx < n && src[idx] != 0) bits |= 1u << b;
    }
    dst[w] = bits;
}
"#;

pub struct KernelCodegen;

impl KernelCodegen {
    pub fn new() -> Self {
        KernelCodegen
    }

    /// CUDA C translation unit holding every conversion kernel.
    pub fn conversion_source(&self) -> &'static str {
        debug!("Codegen conversion kernels");
        CONVERSION_KERNELS
    }

    pub fn kernel_names(&self) -> [&'static str; 3] {
        [WIDEN_DECIMAL32, WIDEN_DECIMAL64, PACK_BOOLS]
    }

    #[cfg(feature = "cuda")]
    pub fn compile(&self) -> gpu_memory_manager::Result<cudarc::nvrtc::Ptx> {
        cudarc::nvrtc::compile_ptx(self.conversion_source())
            .map_err(|e| gpu_memory_manager::DeviceError::Kernel(format!("NVRTC: {}", e)))
    }
}

impl Default for KernelCodegen {
    fn default() -> Self {
        Self::new()
    }
}

/// `(grid, block)` covering `n` work items, never an empty grid.
pub fn compute_launch_params(n: u64) -> (u32, u32) {
    let grid = n.div_ceil(BLOCK_SIZE as u64).min(u32::MAX as u64) as u32;
    (grid.max(1), BLOCK_SIZE)
}

#[cfg(feature = "cuda")]
pub(crate) mod loaded {
    //! Per-device cache of the compiled conversion module.

    use std::collections::HashMap;
    use std::ffi::{c_void, CString};
    use std::sync::{Arc, LazyLock};

    use cudarc::driver::{result, sys, CudaDevice};
    use gpu_memory_manager::{DeviceError, Result};
    use parking_lot::Mutex;
    use tracing::info;

    use super::{compute_launch_params, KernelCodegen};

    pub(crate) struct ConversionModule {
        _module: sys::CUmodule,
        functions: HashMap<&'static str, sys::CUfunction>,
    }

    // Module and function handles are context-wide and immutable once loaded.
    unsafe impl Send for ConversionModule {}
    unsafe impl Sync for ConversionModule {}

    static MODULES: LazyLock<Mutex<HashMap<usize, Arc<ConversionModule>>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));

    /// Compile and load the conversion module for `dev` on first use.
    pub(crate) fn for_device(dev: &Arc<CudaDevice>) -> Result<Arc<ConversionModule>> {
        let mut modules = MODULES.lock();
        if let Some(module) = modules.get(&dev.ordinal()) {
            return Ok(Arc::clone(module));
        }

        dev.bind_to_thread()?;
        let codegen = KernelCodegen::new();
        let ptx = codegen.compile()?;
        let image = CString::new(ptx.to_src())
            .map_err(|e| DeviceError::Kernel(format!("PTX contains NUL: {}", e)))?;
        let module = unsafe { result::module::load_data(image.as_ptr() as *const c_void) }?;

        let mut functions = HashMap::new();
        for name in codegen.kernel_names() {
            let cname = CString::new(name).map_err(|e| DeviceError::Kernel(e.to_string()))?;
            let func = unsafe { result::module::get_function(module, cname) }?;
            functions.insert(name, func);
        }
        info!("Loaded conversion kernels on CUDA device {}", dev.ordinal());

        let loaded = Arc::new(ConversionModule {
            _module: module,
            functions,
        });
        modules.insert(dev.ordinal(), Arc::clone(&loaded));
        Ok(loaded)
    }

    impl ConversionModule {
        /// Enqueue `name` over `work_items` threads on `stream`.
        ///
        /// # Safety
        ///
        /// `params` must match the kernel signature and point at live values.
        pub(crate) unsafe fn launch(
            &self,
            name: &str,
            work_items: u64,
            stream: sys::CUstream,
            params: &mut [*mut c_void],
        ) -> Result<()> {
            let func = *self
                .functions
                .get(name)
                .ok_or_else(|| DeviceError::Kernel(format!("kernel {} not loaded", name)))?;
            let (grid, block) = compute_launch_params(work_items);
            result::launch_kernel(func, (grid, 1, 1), (block, 1, 1), 0, stream, params)
                .map_err(|e| DeviceError::Kernel(format!("{} launch failed: {}", name, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_defines_every_kernel() {
        let cg = KernelCodegen::new();
        let src = cg.conversion_source();
        for name in cg.kernel_names() {
            assert!(src.contains(&format!("__global__ void {}(", name)), "{} missing", name);
        }
        assert_eq!(src.matches("extern \"C\"").count(), 3);
    }

    #[test]
    fn launch_params_cover_input() {
        assert_eq!(compute_launch_params(0), (1, BLOCK_SIZE));
        assert_eq!(compute_launch_params(256), (1, 256));
        assert_eq!(compute_launch_params(257), (2, 256));
        let (g, b) = compute_launch_params(1_000_000);
        assert!(g as u64 * b as u64 >= 1_000_000);
    }
}
