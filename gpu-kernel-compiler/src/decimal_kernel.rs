//! Decimal widening: 32- or 64-bit two's-complement unscaled values to
//! 128-bit little-endian values, one thread per element.

use std::sync::Arc;

use gpu_memory_manager::{Backend, DeviceBuffer, DevicePtr, MemoryResource, Result, Stream};
use tracing::debug;

/// Storage width of the narrow decimal being widened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalWidth {
    Bits32,
    Bits64,
}

impl DecimalWidth {
    pub fn byte_width(self) -> usize {
        match self {
            DecimalWidth::Bits32 => 4,
            DecimalWidth::Bits64 => 8,
        }
    }
}

/// Bytes per widened element.
pub const DECIMAL128_WIDTH: usize = 16;

/// Allocate a `16 * n` byte buffer from `mr` on `stream` and fill it with the
/// sign-extended values read from `src`. The source is left untouched.
pub fn widen_decimals(
    src: DevicePtr,
    width: DecimalWidth,
    n: usize,
    stream: &Stream,
    mr: &Arc<dyn MemoryResource>,
) -> Result<DeviceBuffer> {
    debug!("widen_decimals {:?} x {} on {:?}", width, n, stream);
    let out = DeviceBuffer::new(n * DECIMAL128_WIDTH, stream, mr)?;
    if n == 0 {
        return Ok(out);
    }

    let device = mr.device();
    match device.backend() {
        Backend::Host => {
            let narrow = device.read(src, n * width.byte_width(), stream)?;
            let wide = widen_host(&narrow, width);
            device.copy_to_device(out.ptr(), &wide, stream)?;
        }
        #[cfg(feature = "cuda")]
        Backend::Cuda(dev) => {
            use std::ffi::c_void;
            let name = match width {
                DecimalWidth::Bits32 => crate::codegen::WIDEN_DECIMAL32,
                DecimalWidth::Bits64 => crate::codegen::WIDEN_DECIMAL64,
            };
            let module = crate::codegen::loaded::for_device(dev)?;
            let mut src_arg = src;
            let mut dst_arg = out.ptr();
            let mut n_arg = n as u64;
            let mut params = [
                &mut src_arg as *mut u64 as *mut c_void,
                &mut dst_arg as *mut u64 as *mut c_void,
                &mut n_arg as *mut u64 as *mut c_void,
            ];
            unsafe { module.launch(name, n as u64, stream.cu_stream(), &mut params)? };
        }
    }
    Ok(out)
}

/// Host reference: sign-extend each little-endian value in `narrow` to 128 bits.
pub fn widen_host(narrow: &[u8], width: DecimalWidth) -> Vec<u8> {
    let mut wide = Vec::with_capacity(narrow.len() / width.byte_width() * DECIMAL128_WIDTH);
    for chunk in narrow.chunks_exact(width.byte_width()) {
        let value: i128 = match width {
            DecimalWidth::Bits32 => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i128,
            DecimalWidth::Bits64 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                i64::from_le_bytes(bytes) as i128
            }
        };
        wide.extend_from_slice(&value.to_le_bytes());
    }
    wide
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_memory_manager::{Device, DeviceMemoryResource};
    use proptest::prelude::*;

    fn as_i128(bytes: &[u8]) -> Vec<i128> {
        bytes
            .chunks_exact(16)
            .map(|c| i128::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn widens_negative_and_positive() {
        let device = Device::host();
        let stream = device.create_stream().unwrap();
        let mr = DeviceMemoryResource::shared(device);

        let values: Vec<i32> = vec![1, -1, i32::MIN, i32::MAX, 0];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let src = DeviceBuffer::from_host(&bytes, &stream, &mr).unwrap();

        let out = widen_decimals(src.ptr(), DecimalWidth::Bits32, values.len(), &stream, &mr).unwrap();
        assert_eq!(out.len(), values.len() * DECIMAL128_WIDTH);
        let widened = as_i128(&out.to_host().unwrap());
        let expected: Vec<i128> = values.iter().map(|v| *v as i128).collect();
        assert_eq!(widened, expected);
        // Source survives the conversion.
        assert_eq!(src.to_host().unwrap(), bytes);
    }

    #[test]
    fn empty_input_allocates_nothing() {
        let device = Device::host();
        let stream = device.default_stream();
        let mr = DeviceMemoryResource::shared(device);
        let out = widen_decimals(0, DecimalWidth::Bits64, 0, &stream, &mr).unwrap();
        assert!(out.is_empty());
    }

    proptest! {
        #[test]
        fn decimal32_sign_extends(values in proptest::collection::vec(any::<i32>(), 0..200)) {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let wide = as_i128(&widen_host(&bytes, DecimalWidth::Bits32));
            prop_assert_eq!(wide, values.iter().map(|v| *v as i128).collect::<Vec<_>>());
        }

        #[test]
        fn decimal64_sign_extends(values in proptest::collection::vec(any::<i64>(), 0..200)) {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let wide = widen_host(&bytes, DecimalWidth::Bits64);
            for (chunk, v) in wide.chunks_exact(16).zip(&values) {
                let high = i64::from_le_bytes(chunk[8..].try_into().unwrap());
                prop_assert_eq!(high, if *v < 0 { -1 } else { 0 });
                prop_assert_eq!(i64::from_le_bytes(chunk[..8].try_into().unwrap()), *v);
            }
        }
    }
}
