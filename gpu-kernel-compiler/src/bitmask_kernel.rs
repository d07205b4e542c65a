//! Boolean bit packing: one byte per value to an LSB-first bitmask of 32-bit
//! words, one thread per output word.

use std::sync::Arc;

use gpu_memory_manager::{Backend, DeviceBuffer, DevicePtr, MemoryResource, Result, Stream};
use tracing::debug;

/// Bitmask allocations are padded to this many bytes.
pub const BITMASK_PADDING: usize = 64;

/// Bits per bitmask word.
pub const BITS_PER_WORD: usize = 32;

/// Bytes needed for a bitmask over `n` values, padded to [`BITMASK_PADDING`].
pub fn bitmask_allocation_size(n: usize) -> usize {
    let words = n.div_ceil(BITS_PER_WORD);
    (words * 4).div_ceil(BITMASK_PADDING) * BITMASK_PADDING
}

/// Pack `n` one-byte booleans at `src` (nonzero = true) into a freshly
/// allocated bitmask. Bits past `n` and padding words are zero.
pub fn pack_bools(
    src: DevicePtr,
    n: usize,
    stream: &Stream,
    mr: &Arc<dyn MemoryResource>,
) -> Result<DeviceBuffer> {
    let size = bitmask_allocation_size(n);
    debug!("pack_bools {} values into {} bytes", n, size);
    let out = DeviceBuffer::new(size, stream, mr)?;
    if size == 0 {
        return Ok(out);
    }

    let device = mr.device();
    match device.backend() {
        Backend::Host => {
            let bytes = device.read(src, n, stream)?;
            let mut packed = pack_bits(bytes.iter().map(|b| *b != 0));
            packed.resize(size, 0);
            device.copy_to_device(out.ptr(), &packed, stream)?;
        }
        #[cfg(feature = "cuda")]
        Backend::Cuda(dev) => {
            use std::ffi::c_void;
            let module = crate::codegen::loaded::for_device(dev)?;
            let words = (size / 4) as u64;
            let mut src_arg = src;
            let mut dst_arg = out.ptr();
            let mut n_arg = n as u64;
            let mut words_arg = words;
            let mut params = [
                &mut src_arg as *mut u64 as *mut c_void,
                &mut dst_arg as *mut u64 as *mut c_void,
                &mut n_arg as *mut u64 as *mut c_void,
                &mut words_arg as *mut u64 as *mut c_void,
            ];
            unsafe { module.launch(crate::codegen::PACK_BOOLS, words, stream.cu_stream(), &mut params)? };
        }
    }
    Ok(out)
}

/// Host reference: pack `bits` LSB-first into little-endian 32-bit words.
/// The result is whole words, unpadded.
pub fn pack_bits(bits: impl IntoIterator<Item = bool>) -> Vec<u8> {
    let mut words: Vec<u32> = Vec::new();
    for (i, bit) in bits.into_iter().enumerate() {
        if i % BITS_PER_WORD == 0 {
            words.push(0);
        }
        if bit {
            if let Some(word) = words.last_mut() {
                *word |= 1 << (i % BITS_PER_WORD);
            }
        }
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Whether bit `i` is set in an LSB-first bitmask.
pub fn bit_is_set(mask: &[u8], i: usize) -> bool {
    mask[i / 8] & (1 << (i % 8)) != 0
}
