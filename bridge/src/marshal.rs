//! String and byte marshaling between host values and guest memory.
//!
//! Decoding is strict UTF-8. Encoding is two-phase: ASCII is written straight
//! into a buffer sized to the string's code-unit length, and only from the
//! first non-ASCII unit onwards is the remainder encoded and the guest buffer
//! grown to fit.

use polyglot_hostapi::{DecodingError, HostResult, HostString};

use crate::memory;

/// Cumulative decode volume after which the decoder instance is re-created.
pub const MAX_DECODE_BYTES: u64 = 2_146_435_072;

/// Reusable decode state: the UTF-16 scratch buffer strings are built in.
#[derive(Debug, Default)]
struct Utf8Decoder {
    scratch: Vec<u16>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<HostString, DecodingError> {
        let text = std::str::from_utf8(bytes).map_err(|e| DecodingError {
            valid_up_to: e.valid_up_to(),
            len: bytes.len(),
        })?;
        self.scratch.clear();
        self.scratch.extend(text.encode_utf16());
        Ok(HostString::from_units(self.scratch.as_slice()))
    }
}

/// Strict UTF-8 decoder with cumulative-volume tracking.
#[derive(Debug)]
pub struct TextDecoder {
    inner: Utf8Decoder,
    decoded: u64,
    threshold: u64,
    generation: u64,
}

impl Default for TextDecoder {
    fn default() -> Self {
        Self::with_threshold(MAX_DECODE_BYTES)
    }
}

impl TextDecoder {
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            inner: Utf8Decoder::default(),
            decoded: 0,
            threshold,
            generation: 0,
        }
    }

    /// Decode `bytes` as UTF-8.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<HostString, DecodingError> {
        let len = bytes.len() as u64;
        self.decoded += len;
        if self.decoded >= self.threshold {
            self.inner = Utf8Decoder::default();
            self.generation += 1;
            self.decoded = len;
            tracing::debug!(generation = self.generation, "text decoder re-created");
        }
        self.inner.decode(bytes)
    }

    /// Bytes decoded since the current instance was created.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Number of times the inner decoder has been re-created.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Guest-side allocation, as needed by the encoder.
pub trait GuestAlloc {
    fn malloc(&mut self, size: u32, align: u32) -> HostResult<u32>;
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> HostResult<u32>;
    /// The guest memory as it is now. Must be re-fetched after any
    /// allocation call.
    fn memory_mut(&mut self) -> HostResult<&mut [u8]>;
}

/// Copy `text` into guest memory as UTF-8. Returns `(ptr, len)`.
pub fn encode_into<A: GuestAlloc + ?Sized>(alloc: &mut A, text: &HostString) -> HostResult<(u32, u32)> {
    let units = text.units();
    let mut len = units.len() as u32;
    let mut ptr = alloc.malloc(len, 1)?;

    let mut offset = 0usize;
    {
        let mem = alloc.memory_mut()?;
        let range = memory::validate_range(mem.len(), ptr, units.len())?;
        let dst = &mut mem[range];
        for &unit in units {
            if unit > 0x7f {
                break;
            }
            dst[offset] = unit as u8;
            offset += 1;
        }
    }

    if offset != units.len() {
        let rest = String::from_utf16_lossy(&units[offset..]);
        let new_len = (offset + rest.len()) as u32;
        ptr = alloc.realloc(ptr, len, new_len, 1)?;
        let mem = alloc.memory_mut()?;
        memory::write_bytes(mem, ptr + offset as u32, rest.as_bytes())?;
        len = new_len;
    }

    Ok((ptr, len))
}

/// Copy raw bytes into a fresh guest buffer. Returns `(ptr, len)`.
pub fn pass_bytes<A: GuestAlloc + ?Sized>(alloc: &mut A, data: &[u8]) -> HostResult<(u32, u32)> {
    let len = data.len() as u32;
    let ptr = alloc.malloc(len, 1)?;
    memory::write_bytes(alloc.memory_mut()?, ptr, data)?;
    Ok((ptr, len))
}
