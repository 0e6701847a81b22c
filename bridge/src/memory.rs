//! Guest linear memory access with bounds checking, and the view cache.
//!
//! All helpers validate pointer and length arguments against the current
//! memory size before touching it. A guest pointer outside its own memory is
//! a protocol violation and traps.
//!
//! Views borrow the memory slice they were built from, so the borrow checker
//! already forbids holding one across a call back into the guest (which may
//! grow memory). [`MemoryViews`] tracks the identity of the last observed
//! buffer and rebuilds when it changes.

use std::ops::Range;

use polyglot_hostapi::{HostError, HostResult};

/// Wasm page size in bytes.
pub const PAGE_SIZE: usize = 65536;

/// Validate that `[ptr, ptr+len)` lies within a memory of `mem_size` bytes.
pub fn validate_range(mem_size: usize, ptr: u32, len: usize) -> HostResult<Range<usize>> {
    let start = ptr as usize;
    let end = start.checked_add(len).ok_or_else(|| bad_pointer(ptr, len, mem_size))?;
    if end > mem_size {
        return Err(bad_pointer(ptr, len, mem_size));
    }
    Ok(start..end)
}

fn bad_pointer(ptr: u32, len: usize, mem_size: usize) -> HostError {
    HostError::trap(format!(
        "guest range {:#x}+{} out of bounds (memory is {} bytes)",
        ptr, len, mem_size
    ))
}

/// Read `len` bytes from guest memory at `ptr`.
pub fn read_bytes(mem: &[u8], ptr: u32, len: usize) -> HostResult<&[u8]> {
    let range = validate_range(mem.len(), ptr, len)?;
    Ok(&mem[range])
}

/// Write `data` to guest memory at `ptr`.
pub fn write_bytes(mem: &mut [u8], ptr: u32, data: &[u8]) -> HostResult<()> {
    let range = validate_range(mem.len(), ptr, data.len())?;
    mem[range].copy_from_slice(data);
    Ok(())
}

/// Read a little-endian i32 at `ptr`.
pub fn read_i32(mem: &[u8], ptr: u32) -> HostResult<i32> {
    let bytes = read_bytes(mem, ptr, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Write a little-endian i32 at `ptr`.
pub fn write_i32(mem: &mut [u8], ptr: u32, value: i32) -> HostResult<()> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

/// Byte-addressable view.
pub struct ByteView<'a> {
    data: &'a mut [u8],
}

impl<'a> ByteView<'a> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read(&self, ptr: u32, len: usize) -> HostResult<&[u8]> {
        read_bytes(&*self.data, ptr, len)
    }
}

/// 32-bit word view. Pointers are byte offsets and must be 4-aligned.
pub struct Words32View<'a> {
    data: &'a mut [u8],
}

impl<'a> Words32View<'a> {
    /// Number of whole words in memory.
    pub fn len(&self) -> usize {
        self.data.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `count` words starting at byte offset `ptr`.
    pub fn read(&self, ptr: u32, count: usize) -> HostResult<Vec<u32>> {
        check_aligned(ptr, 4)?;
        let len = count
            .checked_mul(4)
            .ok_or_else(|| bad_pointer(ptr, usize::MAX, self.data.len()))?;
        let bytes = read_bytes(&*self.data, ptr, len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }
}

/// Generic little-endian accessor view.
pub struct DataView<'a> {
    data: &'a mut [u8],
}

impl<'a> DataView<'a> {
    pub fn get_i32(&self, ptr: u32) -> HostResult<i32> {
        read_i32(&*self.data, ptr)
    }

    pub fn set_i32(&mut self, ptr: u32, value: i32) -> HostResult<()> {
        write_i32(self.data, ptr, value)
    }

    pub fn get_u32(&self, ptr: u32) -> HostResult<u32> {
        Ok(read_i32(&*self.data, ptr)? as u32)
    }

    pub fn get_f64(&self, ptr: u32) -> HostResult<f64> {
        let b = read_bytes(&*self.data, ptr, 8)?;
        Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn set_f64(&mut self, ptr: u32, value: f64) -> HostResult<()> {
        write_bytes(self.data, ptr, &value.to_le_bytes())
    }
}

fn check_aligned(ptr: u32, align: u32) -> HostResult<()> {
    if ptr % align != 0 {
        return Err(HostError::trap(format!(
            "guest pointer {:#x} is not {}-byte aligned",
            ptr, align
        )));
    }
    Ok(())
}

/// Cache of the last observed linear memory buffer.
///
/// A snapshot is the buffer's base address and length. Growth changes the
/// length and may move the base; a zero-length buffer counts as detached.
/// Either way the next access rebuilds.
#[derive(Debug, Default)]
pub struct MemoryViews {
    snapshot: Option<(usize, usize)>,
    rebuilds: u64,
}

impl MemoryViews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the cached snapshot against `data`. Returns true if it was
    /// rebuilt.
    pub fn observe(&mut self, data: &[u8]) -> bool {
        let current = (data.as_ptr() as usize, data.len());
        match self.snapshot {
            Some(cached) if cached == current && cached.1 != 0 => false,
            _ => {
                self.snapshot = Some(current);
                self.rebuilds += 1;
                tracing::trace!(base = current.0, len = current.1, "memory views rebuilt");
                true
            }
        }
    }

    /// Drop the snapshot so the next access rebuilds.
    pub fn invalidate(&mut self) {
        self.snapshot = None;
    }

    pub fn is_cached(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Number of rebuilds so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn bytes<'a>(&mut self, data: &'a mut [u8]) -> ByteView<'a> {
        self.observe(data);
        ByteView { data }
    }

    pub fn words32<'a>(&mut self, data: &'a mut [u8]) -> Words32View<'a> {
        self.observe(data);
        Words32View { data }
    }

    pub fn data_view<'a>(&mut self, data: &'a mut [u8]) -> DataView<'a> {
        self.observe(data);
        DataView { data }
    }
}
