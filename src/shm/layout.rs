//! `#[repr(C)]` structures that live in the mapped file, and the planner that
//! decides where every segment, bitset, bucket array and slot goes.
//!
//! File layout: `[header][segment 0][segment 1]...[segment N-1]`.
//! Every segment is `segment_stride` bytes, so a segment's offset is
//! computable from its index alone. Inside a segment:
//!
//! ```text
//! [SegmentHeader 64][free-slot bitset u64 * W][bucket heads u32 * B][slots ...]
//! ```
//!
//! A slot is `[SlotHeader 24][key bytes, 8-aligned][value bytes, 8-aligned]`.

use std::sync::atomic::{AtomicU32, AtomicU64};

use bytemuck::{Pod, Zeroable};

use crate::error::{MapError, Result};

/// Magic bytes at the start of the header to validate the mapping.
pub const MAGIC: [u8; 8] = *b"WARPMAP\0";

/// Bumped whenever any offset or struct below changes.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the fixed header at the start of the file.
pub const HEADER_SIZE: usize = 256;

/// Sentinel meaning "no slot" in bucket heads and chain links.
pub const SLOT_NONE: u32 = u32::MAX;

pub const SEGMENT_HEADER_SIZE: usize = 64;

pub const SLOT_HEADER_SIZE: usize = 24;

/// Above this many entries per segment the planner adds segments instead.
pub const MAX_ENTRIES_PER_SEGMENT: u64 = 1 << 16;

const SEGMENT_ALIGN: u64 = 64;

/// Header lives at offset 0 of the file.
///
/// Fields are ordered u64-first so `#[repr(C)]` inserts no padding, which
/// `Pod` requires.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Header {
    // 8-byte aligned group
    pub magic: [u8; 8],       // 0..8
    pub segment_stride: u64,  // 8..16
    pub file_size: u64,       // 16..24

    // 4-byte aligned group
    pub version: u32,             // 24..28
    pub segment_count: u32,       // 28..32
    pub entries_per_segment: u32, // 32..36
    pub buckets_per_segment: u32, // 36..40
    pub entry_stride: u32,        // 40..44
    pub key_capacity: u32,        // 44..48
    pub value_capacity: u32,      // 48..52
    pub ready: u32,               // 52..56 (published last, release ordering)

    // Explicit padding to 256 bytes: 256 - 56 = 200
    pub _pad: [u64; 25],
}

/// Byte offset of `Header::ready`.
pub const READY_OFFSET: usize = 52;

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// First cache line of every segment.
#[repr(C)]
#[derive(Debug)]
pub struct SegmentHeader {
    pub lock: AtomicU64,       // 0..8   (owner marker, 0 = unlocked)
    pub used: AtomicU32,       // 8..12  (slots in use)
    pub alloc_hint: AtomicU32, // 12..16 (bitset word to start scanning at)
    pub _pad: [u64; 6],        // 16..64
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

/// Per-slot header. Followed by key bytes then value bytes.
///
/// `generation` is bumped every time the slot is handed out, so a
/// [`ValueRef`](crate::atomic::ValueRef) can tell a reused slot from the one
/// it was taken on.
#[repr(C)]
#[derive(Debug)]
pub struct SlotHeader {
    pub key_hash: u64,         // 0..8
    pub next: u32,             // 8..12 (chain link, SLOT_NONE = end)
    pub key_len: u32,          // 12..16
    pub value_len: u32,        // 16..20
    pub generation: AtomicU32, // 20..24
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_HEADER_SIZE);

/// What the caller asks for. Sizes are the encoded byte bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRequest {
    pub entries: u64,
    pub min_segments: u32,
    pub max_key_size: u32,
    pub max_value_size: u32,
    pub entry_size: Option<u32>,
}

/// The static byte layout of a map file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub segment_count: u32,
    pub entries_per_segment: u32,
    pub buckets_per_segment: u32,
    pub key_capacity: u32,
    pub value_capacity: u32,
    pub entry_stride: u32,
    pub segment_stride: u64,
    pub file_size: u64,
}

#[inline]
const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

fn capacity(msg: impl Into<String>) -> MapError {
    MapError::Capacity(msg.into())
}

impl Layout {
    /// Compute segment count, entries per segment, entry stride and file size.
    pub fn plan(req: &LayoutRequest) -> Result<Layout> {
        if req.entries == 0 {
            return Err(capacity("entry count must be positive"));
        }
        if req.max_key_size == 0 {
            return Err(capacity("key size must be positive"));
        }

        let key_region = align_up(req.max_key_size as u64, 8);
        let min_payload = req.max_key_size as u64 + req.max_value_size as u64;
        let value_capacity = match req.entry_size {
            Some(entry_size) if (entry_size as u64) < min_payload => {
                return Err(capacity(format!(
                    "entry size {entry_size} cannot hold a {}-byte key and a {}-byte value",
                    req.max_key_size, req.max_value_size
                )));
            }
            Some(entry_size) => {
                (req.max_value_size as u64).max((entry_size as u64).saturating_sub(key_region))
            }
            None => req.max_value_size as u64,
        };
        let entry_stride = SLOT_HEADER_SIZE as u64 + key_region + align_up(value_capacity, 8);
        if entry_stride > u32::MAX as u64 || value_capacity > u32::MAX as u64 {
            return Err(capacity(format!("entry stride {entry_stride} is too large")));
        }

        let wanted = (req.min_segments.max(1) as u64)
            .max(req.entries.div_ceil(MAX_ENTRIES_PER_SEGMENT))
            .next_power_of_two();
        if wanted > 1 << 31 {
            return Err(capacity(format!("{wanted} segments is too many")));
        }
        let segment_count = wanted as u32;
        let entries_per_segment = req.entries.div_ceil(wanted) as u32;
        let buckets_per_segment = entries_per_segment.next_power_of_two();

        let mut layout = Layout {
            segment_count,
            entries_per_segment,
            buckets_per_segment,
            key_capacity: req.max_key_size,
            value_capacity: value_capacity as u32,
            entry_stride: entry_stride as u32,
            segment_stride: 0,
            file_size: 0,
        };
        layout.segment_stride = layout.compute_segment_stride();
        layout.file_size = (segment_count as u64)
            .checked_mul(layout.segment_stride)
            .and_then(|n| n.checked_add(HEADER_SIZE as u64))
            .filter(|&n| n <= isize::MAX as u64)
            .ok_or_else(|| capacity("file size overflows the address space"))?;
        Ok(layout)
    }

    /// Rebuild a layout from a file header, rejecting anything this build
    /// would not have written itself.
    pub fn from_header(header: &Header) -> Result<Layout> {
        if header.magic != MAGIC {
            return Err(MapError::FormatMismatch("bad magic".into()));
        }
        if header.version != FORMAT_VERSION {
            return Err(MapError::FormatMismatch(format!(
                "format version {} (expected {FORMAT_VERSION})",
                header.version
            )));
        }
        if header.segment_count == 0
            || header.entries_per_segment == 0
            || header.key_capacity == 0
            || header.buckets_per_segment != header.entries_per_segment.next_power_of_two()
        {
            return Err(MapError::FormatMismatch("invalid segment geometry".into()));
        }
        let expected_stride = SLOT_HEADER_SIZE as u64
            + align_up(header.key_capacity as u64, 8)
            + align_up(header.value_capacity as u64, 8);
        if header.entry_stride as u64 != expected_stride {
            return Err(MapError::FormatMismatch(format!(
                "entry stride {} (expected {expected_stride})",
                header.entry_stride
            )));
        }

        let layout = Layout {
            segment_count: header.segment_count,
            entries_per_segment: header.entries_per_segment,
            buckets_per_segment: header.buckets_per_segment,
            key_capacity: header.key_capacity,
            value_capacity: header.value_capacity,
            entry_stride: header.entry_stride,
            segment_stride: header.segment_stride,
            file_size: header.file_size,
        };
        let file_size = (layout.segment_count as u64)
            .checked_mul(layout.compute_segment_stride())
            .and_then(|n| n.checked_add(HEADER_SIZE as u64));
        if layout.segment_stride != layout.compute_segment_stride()
            || file_size != Some(layout.file_size)
        {
            return Err(MapError::FormatMismatch("segment stride or file size disagree".into()));
        }
        Ok(layout)
    }

    /// Header bytes for a freshly created file. `ready` stays 0 until the
    /// creator has initialised every segment.
    pub fn to_header(&self) -> Header {
        Header {
            magic: MAGIC,
            segment_stride: self.segment_stride,
            file_size: self.file_size,
            version: FORMAT_VERSION,
            segment_count: self.segment_count,
            entries_per_segment: self.entries_per_segment,
            buckets_per_segment: self.buckets_per_segment,
            entry_stride: self.entry_stride,
            key_capacity: self.key_capacity,
            value_capacity: self.value_capacity,
            ready: 0,
            _pad: [0; 25],
        }
    }

    #[cfg(test)]
    pub fn total_entries(&self) -> u64 {
        self.segment_count as u64 * self.entries_per_segment as u64
    }

    /// Number of u64 words in a segment's free-slot bitset.
    pub fn bitset_words(&self) -> usize {
        (self.entries_per_segment as usize).div_ceil(64)
    }

    /// Offset of segment `index` from the start of the file.
    pub fn segment_offset(&self, index: usize) -> usize {
        HEADER_SIZE + index * self.segment_stride as usize
    }

    /// Offsets below are relative to the start of a segment.
    pub fn bitset_offset(&self) -> usize {
        SEGMENT_HEADER_SIZE
    }

    pub fn buckets_offset(&self) -> usize {
        self.bitset_offset() + self.bitset_words() * 8
    }

    pub fn slots_offset(&self) -> usize {
        align_up(
            (self.buckets_offset() + self.buckets_per_segment as usize * 4) as u64,
            8,
        ) as usize
    }

    #[cfg(test)]
    pub fn slot_offset(&self, slot: u32) -> usize {
        self.slots_offset() + slot as usize * self.entry_stride as usize
    }

    /// Offset of the value bytes inside a slot.
    pub fn value_offset_in_slot(&self) -> usize {
        SLOT_HEADER_SIZE + align_up(self.key_capacity as u64, 8) as usize
    }

    fn compute_segment_stride(&self) -> u64 {
        let end = self.slots_offset() as u64
            + self.entries_per_segment as u64 * self.entry_stride as u64;
        align_up(end, SEGMENT_ALIGN)
    }
}
