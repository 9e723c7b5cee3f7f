//! Mapped-memory map engine.
//!
//! Provides `ShmTable`, a byte-level concurrent hash map whose entire state
//! (header, segment locks, free-slot bitsets, bucket heads, entry slots)
//! lives in one memory-mapped file. Any number of threads in any number of
//! processes can map the same file and operate on it at once.
//!
//! A key's hash picks a segment and a bucket inside it. Every structural
//! change happens while holding that segment's lock word, acquired by CAS
//! on the mapped memory. There is no global lock.

pub mod alloc;
pub mod chain;
pub mod layout;
pub mod lock;
pub mod region;
pub mod segment;

use std::path::Path;
use std::time::Duration;

use layout::Layout;
use lock::LockPolicy;
use region::MappedFile;
use segment::Segment;

use crate::error::{MapError, Result};

/// How `put` treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Insert or overwrite.
    Upsert,
    /// Insert only; an existing value is left untouched.
    IfAbsent,
    /// Overwrite only; a missing key is not inserted.
    IfPresent,
}

/// Arena-style handle to a live entry: segment, slot, and the slot
/// generation observed when the handle was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub(crate) segment: usize,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl SlotRef {
    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// 64-bit finaliser so routing does not depend on the quality of the low
/// bits of the caller's hash.
#[inline]
pub fn spread(hash: u64) -> u64 {
    let mut z = hash;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The byte-level engine over one mapped file.
pub struct ShmTable {
    region: MappedFile,
    policy: LockPolicy,
}

impl ShmTable {
    /// Create the file with `layout`, or open it if it exists with the
    /// same layout.
    pub fn open_or_create(
        path: &Path,
        layout: &Layout,
        policy: LockPolicy,
        init_wait: Duration,
    ) -> Result<Self> {
        let region = MappedFile::open_or_create(path, layout, init_wait)?;
        Ok(ShmTable { region, policy })
    }

    /// Open an existing file with whatever layout its header describes.
    pub fn open(path: &Path, policy: LockPolicy, init_wait: Duration) -> Result<Self> {
        let region = MappedFile::open(path, init_wait)?;
        Ok(ShmTable { region, policy })
    }

    pub fn layout(&self) -> &Layout {
        self.region.layout()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn segment(&self, index: usize) -> Segment<'_> {
        Segment::new(&self.region, index)
    }

    /// Segment index and bucket for a key hash.
    #[inline]
    pub fn route(&self, key_hash: u64) -> (usize, u32) {
        let layout = self.layout();
        let h = spread(key_hash);
        let segments = layout.segment_count as u64;
        let segment = (h % segments) as usize;
        let bucket = ((h / segments) & (layout.buckets_per_segment as u64 - 1)) as u32;
        (segment, bucket)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        let max = self.layout().key_capacity as usize;
        if key.len() > max {
            return Err(MapError::KeyTooLarge {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    /// A key longer than the key capacity can never have been stored.
    fn key_fits(&self, key: &[u8]) -> bool {
        key.len() <= self.layout().key_capacity as usize
    }

    /// Whether a slot handle names a slot of this file.
    fn in_bounds(&self, slot_ref: &SlotRef) -> bool {
        let layout = self.layout();
        slot_ref.segment < layout.segment_count as usize
            && slot_ref.slot < layout.entries_per_segment
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        let max = self.layout().value_capacity as usize;
        if value.len() > max {
            return Err(MapError::ValueTooLarge {
                len: value.len(),
                max,
            });
        }
        Ok(())
    }

    /// Look a key up and hand its value bytes to `f` while the segment is
    /// locked.
    pub fn get<R, F>(&self, key_hash: u64, key: &[u8], f: F) -> Result<Option<R>>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if !self.key_fits(key) {
            return Ok(None);
        }
        let (seg_idx, bucket) = self.route(key_hash);
        let seg = self.segment(seg_idx);
        let guard = seg.lock(&self.policy)?;
        Ok(seg
            .find(&guard, key_hash, bucket, key)
            .map(|pos| f(seg.value_bytes(&guard, pos.slot))))
    }

    /// Insert or overwrite according to `mode`.
    ///
    /// If the key was present, `f` sees its value bytes before any
    /// overwrite and its result is returned.
    pub fn put<R, F>(
        &self,
        key_hash: u64,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
        f: F,
    ) -> Result<Option<R>>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.check_key(key)?;
        self.check_value(value)?;
        let (seg_idx, bucket) = self.route(key_hash);
        let seg = self.segment(seg_idx);
        let guard = seg.lock(&self.policy)?;

        match seg.find(&guard, key_hash, bucket, key) {
            Some(pos) => {
                let prev = f(seg.value_bytes(&guard, pos.slot));
                if mode != PutMode::IfAbsent {
                    seg.write_value(&guard, pos.slot, value);
                }
                Ok(Some(prev))
            }
            None if mode == PutMode::IfPresent => Ok(None),
            None => {
                seg.insert(&guard, key_hash, bucket, key, value)?;
                Ok(None)
            }
        }
    }

    /// Unlink and free a key's slot, handing the removed value bytes to `f`.
    pub fn remove<R, F>(&self, key_hash: u64, key: &[u8], f: F) -> Result<Option<R>>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if !self.key_fits(key) {
            return Ok(None);
        }
        let (seg_idx, bucket) = self.route(key_hash);
        let seg = self.segment(seg_idx);
        let guard = seg.lock(&self.policy)?;

        match seg.find(&guard, key_hash, bucket, key) {
            Some(pos) => {
                let removed = f(seg.value_bytes(&guard, pos.slot));
                seg.remove(&guard, bucket, pos);
                Ok(Some(removed))
            }
            None => Ok(None),
        }
    }

    /// Handle to the slot currently holding `key`.
    pub fn locate(&self, key_hash: u64, key: &[u8]) -> Result<Option<SlotRef>> {
        if !self.key_fits(key) {
            return Ok(None);
        }
        let (seg_idx, bucket) = self.route(key_hash);
        let seg = self.segment(seg_idx);
        let guard = seg.lock(&self.policy)?;
        Ok(seg.find(&guard, key_hash, bucket, key).map(|pos| SlotRef {
            segment: seg_idx,
            slot: pos.slot,
            generation: seg.generation(pos.slot),
        }))
    }

    /// Read a referenced slot's value under its segment lock. `None` if the
    /// slot has been freed or reused.
    pub fn read_slot<R, F>(&self, slot_ref: &SlotRef, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if !self.in_bounds(slot_ref) {
            return Ok(None);
        }
        let seg = self.segment(slot_ref.segment);
        let guard = seg.lock(&self.policy)?;
        if !seg.is_live(slot_ref.slot, slot_ref.generation) {
            return Ok(None);
        }
        Ok(Some(f(seg.value_bytes(&guard, slot_ref.slot))))
    }

    /// Lock-free liveness check for a slot handle.
    pub fn is_live(&self, slot_ref: &SlotRef) -> bool {
        self.in_bounds(slot_ref)
            && self
                .segment(slot_ref.segment)
                .is_live(slot_ref.slot, slot_ref.generation)
    }

    /// Start of a referenced slot's value bytes in the mapping, or `None`
    /// for a handle outside this file.
    pub fn value_ptr(&self, slot_ref: &SlotRef) -> Option<*mut u8> {
        self.in_bounds(slot_ref)
            .then(|| self.segment(slot_ref.segment).value_ptr(slot_ref.slot))
    }

    /// Sum of per-segment used counts, read without locking. Segments
    /// mutated concurrently may be counted before or after their change.
    pub fn len(&self) -> usize {
        (0..self.layout().segment_count as usize)
            .map(|i| self.segment(i).used() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry count with every segment locked at once (in index order, so
    /// it cannot deadlock against single-segment operations).
    pub fn exact_len(&self) -> Result<usize> {
        let segments: Vec<Segment<'_>> = (0..self.layout().segment_count as usize)
            .map(|i| self.segment(i))
            .collect();
        let mut guards = Vec::with_capacity(segments.len());
        for seg in &segments {
            guards.push(seg.lock(&self.policy)?);
        }
        Ok(segments.iter().map(|s| s.used() as usize).sum())
    }

    /// Remove every entry, one segment at a time.
    pub fn clear(&self) -> Result<()> {
        for i in 0..self.layout().segment_count as usize {
            let seg = self.segment(i);
            let guard = seg.lock(&self.policy)?;
            seg.clear(&guard);
        }
        Ok(())
    }

    /// Visit every entry of segment `index` under its lock.
    pub fn scan_segment<F>(&self, index: usize, f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let seg = self.segment(index);
        let guard = seg.lock(&self.policy)?;
        seg.for_each_entry(&guard, f);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()?;
        tracing::debug!(path = %self.path().display(), "flushed shared map file");
        Ok(())
    }
}
