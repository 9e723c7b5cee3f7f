//! One independently lockable partition of the mapped file.
//!
//! A `Segment` is a borrowed view; all state lives in the mapping. Methods
//! that touch chains, the bitset or slot bytes take the segment's
//! [`SegmentGuard`] as proof the lock is held.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::alloc;
use super::chain::{self, ChainPos};
use super::layout::{Layout, SegmentHeader, SlotHeader, SLOT_HEADER_SIZE};
use super::lock::{LockPolicy, SegmentGuard, SegmentLock};
use super::region::MappedFile;
use crate::error::{MapError, Result};

pub struct Segment<'a> {
    base: *mut u8,
    layout: &'a Layout,
    index: usize,
    _region: PhantomData<&'a MappedFile>,
}

impl<'a> Segment<'a> {
    pub fn new(region: &'a MappedFile, index: usize) -> Self {
        let layout = region.layout();
        debug_assert!(index < layout.segment_count as usize);
        Segment {
            base: unsafe { region.base_ptr().add(layout.segment_offset(index)) },
            layout,
            index,
            _region: PhantomData,
        }
    }

    fn header(&self) -> &'a SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    fn bitset(&self) -> &'a [AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(self.layout.bitset_offset()) as *const AtomicU64,
                self.layout.bitset_words(),
            )
        }
    }

    fn buckets(&self) -> *mut u32 {
        unsafe { self.base.add(self.layout.buckets_offset()) as *mut u32 }
    }

    fn slab(&self) -> *mut u8 {
        unsafe { self.base.add(self.layout.slots_offset()) }
    }

    fn slot_ptr(&self, slot: u32) -> *mut SlotHeader {
        unsafe { chain::slot_ptr(self.slab(), self.layout.entry_stride, slot) }
    }

    fn generation_word(&self, slot: u32) -> &'a AtomicU32 {
        unsafe { &*std::ptr::addr_of!((*self.slot_ptr(slot)).generation) }
    }

    pub fn lock(&self, policy: &LockPolicy) -> Result<SegmentGuard<'a>> {
        SegmentLock::new(&self.header().lock, self.index).lock(policy)
    }

    /// Slots in use. Read without the lock, so only a snapshot.
    pub fn used(&self) -> u32 {
        self.header().used.load(Ordering::Relaxed)
    }

    pub fn generation(&self, slot: u32) -> u32 {
        self.generation_word(slot).load(Ordering::Acquire)
    }

    /// Whether `slot` is in use and still carries `generation`. Lock-free.
    pub fn is_live(&self, slot: u32, generation: u32) -> bool {
        slot < self.layout.entries_per_segment
            && alloc::is_used(self.bitset(), slot)
            && self.generation(slot) == generation
    }

    /// Start of a slot's value bytes.
    pub fn value_ptr(&self, slot: u32) -> *mut u8 {
        unsafe { (self.slot_ptr(slot) as *mut u8).add(self.layout.value_offset_in_slot()) }
    }

    #[inline]
    fn check_guard(&self, guard: &SegmentGuard<'_>) {
        debug_assert_eq!(guard.segment(), self.index, "guard belongs to another segment");
    }

    pub fn find(&self, guard: &SegmentGuard<'_>, key_hash: u64, bucket: u32, key: &[u8]) -> Option<ChainPos> {
        self.check_guard(guard);
        unsafe {
            chain::chain_find(
                self.buckets(),
                bucket,
                self.slab(),
                self.layout.entry_stride,
                self.layout.entries_per_segment,
                key_hash,
                key,
            )
        }
    }

    pub fn key_bytes<'g>(&self, guard: &'g SegmentGuard<'_>, slot: u32) -> &'g [u8] {
        self.check_guard(guard);
        unsafe { chain::slot_key(self.slab(), self.layout.entry_stride, slot) }
    }

    pub fn value_bytes<'g>(&self, guard: &'g SegmentGuard<'_>, slot: u32) -> &'g [u8] {
        self.check_guard(guard);
        unsafe {
            let len = (*self.slot_ptr(slot)).value_len as usize;
            std::slice::from_raw_parts(self.value_ptr(slot), len)
        }
    }

    /// Overwrite a slot's value in place. `value` must fit the value capacity.
    pub fn write_value(&self, guard: &SegmentGuard<'_>, slot: u32, value: &[u8]) {
        self.check_guard(guard);
        debug_assert!(value.len() <= self.layout.value_capacity as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(value.as_ptr(), self.value_ptr(slot), value.len());
            (*self.slot_ptr(slot)).value_len = value.len() as u32;
        }
    }

    /// Allocate a slot, write key and value, and link it into `bucket`.
    pub fn insert(
        &self,
        guard: &SegmentGuard<'_>,
        key_hash: u64,
        bucket: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<u32> {
        self.check_guard(guard);
        let header = self.header();
        let slot = alloc::allocate(
            self.bitset(),
            self.layout.entries_per_segment,
            &header.alloc_hint,
        )
        .ok_or_else(|| {
            tracing::debug!(segment = self.index, "segment is full");
            MapError::OutOfSegmentSpace {
                segment: self.index,
            }
        })?;

        unsafe {
            let p = self.slot_ptr(slot);
            (*p).key_hash = key_hash;
            (*p).key_len = key.len() as u32;
            std::ptr::copy_nonoverlapping(
                key.as_ptr(),
                (p as *mut u8).add(SLOT_HEADER_SIZE),
                key.len(),
            );
            self.generation_word(slot).fetch_add(1, Ordering::Release);
            self.write_value(guard, slot, value);
            chain::chain_push(self.buckets(), bucket, self.slab(), self.layout.entry_stride, slot);
        }
        header.used.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Unlink the slot at `pos` and return it to the allocator. Bytes stay.
    pub fn remove(&self, guard: &SegmentGuard<'_>, bucket: u32, pos: ChainPos) {
        self.check_guard(guard);
        unsafe {
            chain::chain_unlink(self.buckets(), bucket, self.slab(), self.layout.entry_stride, pos);
        }
        if alloc::free(self.bitset(), pos.slot) {
            self.header().used.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Drop every entry of the segment.
    pub fn clear(&self, guard: &SegmentGuard<'_>) {
        self.check_guard(guard);
        let header = self.header();
        alloc::clear(self.bitset(), &header.alloc_hint);
        unsafe { chain::buckets_clear(self.buckets(), self.layout.buckets_per_segment) };
        header.used.store(0, Ordering::Relaxed);
    }

    /// Visit the key and value bytes of every used slot.
    pub fn for_each_entry<F>(&self, guard: &SegmentGuard<'_>, mut f: F)
    where
        F: FnMut(&[u8], &[u8]),
    {
        for slot in alloc::used_slots(self.bitset()) {
            f(self.key_bytes(guard, slot), self.value_bytes(guard, slot));
        }
    }
}
