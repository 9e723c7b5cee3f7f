//! In-place views of a live entry.
//!
//! A [`ValueRef`] names a slot by `(segment, slot, generation)` rather than
//! by pointer. Reads through it take the segment lock. An [`AtomicField`]
//! instead performs a single hardware-atomic operation on a numeric field
//! inside the mapped value, without the segment lock.
//!
//! Every atomic operation first checks that the slot is still in use and
//! still carries the generation seen at lookup, and fails with
//! [`MapError::StaleReference`] otherwise. That check is not atomic with the
//! update: a `remove` (and re-insert into the same slot) racing with an
//! atomic operation on the same key can still land the update in the new
//! entry. Callers that mix whole-value writes with atomic field updates on
//! one key must order them themselves.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::{MapError, Result};
use crate::shm::{ShmTable, SlotRef};

/// Reference to a live entry, obtained from
/// [`SharedHashMap::get_ref`](crate::SharedHashMap::get_ref).
pub struct ValueRef<'a, V, VC> {
    table: Arc<ShmTable>,
    slot: SlotRef,
    codec: &'a VC,
    _value: PhantomData<fn() -> V>,
}

impl<'a, V, VC: Codec<V>> ValueRef<'a, V, VC> {
    pub(crate) fn new(table: Arc<ShmTable>, slot: SlotRef, codec: &'a VC) -> Self {
        ValueRef {
            table,
            slot,
            codec,
            _value: PhantomData,
        }
    }

    pub fn slot(&self) -> SlotRef {
        self.slot
    }

    /// Whether the slot still holds the entry this reference was taken for.
    pub fn is_live(&self) -> bool {
        self.table.is_live(&self.slot)
    }

    /// Decode the current value under the segment lock.
    pub fn read(&self) -> Result<V> {
        match self.table.read_slot(&self.slot, |b| self.codec.decode(b))? {
            Some(decoded) => decoded.map_err(|e| MapError::ValueEncoding(e.to_string())),
            None => Err(MapError::StaleReference),
        }
    }

    /// Atomic view of the named 64-bit field of the value.
    pub fn field_u64(&self, name: &str) -> Result<AtomicField<'_, u64>> {
        self.at_offset(self.named_offset(name)?)
    }

    /// Atomic view of the named 32-bit field of the value.
    pub fn field_u32(&self, name: &str) -> Result<AtomicField<'_, u32>> {
        self.at_offset(self.named_offset(name)?)
    }

    /// Atomic view of the 64-bit word at `offset` bytes into the value.
    pub fn at_offset_u64(&self, offset: usize) -> Result<AtomicField<'_, u64>> {
        self.at_offset(offset)
    }

    fn named_offset(&self, name: &str) -> Result<usize> {
        self.codec
            .field_offset(name)
            .ok_or_else(|| MapError::InvalidField(format!("value type has no field {name:?}")))
    }

    fn at_offset<W: FieldWord>(&self, offset: usize) -> Result<AtomicField<'_, W>> {
        let size = std::mem::size_of::<W>();
        let capacity = self.table.layout().value_capacity as usize;
        let limit = self
            .codec
            .fixed_size()
            .map_or(capacity, |fixed| capacity.min(fixed as usize));

        if offset % size != 0 {
            return Err(MapError::InvalidField(format!(
                "offset {offset} is not aligned to {size} bytes"
            )));
        }
        if offset + size > limit {
            return Err(MapError::InvalidField(format!(
                "{size}-byte field at offset {offset} exceeds the {limit}-byte value"
            )));
        }
        if !self.is_live() {
            return Err(MapError::StaleReference);
        }
        let base = self.table.value_ptr(&self.slot).ok_or(MapError::StaleReference)?;
        // Value regions start 8-aligned, so an aligned offset is an aligned address.
        let ptr = unsafe { base.add(offset) };
        Ok(AtomicField {
            table: &self.table,
            slot: self.slot,
            ptr,
            _word: PhantomData,
        })
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Integer widths an [`AtomicField`] can operate on.
pub trait FieldWord: Copy + sealed::Sealed {
    #[doc(hidden)]
    type Atomic;
    #[doc(hidden)]
    unsafe fn atomic<'a>(ptr: *mut u8) -> &'a Self::Atomic;
    #[doc(hidden)]
    fn load(a: &Self::Atomic) -> Self;
    #[doc(hidden)]
    fn store(a: &Self::Atomic, v: Self);
    #[doc(hidden)]
    fn add(a: &Self::Atomic, delta: Self) -> Self;
    #[doc(hidden)]
    fn compare_and_swap(a: &Self::Atomic, current: Self, new: Self) -> bool;
}

macro_rules! impl_field_word {
    ($t:ty, $atomic:ty) => {
        impl sealed::Sealed for $t {}

        impl FieldWord for $t {
            type Atomic = $atomic;

            unsafe fn atomic<'a>(ptr: *mut u8) -> &'a $atomic {
                &*(ptr as *const $atomic)
            }

            fn load(a: &$atomic) -> $t {
                a.load(Ordering::SeqCst)
            }

            fn store(a: &$atomic, v: $t) {
                a.store(v, Ordering::SeqCst)
            }

            fn add(a: &$atomic, delta: $t) -> $t {
                a.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta)
            }

            fn compare_and_swap(a: &$atomic, current: $t, new: $t) -> bool {
                a.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }
        }
    };
}

impl_field_word!(u64, AtomicU64);
impl_field_word!(u32, AtomicU32);

/// A numeric field inside a mapped value, updated with hardware atomics.
pub struct AtomicField<'r, W: FieldWord> {
    table: &'r ShmTable,
    slot: SlotRef,
    ptr: *mut u8,
    _word: PhantomData<W>,
}

impl<W: FieldWord> AtomicField<'_, W> {
    fn word(&self) -> Result<&W::Atomic> {
        if !self.table.is_live(&self.slot) {
            return Err(MapError::StaleReference);
        }
        Ok(unsafe { W::atomic(self.ptr) })
    }

    pub fn load(&self) -> Result<W> {
        Ok(W::load(self.word()?))
    }

    pub fn store(&self, value: W) -> Result<()> {
        W::store(self.word()?, value);
        Ok(())
    }

    /// Wrapping add. Returns the value after the addition.
    pub fn add(&self, delta: W) -> Result<W> {
        Ok(W::add(self.word()?, delta))
    }

    /// Set to `new` if the field holds `current`. Returns whether it did.
    pub fn compare_and_swap(&self, current: W, new: W) -> Result<bool> {
        Ok(W::compare_and_swap(self.word()?, current, new))
    }
}
