//! Fixed-slot allocator over a segment's free-slot bitset.
//!
//! Bit `i` set means slot `i` is in use. Words are atomics because a
//! [`ValueRef`](crate::atomic::ValueRef) reads the used bit without the
//! segment lock; every write still happens under the lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Bits of word `word` that map to real slots.
#[inline]
fn valid_mask(word: usize, capacity: u32) -> u64 {
    let remaining = capacity as usize - word * 64;
    if remaining >= 64 {
        u64::MAX
    } else {
        (1u64 << remaining) - 1
    }
}

/// Claim a free slot, scanning from the word named by `hint`.
///
/// Returns `None` when all `capacity` slots are in use.
/// Caller must hold the segment lock.
pub fn allocate(words: &[AtomicU64], capacity: u32, hint: &AtomicU32) -> Option<u32> {
    let n = words.len();
    if n == 0 {
        return None;
    }
    let start = hint.load(Ordering::Relaxed) as usize % n;

    for i in 0..n {
        let w = (start + i) % n;
        let bits = words[w].load(Ordering::Relaxed);
        let free = !bits & valid_mask(w, capacity);
        if free != 0 {
            let bit = free.trailing_zeros();
            words[w].fetch_or(1 << bit, Ordering::Release);
            hint.store(w as u32, Ordering::Relaxed);
            return Some((w * 64) as u32 + bit);
        }
    }
    None
}

/// Release a slot. The slot's bytes are left as they are.
///
/// Returns whether the slot was in use. Caller must hold the segment lock.
pub fn free(words: &[AtomicU64], slot: u32) -> bool {
    let mask = 1u64 << (slot % 64);
    let prev = words[slot as usize / 64].fetch_and(!mask, Ordering::Release);
    prev & mask != 0
}

#[inline]
pub fn is_used(words: &[AtomicU64], slot: u32) -> bool {
    words[slot as usize / 64].load(Ordering::Acquire) & (1u64 << (slot % 64)) != 0
}

#[cfg(test)]
pub fn count_used(words: &[AtomicU64]) -> u32 {
    words
        .iter()
        .map(|w| w.load(Ordering::Relaxed).count_ones())
        .sum()
}

/// Mark every slot free. Caller must hold the segment lock.
pub fn clear(words: &[AtomicU64], hint: &AtomicU32) {
    for w in words {
        w.store(0, Ordering::Release);
    }
    hint.store(0, Ordering::Relaxed);
}

/// Iterate the indices of used slots.
pub fn used_slots(words: &[AtomicU64]) -> impl Iterator<Item = u32> + '_ {
    words.iter().enumerate().flat_map(|(w, word)| {
        let mut bits = word.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let bit = bits.trailing_zeros();
            bits &= bits - 1;
            Some((w * 64) as u32 + bit)
        })
    })
}
