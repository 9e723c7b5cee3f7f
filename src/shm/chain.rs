//! Bucket chains operating on raw segment bytes.
//!
//! Each bucket head holds the index of the first slot in its chain; each
//! slot's `next` links to the following slot of the same bucket. Lookups
//! compare the stored hash first and then the encoded key bytes, so two
//! keys with equal hashes never alias.

use super::layout::{SlotHeader, SLOT_HEADER_SIZE, SLOT_NONE};

/// Where a key sits in its chain. `prev == SLOT_NONE` means it is the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPos {
    pub slot: u32,
    pub prev: u32,
}

/// Pointer to a slot's header.
///
/// # Safety
/// `slab` must point to the slot array of a segment and `slot` must be in range.
#[inline]
pub unsafe fn slot_ptr(slab: *const u8, stride: u32, slot: u32) -> *mut SlotHeader {
    slab.add(slot as usize * stride as usize) as *mut SlotHeader
}

/// Stored key bytes of a slot.
///
/// # Safety
/// Same as [`slot_ptr`]; the slot must have been written.
#[inline]
pub unsafe fn slot_key<'a>(slab: *const u8, stride: u32, slot: u32) -> &'a [u8] {
    let p = slot_ptr(slab, stride, slot);
    std::slice::from_raw_parts((p as *const u8).add(SLOT_HEADER_SIZE), (*p).key_len as usize)
}

/// Find `key_bytes` in the chain rooted at `bucket`.
///
/// Walks at most `limit` links so a corrupted chain cannot loop forever.
///
/// # Safety
/// `buckets` must point to the segment's bucket heads, `slab` to its slot
/// array, and the caller must hold the segment lock.
pub unsafe fn chain_find(
    buckets: *const u32,
    bucket: u32,
    slab: *const u8,
    stride: u32,
    limit: u32,
    key_hash: u64,
    key_bytes: &[u8],
) -> Option<ChainPos> {
    let mut prev = SLOT_NONE;
    let mut cur = *buckets.add(bucket as usize);

    for _ in 0..limit {
        if cur == SLOT_NONE {
            return None;
        }
        let p = slot_ptr(slab, stride, cur);
        if (*p).key_hash == key_hash
            && (*p).key_len as usize == key_bytes.len()
            && slot_key(slab, stride, cur) == key_bytes
        {
            return Some(ChainPos { slot: cur, prev });
        }
        prev = cur;
        cur = (*p).next;
    }
    None
}

/// Link `slot` in at the head of `bucket`'s chain.
///
/// # Safety
/// Same as [`chain_find`]; `slot` must not already be in any chain.
pub unsafe fn chain_push(buckets: *mut u32, bucket: u32, slab: *mut u8, stride: u32, slot: u32) {
    let head = buckets.add(bucket as usize);
    (*slot_ptr(slab, stride, slot)).next = *head;
    *head = slot;
}

/// Unlink the slot at `pos` by patching its predecessor or the bucket head.
///
/// # Safety
/// Same as [`chain_find`]; `pos` must come from a `chain_find` on the same
/// bucket with no mutation in between.
pub unsafe fn chain_unlink(buckets: *mut u32, bucket: u32, slab: *mut u8, stride: u32, pos: ChainPos) {
    let removed = slot_ptr(slab, stride, pos.slot);
    let next = (*removed).next;
    if pos.prev == SLOT_NONE {
        *buckets.add(bucket as usize) = next;
    } else {
        (*slot_ptr(slab, stride, pos.prev)).next = next;
    }
    (*removed).next = SLOT_NONE;
}

/// Empty every bucket.
///
/// # Safety
/// `buckets` must point to `count` bucket heads; caller holds the segment lock.
pub unsafe fn buckets_clear(buckets: *mut u32, count: u32) {
    for i in 0..count as usize {
        *buckets.add(i) = SLOT_NONE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_STRIDE: u32 = 64;
    const LIMIT: u32 = 16;

    fn make_buckets(count: u32) -> Vec<u32> {
        let mut buf = vec![0u32; count as usize];
        unsafe { buckets_clear(buf.as_mut_ptr(), count) };
        buf
    }

    /// u64 backing keeps slot headers 8-aligned.
    fn make_slab(num_slots: u32) -> Vec<u64> {
        vec![0u64; num_slots as usize * TEST_STRIDE as usize / 8]
    }

    /// Byte-level writes matching the `#[repr(C)]` SlotHeader layout:
    ///   0..8   key_hash
    ///   12..16 key_len
    ///   24..   key bytes
    fn write_slot(slab: &mut [u64], slot: u32, key_hash: u64, key: &[u8]) {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(slab);
        let off = slot as usize * TEST_STRIDE as usize;
        bytes[off..off + 8].copy_from_slice(&key_hash.to_ne_bytes());
        bytes[off + 12..off + 16].copy_from_slice(&(key.len() as u32).to_ne_bytes());
        bytes[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + key.len()].copy_from_slice(key);
    }

    fn find(buckets: &[u32], slab: &[u64], bucket: u32, hash: u64, key: &[u8]) -> Option<ChainPos> {
        unsafe {
            chain_find(
                buckets.as_ptr(),
                bucket,
                slab.as_ptr() as *const u8,
                TEST_STRIDE,
                LIMIT,
                hash,
                key,
            )
        }
    }

    fn push(buckets: &mut [u32], slab: &mut [u64], bucket: u32, slot: u32) {
        unsafe {
            chain_push(
                buckets.as_mut_ptr(),
                bucket,
                slab.as_mut_ptr() as *mut u8,
                TEST_STRIDE,
                slot,
            )
        }
    }

    fn unlink(buckets: &mut [u32], slab: &mut [u64], bucket: u32, pos: ChainPos) {
        unsafe {
            chain_unlink(
                buckets.as_mut_ptr(),
                bucket,
                slab.as_mut_ptr() as *mut u8,
                TEST_STRIDE,
                pos,
            )
        }
    }

    #[test]
    fn push_and_find() {
        let mut buckets = make_buckets(4);
        let mut slab = make_slab(4);
        write_slot(&mut slab, 2, 42, b"hello");
        push(&mut buckets, &mut slab, 1, 2);

        assert_eq!(
            find(&buckets, &slab, 1, 42, b"hello"),
            Some(ChainPos { slot: 2, prev: SLOT_NONE })
        );
        assert_eq!(find(&buckets, &slab, 1, 42, b"hellp"), None);
        assert_eq!(find(&buckets, &slab, 0, 42, b"hello"), None);
    }

    #[test]
    fn equal_hashes_compare_key_bytes() {
        let mut buckets = make_buckets(4);
        let mut slab = make_slab(4);
        write_slot(&mut slab, 0, 7, b"aaa");
        write_slot(&mut slab, 1, 7, b"bbb");
        push(&mut buckets, &mut slab, 3, 0);
        push(&mut buckets, &mut slab, 3, 1);

        // Chain is 1 -> 0.
        assert_eq!(
            find(&buckets, &slab, 3, 7, b"aaa"),
            Some(ChainPos { slot: 0, prev: 1 })
        );
        assert_eq!(
            find(&buckets, &slab, 3, 7, b"bbb"),
            Some(ChainPos { slot: 1, prev: SLOT_NONE })
        );
        assert_eq!(find(&buckets, &slab, 3, 7, b"ccc"), None);
    }

    #[test]
    fn unlink_head_middle_and_tail() {
        let mut buckets = make_buckets(2);
        let mut slab = make_slab(4);
        for (slot, key) in [(0u32, b"k0"), (1, b"k1"), (2, b"k2"), (3, b"k3")] {
            write_slot(&mut slab, slot, 100 + slot as u64, key);
            push(&mut buckets, &mut slab, 0, slot);
        }
        // Chain is 3 -> 2 -> 1 -> 0.

        let middle = find(&buckets, &slab, 0, 102, b"k2").unwrap();
        unlink(&mut buckets, &mut slab, 0, middle);
        assert_eq!(find(&buckets, &slab, 0, 102, b"k2"), None);
        assert_eq!(
            find(&buckets, &slab, 0, 101, b"k1"),
            Some(ChainPos { slot: 1, prev: 3 })
        );

        let head = find(&buckets, &slab, 0, 103, b"k3").unwrap();
        unlink(&mut buckets, &mut slab, 0, head);
        assert_eq!(buckets[0], 1);

        let tail = find(&buckets, &slab, 0, 100, b"k0").unwrap();
        unlink(&mut buckets, &mut slab, 0, tail);
        assert_eq!(
            find(&buckets, &slab, 0, 101, b"k1"),
            Some(ChainPos { slot: 1, prev: SLOT_NONE })
        );

        let last = find(&buckets, &slab, 0, 101, b"k1").unwrap();
        unlink(&mut buckets, &mut slab, 0, last);
        assert_eq!(buckets[0], SLOT_NONE);
    }

    #[test]
    fn walk_is_bounded_on_a_cycle() {
        let mut buckets = make_buckets(1);
        let mut slab = make_slab(2);
        write_slot(&mut slab, 0, 1, b"a");
        write_slot(&mut slab, 1, 2, b"b");
        push(&mut buckets, &mut slab, 0, 0);
        push(&mut buckets, &mut slab, 0, 1);
        // Corrupt: 0 -> 1 closes the loop 1 -> 0 -> 1.
        unsafe { (*slot_ptr(slab.as_mut_ptr() as *const u8, TEST_STRIDE, 0)).next = 1 };

        assert_eq!(find(&buckets, &slab, 0, 3, b"c"), None);
    }

    #[test]
    fn clear_empties_all_buckets() {
        let mut buckets = make_buckets(8);
        let mut slab = make_slab(8);
        for slot in 0..8u32 {
            write_slot(&mut slab, slot, slot as u64, &[slot as u8]);
            push(&mut buckets, &mut slab, slot, slot);
        }
        unsafe { buckets_clear(buckets.as_mut_ptr(), 8) };
        for slot in 0..8u32 {
            assert_eq!(find(&buckets, &slab, slot, slot as u64, &[slot as u8]), None);
        }
    }
}
