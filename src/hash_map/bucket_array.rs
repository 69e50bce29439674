//! Bucket table: hashing, per-bucket locking, and chain maintenance.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::slab::Slab;

/// Entries a bucket stores inline before spilling to its heap tail.
pub(crate) const BUCKET_LEN: usize = 8;

const HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Chain state of one bucket; only touched while the bucket lock is held,
/// except for the quiescent sweeps documented on [`BucketArray`].
struct Chain {
    /// Occupancy bitmap over the inline slots.
    occupied: u8,
    /// One byte of hash per inline slot, checked before comparing key bytes.
    partial_hash: [u8; BUCKET_LEN],
    /// Slab indices of the inline entries.
    slots: [u32; BUCKET_LEN],
    /// Overflow chain, in insertion order.
    spill: Vec<u32>,
}

impl Chain {
    const fn new() -> Self {
        Self {
            occupied: 0,
            partial_hash: [0; BUCKET_LEN],
            slots: [0; BUCKET_LEN],
            spill: Vec::new(),
        }
    }
}

/// A bounded chain of slab indices behind a CAS lock word.
#[repr(align(64))]
pub(crate) struct Bucket {
    lock: AtomicU32,
    len: AtomicU32,
    chain: UnsafeCell<Chain>,
}

// Chain access is serialized by the lock word within a bulk call, and bulk
// calls on one table never overlap.
unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}

impl Bucket {
    fn new() -> Self {
        Self {
            lock: AtomicU32::new(UNLOCKED),
            len: AtomicU32::new(0),
            chain: UnsafeCell::new(Chain::new()),
        }
    }

    /// Acquires the bucket for chain mutation or traversal.
    pub(crate) fn write(&self) -> Writer<'_> {
        let mut spins = 0_u32;
        while self
            .lock
            .compare_exchange_weak(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        Writer { bucket: self }
    }

    /// Number of live entries in the chain.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Relaxed) as usize
    }
}

/// Holds the exclusive lock on one [`Bucket`] for the duration of a single
/// per-index operation.
pub(crate) struct Writer<'b> {
    bucket: &'b Bucket,
}

impl Drop for Writer<'_> {
    #[inline]
    fn drop(&mut self) {
        self.bucket.lock.store(UNLOCKED, Release);
    }
}

impl Writer<'_> {
    #[allow(clippy::mut_from_ref)]
    fn chain(&self) -> &mut Chain {
        // The lock word is held for the guard's lifetime.
        unsafe { &mut *self.bucket.chain.get() }
    }

    /// Finds the slab index whose record key equals `key`.
    pub(crate) fn search(&self, slab: &Slab, key: &[u8], partial: u8) -> Option<u32> {
        let chain = self.chain();
        let mut occupied = chain.occupied;
        while occupied != 0 {
            let i = occupied.trailing_zeros() as usize;
            occupied &= occupied - 1;
            if chain.partial_hash[i] == partial {
                let index = chain.slots[i];
                if unsafe { slab.key_bytes(index) } == key {
                    return Some(index);
                }
            }
        }
        chain
            .spill
            .iter()
            .copied()
            .find(|&index| unsafe { slab.key_bytes(index) } == key)
    }

    /// Links a claimed slab index into the chain.
    pub(crate) fn link(&self, index: u32, partial: u8) {
        let chain = self.chain();
        let free = chain.occupied.trailing_ones() as usize;
        if free < BUCKET_LEN {
            chain.occupied |= 1_u8 << free;
            chain.partial_hash[free] = partial;
            chain.slots[free] = index;
        } else {
            chain.spill.push(index);
        }
        self.bucket.len.fetch_add(1, Relaxed);
    }

    /// Unlinks the entry holding `index` from the chain.
    pub(crate) fn unlink(&self, index: u32) {
        let chain = self.chain();
        let mut occupied = chain.occupied;
        while occupied != 0 {
            let i = occupied.trailing_zeros() as usize;
            occupied &= occupied - 1;
            if chain.slots[i] == index {
                chain.occupied &= !(1_u8 << i);
                self.bucket.len.fetch_sub(1, Relaxed);
                return;
            }
        }
        if let Some(pos) = chain.spill.iter().position(|&s| s == index) {
            chain.spill.swap_remove(pos);
            self.bucket.len.fetch_sub(1, Relaxed);
        }
    }
}

/// The top-level table: `bucket_count` lock-protected chains.
///
/// `bucket_count` is kept exactly as constructed; the hash is reduced with a
/// modulo so callers control the load factor precisely.
pub(crate) struct BucketArray {
    buckets: Box<[Bucket]>,
}

impl BucketArray {
    pub(crate) fn new(bucket_count: usize) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
        }
    }

    /// Hashes raw key bytes.
    #[inline]
    pub(crate) fn hash(key: &[u8]) -> u64 {
        xxh3_64_with_seed(key, HASH_SEED)
    }

    /// One byte of `hash` used to skip key comparisons during chain scans.
    #[inline]
    pub(crate) const fn partial(hash: u64) -> u8 {
        (hash >> 56) as u8
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// The bucket owning `hash`.
    #[inline]
    pub(crate) fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    #[inline]
    pub(crate) fn bucket_at(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    /// Visits every slab index chained under bucket `index`, inline entries
    /// first, spill entries in insertion order.
    ///
    /// # Safety
    ///
    /// The table must be quiescent: no bulk call may be mutating any chain.
    pub(crate) unsafe fn for_each_index(&self, bucket: usize, mut f: impl FnMut(u32)) {
        let chain = unsafe { &*self.buckets[bucket].chain.get() };
        let mut occupied = chain.occupied;
        while occupied != 0 {
            let i = occupied.trailing_zeros() as usize;
            occupied &= occupied - 1;
            f(chain.slots[i]);
        }
        for &spilled in &chain.spill {
            f(spilled);
        }
    }
}
