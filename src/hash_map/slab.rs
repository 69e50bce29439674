//! Fixed-capacity record pool with a lock-free free-list.

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicI64, AtomicU32};

use crate::device::{Blob, Device};
use crate::error::{Error, Result};

/// Marks a free-list cell whose index has been taken but not yet replaced.
const VACANT: u32 = u32::MAX;

/// Source of slab incarnation numbers; every [`Slab`] gets a fresh one so
/// that handles minted before a rehash can never alias the new storage.
static GENERATION: AtomicU32 = AtomicU32::new(1);

/// A contiguous pool of `capacity` equally-sized key+value records.
///
/// Records carry no header; a slab index is live exactly when some bucket
/// chain contains it, and free exactly when the free-list does. `claim` and
/// `release` are safe against each other and against themselves across all
/// workers of a single bulk call.
pub(crate) struct Slab {
    arena: Blob,
    free: Box<[AtomicU32]>,
    /// Number of free records. Transiently negative while concurrent claims
    /// race past exhaustion; never observed negative outside a bulk call.
    free_len: AtomicI64,
    capacity: usize,
    dsize_key: usize,
    dsize_value: usize,
    pitch: usize,
    generation: u32,
}

impl Slab {
    /// Allocates the record arena on `device` and populates the free-list
    /// with every index in `[0, capacity)`.
    pub(crate) fn new<D: Device>(
        device: &D,
        capacity: usize,
        dsize_key: usize,
        dsize_value: usize,
    ) -> Result<Self> {
        let pitch = dsize_key + dsize_value;
        let bytes = capacity
            .checked_mul(pitch)
            .ok_or(Error::Allocation(usize::MAX))?;
        let arena = device.allocate(bytes)?;
        let free: Box<[AtomicU32]> = (0..capacity)
            .map(|i| AtomicU32::new(i as u32))
            .collect();
        Ok(Self {
            arena,
            free,
            free_len: AtomicI64::new(capacity as i64),
            capacity,
            dsize_key,
            dsize_value,
            pitch,
            generation: GENERATION.fetch_add(1, Relaxed),
        })
    }

    /// Takes one free record index, or `None` if the slab is exhausted.
    pub(crate) fn claim(&self) -> Option<u32> {
        let remaining = self.free_len.fetch_sub(1, Relaxed);
        if remaining <= 0 {
            self.free_len.fetch_add(1, Relaxed);
            return None;
        }
        let cell = &self.free[(remaining - 1) as usize];
        // A concurrent `release` may have bumped the counter before storing
        // the index; spin until the cell holds one.
        loop {
            let index = cell.swap(VACANT, Acquire);
            if index != VACANT {
                return Some(index);
            }
            std::hint::spin_loop();
        }
    }

    /// Returns a claimed record index to the free-list.
    pub(crate) fn release(&self, index: u32) {
        debug_assert!((index as usize) < self.capacity);
        let slot = self.free_len.fetch_add(1, Relaxed);
        debug_assert!(slot >= 0 && (slot as usize) < self.capacity);
        let cell = &self.free[slot as usize];
        loop {
            if cell
                .compare_exchange(VACANT, index, Release, Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Number of records currently in the free-list.
    pub(crate) fn free_len(&self) -> usize {
        self.free_len.load(Acquire).max(0) as usize
    }

    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) const fn dsize_key(&self) -> usize {
        self.dsize_key
    }

    #[inline]
    pub(crate) const fn dsize_value(&self) -> usize {
        self.dsize_value
    }

    #[inline]
    pub(crate) const fn generation(&self) -> u32 {
        self.generation
    }

    /// Address of the key bytes of record `index`.
    #[inline]
    pub(crate) fn key_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.capacity);
        unsafe { self.arena.kernel_ptr().add(index as usize * self.pitch) }
    }

    /// Address of the value bytes of record `index`.
    #[inline]
    pub(crate) fn value_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.key_ptr(index).add(self.dsize_key) }
    }

    /// Key bytes of record `index`.
    ///
    /// # Safety
    ///
    /// The record must be live and no kernel may be writing its key bytes.
    #[inline]
    pub(crate) unsafe fn key_bytes(&self, index: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.key_ptr(index), self.dsize_key) }
    }
}
