//! The bulk hashmap: array-at-a-time insert, activate, find, erase, and the
//! handle-based record access operations built on top of the slab and the
//! bucket table.

mod bucket_array;
mod slab;

use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::slice;

use bucket_array::BucketArray;
use slab::Slab;

use crate::device::{Blob, Device, HostCpu};
use crate::error::{Error, Result};

/// Stable, opaque handle to a live record.
///
/// An [`EntryRef`] names a record slot in the hashmap's slab together with
/// the slab incarnation that minted it. It stays valid until the record's
/// key is erased or the table is rehashed; a ref from an older incarnation
/// is ignored by [`Hashmap::unpack_iterators`] and
/// [`Hashmap::assign_iterators`].
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EntryRef {
    index: u32,
    generation: u32,
}

impl EntryRef {
    /// The ref written alongside a `false` mask bit when no record exists.
    pub const NONE: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slab slot the ref points at.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns `true` if the ref does not name any record.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.index == u32::MAX
    }
}

const ENTRY_REF_BYTES: usize = size_of::<EntryRef>();

/// Raw device address smuggled into kernels; every kernel writes only its
/// own index, so concurrent use is race-free.
#[derive(Clone, Copy)]
struct KernelPtr(*mut u8);

unsafe impl Send for KernelPtr {}
unsafe impl Sync for KernelPtr {}

impl KernelPtr {
    #[inline]
    const fn get(self) -> *mut u8 {
        self.0
    }
}

/// A device-parallel hashmap over fixed-width, byte-typed keys and values.
///
/// All mutation happens inside bulk calls: the caller hands in contiguous
/// device arrays of `count` keys (and values), and every index is processed
/// by one data-parallel worker. Each worker hashes its key, locks the target
/// bucket, walks the chain, and claims or releases a slab record; the
/// outcome is reported per index through the caller-provided handle and mask
/// arrays. Mutating calls take `&mut self`, so overlapping bulk calls on one
/// table are rejected at compile time.
///
/// # Examples
///
/// ```
/// use bulkmap::{Device, Hashmap, HostCpu};
///
/// let device = HostCpu::default();
/// let keys = device.upload(&[100_i32, 300, 500]).unwrap();
/// let values = device.upload(&[1_i32, 3, 5]).unwrap();
///
/// let mut map = Hashmap::new(8, 4, 4, device.clone()).unwrap();
/// let mut masks = device.allocate(3).unwrap();
/// map.insert(&keys, &values, None, Some(&mut masks), 3).unwrap();
///
/// assert_eq!(map.len(), 3);
/// assert_eq!(device.download_masks(&masks).unwrap(), vec![true; 3]);
/// ```
pub struct Hashmap<D: Device = HostCpu> {
    device: D,
    dsize_key: usize,
    dsize_value: usize,
    slab: Slab,
    buckets: BucketArray,
}

impl<D: Device> Hashmap<D> {
    /// Creates a hashmap with `init_capacity` record slots and a bucket
    /// count equal to `init_capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidShape`] if any size is zero, or
    /// [`Error::Allocation`] if the slab arena cannot be allocated.
    pub fn new(
        init_capacity: usize,
        dsize_key: usize,
        dsize_value: usize,
        device: D,
    ) -> Result<Self> {
        Self::with_buckets(init_capacity, init_capacity, dsize_key, dsize_value, device)
    }

    /// Creates a hashmap with separately chosen bucket and record counts.
    ///
    /// `init_buckets` is kept exactly; the load factor is
    /// `len() / init_buckets` with no hidden rounding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidShape`] if any size is zero, or
    /// [`Error::Allocation`] if the slab arena cannot be allocated.
    pub fn with_buckets(
        init_buckets: usize,
        init_capacity: usize,
        dsize_key: usize,
        dsize_value: usize,
        device: D,
    ) -> Result<Self> {
        if init_buckets == 0 || init_capacity == 0 {
            return Err(Error::InvalidShape(
                "bucket and record counts must be positive",
            ));
        }
        if dsize_key == 0 || dsize_value == 0 {
            return Err(Error::InvalidShape(
                "key and value byte widths must be positive",
            ));
        }
        let slab = Slab::new(&device, init_capacity, dsize_key, dsize_value)?;
        let buckets = BucketArray::new(init_buckets);
        Ok(Self {
            device,
            dsize_key,
            dsize_value,
            slab,
            buckets,
        })
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.capacity() - self.slab.free_len()
    }

    /// Returns `true` if no record is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of simultaneously live records.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Number of buckets in the table.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.bucket_count()
    }

    /// Configured key width in bytes.
    #[must_use]
    pub fn dsize_key(&self) -> usize {
        self.dsize_key
    }

    /// Configured value width in bytes.
    #[must_use]
    pub fn dsize_value(&self) -> usize {
        self.dsize_value
    }

    /// The device the table lives on.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Per-bucket chain lengths, for load diagnostics.
    #[must_use]
    pub fn bucket_sizes(&self) -> Vec<usize> {
        (0..self.buckets.bucket_count())
            .map(|b| self.buckets.bucket_at(b).len())
            .collect()
    }

    /// `len() / bucket_count()`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn load_factor(&self) -> f32 {
        self.len() as f32 / self.buckets.bucket_count() as f32
    }

    /// Inserts `count` key/value pairs.
    ///
    /// Per index `i`: if the key is absent and a record slot is available,
    /// the pair is stored and `masks[i]` reads `true`; if the key is already
    /// present, `refs[i]` names the surviving record and `masks[i]` reads
    /// `false`; if the slab is exhausted, `refs[i]` is [`EntryRef::NONE`]
    /// and `masks[i]` reads `false`. Duplicate keys within one call resolve
    /// to exactly one success even when `masks_out` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if any
    /// array is misplaced or too small; no outputs are written in that case.
    pub fn insert(
        &mut self,
        input_keys: &Blob,
        input_values: &Blob,
        refs_out: Option<&mut Blob>,
        masks_out: Option<&mut Blob>,
        count: usize,
    ) -> Result<()> {
        self.check_input(input_keys, count, self.dsize_key, "key array too small")?;
        self.check_input(input_values, count, self.dsize_value, "value array too small")?;
        let refs_ptr = self.take_ref_out(refs_out, count)?;
        let masks_ptr = self.take_mask_out(masks_out, count)?;
        self.upsert(input_keys, Some(input_values), refs_ptr, masks_ptr, count);
        Ok(())
    }

    /// Inserts `count` keys without writing their value bytes.
    ///
    /// The value region of each newly activated record holds whatever bytes
    /// the slot last carried until the caller fills it through
    /// [`Hashmap::assign_iterators`]. Intended for large values that are
    /// cheaper to produce in place than to stage through an input array.
    /// Mask semantics match [`Hashmap::insert`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if any
    /// array is misplaced or too small.
    pub fn activate(
        &mut self,
        input_keys: &Blob,
        refs_out: &mut Blob,
        masks_out: &mut Blob,
        count: usize,
    ) -> Result<()> {
        self.check_input(input_keys, count, self.dsize_key, "key array too small")?;
        let refs_ptr = self.take_ref_out(Some(refs_out), count)?;
        let masks_ptr = self.take_mask_out(Some(masks_out), count)?;
        self.upsert(input_keys, None, refs_ptr, masks_ptr, count);
        Ok(())
    }

    /// Looks up `count` keys.
    ///
    /// Per index `i`: on a hit, `refs[i]` names the record and `masks[i]`
    /// reads `true`; on a miss, `masks[i]` reads `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if any
    /// array is misplaced or too small.
    pub fn find(
        &self,
        input_keys: &Blob,
        refs_out: &mut Blob,
        masks_out: &mut Blob,
        count: usize,
    ) -> Result<()> {
        self.check_input(input_keys, count, self.dsize_key, "key array too small")?;
        self.check_input(refs_out, count, ENTRY_REF_BYTES, "ref array too small")?;
        self.check_input(masks_out, count, 1, "mask array too small")?;

        let dk = self.dsize_key;
        let keys_ptr = KernelPtr(input_keys.as_ptr().cast_mut());
        let refs_ptr = KernelPtr(refs_out.kernel_ptr());
        let masks_ptr = KernelPtr(masks_out.kernel_ptr());
        let slab = &self.slab;
        let buckets = &self.buckets;
        let generation = slab.generation();

        self.device.parallel_for(count, |i| {
            let key = unsafe { slice::from_raw_parts(keys_ptr.get().add(i * dk), dk) };
            let hash = BucketArray::hash(key);
            let writer = buckets.bucket(hash).write();
            let found = writer.search(slab, key, BucketArray::partial(hash));
            drop(writer);
            unsafe {
                let entry = found.map_or(EntryRef::NONE, |index| EntryRef::new(index, generation));
                refs_ptr.get().cast::<EntryRef>().add(i).write(entry);
                masks_ptr.get().add(i).write(u8::from(found.is_some()));
            }
        });
        self.device.sync();
        Ok(())
    }

    /// Erases `count` keys, releasing the record slot of every hit.
    ///
    /// Per index `i`: `masks[i]` reads `true` if the key was present and its
    /// record was removed. The released bytes are not zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if any
    /// array is misplaced or too small.
    pub fn erase(
        &mut self,
        input_keys: &Blob,
        masks_out: Option<&mut Blob>,
        count: usize,
    ) -> Result<()> {
        self.check_input(input_keys, count, self.dsize_key, "key array too small")?;
        let masks_ptr = self.take_mask_out(masks_out, count)?;

        let dk = self.dsize_key;
        let keys_ptr = KernelPtr(input_keys.as_ptr().cast_mut());
        let slab = &self.slab;
        let buckets = &self.buckets;

        self.device.parallel_for(count, |i| {
            let key = unsafe { slice::from_raw_parts(keys_ptr.get().add(i * dk), dk) };
            let hash = BucketArray::hash(key);
            let writer = buckets.bucket(hash).write();
            let found = writer.search(slab, key, BucketArray::partial(hash));
            if let Some(index) = found {
                writer.unlink(index);
                slab.release(index);
            }
            drop(writer);
            if let Some(p) = masks_ptr {
                unsafe { p.get().add(i).write(u8::from(found.is_some())) };
            }
        });
        self.device.sync();
        Ok(())
    }

    /// Collects a ref to every live record into `refs_out`, densely packed.
    ///
    /// Records are grouped by bucket in bucket-index order; the order within
    /// one bucket follows its chain. Returns the number of refs written,
    /// which equals [`Hashmap::len`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if
    /// `refs_out` is misplaced or too small for [`Hashmap::len`] refs.
    pub fn get_iterators(&self, refs_out: &mut Blob) -> Result<usize> {
        let total = self.len();
        self.check_input(refs_out, total, ENTRY_REF_BYTES, "ref array too small")?;

        // Exclusive prefix sum over chain lengths packs the output densely.
        let bucket_count = self.buckets.bucket_count();
        let mut offsets = Vec::with_capacity(bucket_count);
        let mut running = 0_usize;
        for b in 0..bucket_count {
            offsets.push(running);
            running += self.buckets.bucket_at(b).len();
        }
        debug_assert_eq!(running, total);

        let refs_ptr = KernelPtr(refs_out.kernel_ptr());
        let buckets = &self.buckets;
        let offsets = &offsets;
        let generation = self.slab.generation();

        self.device.parallel_for(bucket_count, |b| {
            let mut cursor = offsets[b];
            unsafe {
                buckets.for_each_index(b, |index| {
                    refs_ptr
                        .get()
                        .cast::<EntryRef>()
                        .add(cursor)
                        .write(EntryRef::new(index, generation));
                    cursor += 1;
                });
            }
        });
        self.device.sync();
        Ok(total)
    }

    /// Copies the key and/or value bytes of `count` referenced records into
    /// contiguous output arrays.
    ///
    /// Index `i` is processed when `masks[i]` is `true` (or `input_masks` is
    /// `None`) and `refs[i]` names a record of the current slab incarnation;
    /// other indices leave their output rows untouched. Either output may be
    /// `None` to skip that side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if any
    /// array is misplaced or too small.
    pub fn unpack_iterators(
        &self,
        input_refs: &Blob,
        input_masks: Option<&Blob>,
        output_keys: Option<&mut Blob>,
        output_values: Option<&mut Blob>,
        count: usize,
    ) -> Result<()> {
        self.check_input(input_refs, count, ENTRY_REF_BYTES, "ref array too small")?;
        let masks_ptr = self.take_mask_in(input_masks, count)?;
        let keys_ptr = match output_keys {
            Some(blob) => {
                self.check_input(blob, count, self.dsize_key, "key output too small")?;
                Some(KernelPtr(blob.kernel_ptr()))
            }
            None => None,
        };
        let values_ptr = match output_values {
            Some(blob) => {
                self.check_input(blob, count, self.dsize_value, "value output too small")?;
                Some(KernelPtr(blob.kernel_ptr()))
            }
            None => None,
        };

        let dk = self.dsize_key;
        let dv = self.dsize_value;
        let refs_ptr = KernelPtr(input_refs.as_ptr().cast_mut());
        let slab = &self.slab;

        self.device.parallel_for(count, |i| unsafe {
            if let Some(p) = masks_ptr {
                if p.get().add(i).read() == 0 {
                    return;
                }
            }
            let entry = refs_ptr.get().cast::<EntryRef>().add(i).read();
            if entry.generation != slab.generation() || entry.index as usize >= slab.capacity() {
                return;
            }
            if let Some(p) = keys_ptr {
                ptr::copy_nonoverlapping(slab.key_ptr(entry.index), p.get().add(i * dk), dk);
            }
            if let Some(p) = values_ptr {
                ptr::copy_nonoverlapping(slab.value_ptr(entry.index), p.get().add(i * dv), dv);
            }
        });
        self.device.sync();
        Ok(())
    }

    /// Writes `count` value rows into the referenced records in place.
    ///
    /// Index `i` is processed when `masks[i]` is `true` (or `input_masks` is
    /// `None`) and `refs[i]` names a record of the current slab incarnation.
    /// Keys are not touched; the caller manages key/value correspondence
    /// around the refs it holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] or [`Error::InvalidShape`] if any
    /// array is misplaced or too small.
    pub fn assign_iterators(
        &mut self,
        input_refs: &Blob,
        input_masks: Option<&Blob>,
        input_values: &Blob,
        count: usize,
    ) -> Result<()> {
        self.check_input(input_refs, count, ENTRY_REF_BYTES, "ref array too small")?;
        self.check_input(input_values, count, self.dsize_value, "value array too small")?;
        let masks_ptr = self.take_mask_in(input_masks, count)?;

        let dv = self.dsize_value;
        let refs_ptr = KernelPtr(input_refs.as_ptr().cast_mut());
        let values_ptr = KernelPtr(input_values.as_ptr().cast_mut());
        let slab = &self.slab;

        self.device.parallel_for(count, |i| unsafe {
            if let Some(p) = masks_ptr {
                if p.get().add(i).read() == 0 {
                    return;
                }
            }
            let entry = refs_ptr.get().cast::<EntryRef>().add(i).read();
            if entry.generation != slab.generation() || entry.index as usize >= slab.capacity() {
                return;
            }
            ptr::copy_nonoverlapping(values_ptr.get().add(i * dv), slab.value_ptr(entry.index), dv);
        });
        self.device.sync();
        Ok(())
    }

    /// Rebuilds the table with `new_bucket_count` buckets.
    ///
    /// All live records are collected, a fresh slab sized
    /// `max(len() * 2, new_bucket_count)` and a fresh bucket table are
    /// built, and the records are bulk re-inserted. Every [`EntryRef`]
    /// issued before the call is invalidated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidShape`] if `new_bucket_count` is zero, or
    /// [`Error::Allocation`] if the staging buffers or the new slab cannot
    /// be allocated; the table is left unchanged on error.
    pub fn rehash(&mut self, new_bucket_count: usize) -> Result<()> {
        if new_bucket_count == 0 {
            return Err(Error::InvalidShape("bucket count must be positive"));
        }
        let live = self.len();
        let mut refs = self.device.allocate(live * ENTRY_REF_BYTES)?;
        let collected = self.get_iterators(&mut refs)?;
        debug_assert_eq!(collected, live);
        let mut keys = self.device.allocate(live * self.dsize_key)?;
        let mut values = self.device.allocate(live * self.dsize_value)?;
        self.unpack_iterators(&refs, None, Some(&mut keys), Some(&mut values), live)?;

        let capacity = (live * 2).max(new_bucket_count);
        let slab = Slab::new(&self.device, capacity, self.dsize_key, self.dsize_value)?;
        let buckets = BucketArray::new(new_bucket_count);
        self.slab = slab;
        self.buckets = buckets;
        self.insert(&keys, &values, None, None, live)?;

        log::debug!("rehashed {live} records into {new_bucket_count} buckets (capacity {capacity})");
        Ok(())
    }

    fn ensure_device(&self, blob: &Blob) -> Result<()> {
        if blob.device() == self.device.id() {
            Ok(())
        } else {
            Err(Error::DeviceMismatch {
                expected: self.device.id(),
                actual: blob.device(),
            })
        }
    }

    fn check_input(
        &self,
        blob: &Blob,
        count: usize,
        width: usize,
        what: &'static str,
    ) -> Result<()> {
        self.ensure_device(blob)?;
        let needed = count
            .checked_mul(width)
            .ok_or(Error::InvalidShape("element count overflows"))?;
        if blob.len() < needed {
            return Err(Error::InvalidShape(what));
        }
        Ok(())
    }

    fn take_ref_out(&self, refs_out: Option<&mut Blob>, count: usize) -> Result<Option<KernelPtr>> {
        match refs_out {
            Some(blob) => {
                self.check_input(blob, count, ENTRY_REF_BYTES, "ref array too small")?;
                Ok(Some(KernelPtr(blob.kernel_ptr())))
            }
            None => Ok(None),
        }
    }

    fn take_mask_out(
        &self,
        masks_out: Option<&mut Blob>,
        count: usize,
    ) -> Result<Option<KernelPtr>> {
        match masks_out {
            Some(blob) => {
                self.check_input(blob, count, 1, "mask array too small")?;
                Ok(Some(KernelPtr(blob.kernel_ptr())))
            }
            None => Ok(None),
        }
    }

    fn take_mask_in(&self, masks_in: Option<&Blob>, count: usize) -> Result<Option<KernelPtr>> {
        match masks_in {
            Some(blob) => {
                self.check_input(blob, count, 1, "mask array too small")?;
                Ok(Some(KernelPtr(blob.as_ptr().cast_mut())))
            }
            None => Ok(None),
        }
    }

    /// Shared kernel of `insert` and `activate`; `input_values` is `None`
    /// for activation, which leaves the value region untouched.
    fn upsert(
        &mut self,
        input_keys: &Blob,
        input_values: Option<&Blob>,
        refs_ptr: Option<KernelPtr>,
        masks_ptr: Option<KernelPtr>,
        count: usize,
    ) {
        let dk = self.dsize_key;
        let dv = self.dsize_value;
        let keys_ptr = KernelPtr(input_keys.as_ptr().cast_mut());
        let values_ptr = input_values.map(|blob| KernelPtr(blob.as_ptr().cast_mut()));
        let slab = &self.slab;
        let buckets = &self.buckets;
        let generation = slab.generation();

        self.device.parallel_for(count, |i| {
            let key = unsafe { slice::from_raw_parts(keys_ptr.get().add(i * dk), dk) };
            let hash = BucketArray::hash(key);
            let partial = BucketArray::partial(hash);
            let writer = buckets.bucket(hash).write();

            let (entry, inserted) = if let Some(found) = writer.search(slab, key, partial) {
                (EntryRef::new(found, generation), false)
            } else if let Some(claimed) = slab.claim() {
                unsafe {
                    ptr::copy_nonoverlapping(key.as_ptr(), slab.key_ptr(claimed), dk);
                    if let Some(values) = values_ptr {
                        ptr::copy_nonoverlapping(
                            values.get().add(i * dv),
                            slab.value_ptr(claimed),
                            dv,
                        );
                    }
                }
                writer.link(claimed, partial);
                (EntryRef::new(claimed, generation), true)
            } else {
                (EntryRef::NONE, false)
            };
            drop(writer);

            unsafe {
                if let Some(p) = refs_ptr {
                    p.get().cast::<EntryRef>().add(i).write(entry);
                }
                if let Some(p) = masks_ptr {
                    p.get().add(i).write(u8::from(inserted));
                }
            }
        });
        self.device.sync();
    }
}

impl<D: Device> fmt::Debug for Hashmap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hashmap")
            .field("device", &self.device.id())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("bucket_count", &self.bucket_count())
            .field("dsize_key", &self.dsize_key)
            .field("dsize_value", &self.dsize_value)
            .finish()
    }
}
