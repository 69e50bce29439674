//! Device abstraction: memory allocation, transfers, and the data-parallel
//! dispatch primitive that every bulk hashmap call is built on.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Memory and compute domains a hashmap can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DeviceKind {
    /// Host memory, bulk work dispatched on a CPU thread pool.
    Cpu,
}

/// Identifies one memory+compute domain, e.g. `CPU:0`.
///
/// Allocations and parallel work are scoped to a single [`DeviceId`]; mixing
/// arrays from different devices in one bulk call fails with
/// [`Error::DeviceMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    kind: DeviceKind,
    index: u16,
}

impl DeviceId {
    /// Creates a new [`DeviceId`].
    #[must_use]
    pub const fn new(kind: DeviceKind, index: u16) -> Self {
        Self { kind, index }
    }

    /// Returns the device kind.
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Returns the device ordinal within its kind.
    #[must_use]
    pub const fn index(&self) -> u16 {
        self.index
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "CPU:{}", self.index),
        }
    }
}

/// Alignment of every [`Blob`] allocation.
///
/// Large enough for any primitive element type callers store in a blob.
const BLOB_ALIGN: usize = 8;

/// An untyped, fixed-length allocation owned by a device.
///
/// A [`Blob`] is the unit of storage every bulk call operates on: input key
/// and value arrays, output handle and mask arrays, and the hashmap's own
/// slab arena are all blobs on the same device. The memory is released when
/// the blob is dropped.
pub struct Blob {
    ptr: NonNull<u8>,
    len: usize,
    device: DeviceId,
}

// The blob is a plain byte arena; concurrent access is coordinated by the
// code dispatching kernels over it.
unsafe impl Send for Blob {}
unsafe impl Sync for Blob {}

impl Blob {
    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, BLOB_ALIGN).map_err(|_| Error::Allocation(len))
    }

    pub(crate) fn zeroed(len: usize, device: DeviceId) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
                device,
            });
        }
        let layout = Self::layout(len)?;
        let Some(ptr) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
            return Err(Error::Allocation(len));
        };
        Ok(Self { ptr, len, device })
    }

    /// Returns the length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the blob has zero length.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the device the blob resides on.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Returns the base address of the allocation.
    ///
    /// The address is only dereferenceable by the owning device's kernels;
    /// host code goes through [`Device::copy_to_host`].
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Returns the mutable base address of the allocation.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base address for kernel-side writes dispatched over disjoint indices.
    pub(crate) const fn kernel_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if self.len != 0 {
            // The layout was validated at allocation time.
            if let Ok(layout) = Self::layout(self.len) {
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Capability set of a memory+compute domain.
///
/// A device hands out [`Blob`] allocations, moves bytes between host and
/// device memory, runs data-parallel kernels over an index range, and
/// establishes the happens-before edge between device work and subsequent
/// host reads. The hashmap is generic over this trait; [`HostCpu`] is the
/// variant shipped today, an accelerator implements the same seam.
pub trait Device: Clone + Send + Sync + 'static {
    /// Returns the identifier of this device.
    fn id(&self) -> DeviceId;

    /// Allocates `len` zero-initialized bytes on the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the allocation cannot be satisfied.
    fn allocate(&self, len: usize) -> Result<Blob>;

    /// Copies `src` into `dst` starting at byte `dst_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] if `dst` is not on this device, or
    /// [`Error::InvalidShape`] if the copy does not fit.
    fn copy_to_device(&self, src: &[u8], dst: &mut Blob, dst_offset: usize) -> Result<()>;

    /// Copies `dst.len()` bytes out of `src` starting at byte `src_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] if `src` is not on this device, or
    /// [`Error::InvalidShape`] if the copy does not fit.
    fn copy_to_host(&self, src: &Blob, src_offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Invokes `kernel(i)` for every `i` in `[0, n)`, partitioned across the
    /// device's workers in no particular order.
    fn parallel_for<F: Fn(usize) + Sync>(&self, n: usize, kernel: F);

    /// Blocks until all device work dispatched so far is observable from the
    /// host.
    fn sync(&self);

    /// Allocates a blob holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the allocation cannot be satisfied.
    fn upload<T: bytemuck::Pod>(&self, data: &[T]) -> Result<Blob> {
        let bytes = bytemuck::cast_slice::<T, u8>(data);
        let mut blob = self.allocate(bytes.len())?;
        self.copy_to_device(bytes, &mut blob, 0)?;
        Ok(blob)
    }

    /// Copies a whole blob back to the host as a typed vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidShape`] if the blob length is not a multiple
    /// of `size_of::<T>()`, or [`Error::DeviceMismatch`] if the blob is not
    /// on this device.
    fn download<T: bytemuck::Pod>(&self, blob: &Blob) -> Result<Vec<T>> {
        let width = std::mem::size_of::<T>();
        if width == 0 || blob.len() % width != 0 {
            return Err(Error::InvalidShape("blob length is not a whole number of elements"));
        }
        let mut out = vec![T::zeroed(); blob.len() / width];
        self.copy_to_host(blob, 0, bytemuck::cast_slice_mut::<T, u8>(&mut out))?;
        Ok(out)
    }

    /// Copies a mask blob back to the host as booleans.
    ///
    /// Mask blobs store one byte per index; any non-zero byte reads as
    /// `true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceMismatch`] if the blob is not on this device.
    fn download_masks(&self, blob: &Blob) -> Result<Vec<bool>> {
        let bytes: Vec<u8> = self.download(blob)?;
        Ok(bytes.into_iter().map(|b| b != 0).collect())
    }
}

/// The host CPU device: host memory plus a dedicated rayon thread pool.
///
/// Cloning the handle shares the pool; the pool lives exactly as long as the
/// last handle, never tied to any hashmap placed on it.
#[derive(Clone)]
pub struct HostCpu {
    pool: Arc<rayon::ThreadPool>,
    id: DeviceId,
}

impl HostCpu {
    /// Creates a host device with a pool of `num_threads` workers, or the
    /// rayon default when `num_threads` is zero.
    ///
    /// # Panics
    ///
    /// Panics if the thread pool cannot be spawned.
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .expect("failed to spawn the host worker pool");
        Self {
            pool: Arc::new(pool),
            id: DeviceId::new(DeviceKind::Cpu, 0),
        }
    }
}

impl Default for HostCpu {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for HostCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCpu")
            .field("id", &self.id)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Device for HostCpu {
    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    fn allocate(&self, len: usize) -> Result<Blob> {
        Blob::zeroed(len, self.id)
    }

    fn copy_to_device(&self, src: &[u8], dst: &mut Blob, dst_offset: usize) -> Result<()> {
        if dst.device() != self.id {
            return Err(Error::DeviceMismatch {
                expected: self.id,
                actual: dst.device(),
            });
        }
        let end = dst_offset
            .checked_add(src.len())
            .ok_or(Error::InvalidShape("copy range overflows"))?;
        if end > dst.len() {
            return Err(Error::InvalidShape("copy does not fit in the target blob"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr().add(dst_offset), src.len());
        }
        Ok(())
    }

    fn copy_to_host(&self, src: &Blob, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        if src.device() != self.id {
            return Err(Error::DeviceMismatch {
                expected: self.id,
                actual: src.device(),
            });
        }
        let end = src_offset
            .checked_add(dst.len())
            .ok_or(Error::InvalidShape("copy range overflows"))?;
        if end > src.len() {
            return Err(Error::InvalidShape("copy does not fit in the source blob"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(src_offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn parallel_for<F: Fn(usize) + Sync>(&self, n: usize, kernel: F) {
        if n == 0 {
            return;
        }
        self.pool
            .install(|| (0..n).into_par_iter().for_each(|i| kernel(i)));
    }

    #[inline]
    fn sync(&self) {
        // `parallel_for` joins the pool before returning, so host reads that
        // follow already observe all kernel writes.
    }
}
