//! Deduplication of a key array, the one operator exported to the geometry
//! layer.

use std::mem::size_of;

use crate::device::{Blob, Device};
use crate::error::{Error, Result};
use crate::hash_map::Hashmap;

/// Computes the keep-mask that deduplicates a key array.
///
/// `keys` holds `count` keys of `dsize_key` bytes each. The returned blob
/// holds one mask byte per input index; exactly one index per distinct key
/// reads non-zero — the index whose insert created the record, which is
/// unspecified among duplicates. The deduplicated key set is the input
/// array filtered by the mask, which the caller applies — voxel
/// downsampling feeds quantized `i64` 3-vectors through here and then
/// gathers the surviving points.
///
/// Internally builds a hashmap with one bucket and one record slot per
/// input key, inserts every key with its input index as the value, and
/// returns the insertion masks.
///
/// # Errors
///
/// Returns [`Error::InvalidShape`] if `dsize_key` is zero or the key array
/// is too small, or [`Error::DeviceMismatch`] if `keys` is not on `device`.
///
/// # Examples
///
/// ```
/// use bulkmap::{unique, Device, HostCpu};
///
/// let device = HostCpu::default();
/// let keys = device.upload(&[7_i64, 7, 3]).unwrap();
/// let masks = unique(&device, &keys, 3, 8).unwrap();
/// let masks = device.download_masks(&masks).unwrap();
/// assert!(masks[2]);
/// assert!(masks[0] ^ masks[1]);
/// ```
pub fn unique<D: Device>(
    device: &D,
    keys: &Blob,
    count: usize,
    dsize_key: usize,
) -> Result<Blob> {
    if dsize_key == 0 {
        return Err(Error::InvalidShape("key byte width must be positive"));
    }
    if keys.device() != device.id() {
        return Err(Error::DeviceMismatch {
            expected: device.id(),
            actual: keys.device(),
        });
    }
    if count == 0 {
        return device.allocate(0);
    }

    let mut map = Hashmap::with_buckets(count, count, dsize_key, size_of::<u32>(), device.clone())?;
    let indices: Vec<u32> = (0..count).map(|i| i as u32).collect();
    let values = device.upload(&indices)?;
    let mut masks = device.allocate(count)?;
    map.insert(keys, &values, None, Some(&mut masks), count)?;

    log::trace!("deduplicated {count} keys down to {}", map.len());
    Ok(masks)
}

/// Typed convenience over [`unique`] for host-resident key slices.
///
/// # Errors
///
/// Propagates the errors of [`unique`].
///
/// # Examples
///
/// ```
/// use bulkmap::{unique_slice, HostCpu};
///
/// let device = HostCpu::default();
/// let keys: Vec<[i64; 3]> = vec![[0, 0, 0], [0, 0, 0], [12, 0, 0]];
/// let keep = unique_slice(&device, &keys).unwrap();
/// assert!(keep[2]);
/// assert!(keep[0] ^ keep[1]);
/// ```
pub fn unique_slice<D: Device, T: bytemuck::Pod>(device: &D, keys: &[T]) -> Result<Vec<bool>> {
    let blob = device.upload(keys)?;
    let masks = unique(device, &blob, keys.len(), size_of::<T>())?;
    device.download_masks(&masks)
}
