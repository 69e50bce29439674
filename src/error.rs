use std::fmt;

use crate::device::DeviceId;

/// Per-call fatal errors raised by bulk hashmap operations.
///
/// Per-index conditions — a missing key, a key that is already present, an
/// exhausted slab — are never raised through this type; they are reported as
/// `false` bits in the output mask of the corresponding index.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An array is too small for the requested element count, or a configured
    /// byte width is zero.
    InvalidShape(&'static str),

    /// An input or output array resides on a different device than the
    /// hashmap.
    DeviceMismatch {
        /// The device the hashmap was constructed on.
        expected: DeviceId,
        /// The device the offending array resides on.
        actual: DeviceId,
    },

    /// Device memory allocation failed for the given number of bytes.
    Allocation(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidShape(what) => write!(f, "invalid shape: {what}"),
            Self::DeviceMismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected}, got {actual}")
            }
            Self::Allocation(len) => write!(f, "failed to allocate {len} bytes"),
        }
    }
}

impl std::error::Error for Error {}

/// Bulk operation result.
pub type Result<T> = std::result::Result<T, Error>;
