#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod device;
pub use device::{Blob, Device, DeviceId, DeviceKind, HostCpu};

mod error;
pub use error::{Error, Result};

pub mod hash_map;
pub use hash_map::{EntryRef, Hashmap};

pub mod unique;
pub use unique::{unique, unique_slice};
