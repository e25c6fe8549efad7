// Standard errors

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// A block read or write did not complete.
    #[error("block i/o failed")]
    Io,
    /// The named partition does not exist on the device.
    #[error("partition not found")]
    NotFound,
    /// The block device itself is inaccessible.
    #[error("no block device")]
    NoDevice,
    /// A header, magic number or bounds check failed.
    #[error("invalid data")]
    Invalid,
    /// A transient allocation failed or a buffer limit was exceeded.
    #[error("out of memory")]
    OutOfMemory,
    /// The caller supplied an unknown slot index or suffix.
    #[error("invalid argument")]
    InvalidArgument,
}
