//! Error types for the storage engine.

use std::io;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Needle header magic mismatch
    #[error("Invalid needle header magic")]
    NeedleHeaderMagic,

    /// Needle footer magic mismatch
    #[error("Invalid needle footer magic")]
    NeedleFooterMagic,

    /// Unknown needle flag byte
    #[error("Invalid needle flag: {0}")]
    NeedleFlag(u8),

    /// Needle data size out of range
    #[error("Invalid needle size: {0}")]
    NeedleSize(i32),

    /// Needle checksum mismatch
    #[error("Needle checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    NeedleChecksum { expected: u32, actual: u32 },

    /// Needle padding bytes are not zero
    #[error("Invalid needle padding")]
    NeedlePadding,

    /// Needle data larger than the configured ceiling
    #[error("Needle data too large: {0} bytes")]
    NeedleTooLarge(usize),

    /// Superblock header magic mismatch
    #[error("Invalid superblock magic")]
    SuperBlockMagic,

    /// Unsupported superblock version
    #[error("Unsupported superblock version: {0}")]
    SuperBlockVersion(u8),

    /// Superblock offset space exhausted
    #[error("Superblock has no space left")]
    SuperBlockNoSpace,

    /// Operation on a closed superblock
    #[error("Superblock is closed")]
    SuperBlockClosed,

    /// Repair buffer does not match the on-disk record size
    #[error("Repair size mismatch: expected {expected}, got {actual}")]
    RepairSize { expected: usize, actual: usize },

    /// Index record size out of range
    #[error("Invalid index record size: {0}")]
    IndexSize(i32),

    /// Operation on a closed index
    #[error("Index is closed")]
    IndexClosed,

    /// Index ring buffer is full
    #[error("Index ring buffer is full")]
    RingFull,

    /// No needle stored under the key
    #[error("Needle not found: key {0}")]
    NeedleNotExist(i64),

    /// Needle exists but is deleted
    #[error("Needle deleted: key {0}")]
    NeedleDeleted(i64),

    /// Stored key does not match the requested key
    #[error("Needle key mismatch: expected {expected}, got {actual}")]
    NeedleKey { expected: i64, actual: i64 },

    /// Stored cookie does not match the requested cookie
    #[error("Needle cookie mismatch: key {0}")]
    NeedleCookie(i64),

    /// Operation on a closed volume
    #[error("Volume is closed")]
    VolumeClosed,

    /// Compaction already running on the volume
    #[error("Volume compaction already in progress")]
    VolumeInCompact,

    /// No compaction running on the volume
    #[error("Volume is not in compaction")]
    VolumeNotInCompact,

    /// Delete queue is full
    #[error("Delete queue is full")]
    DelQueueFull,
}

impl StoreError {
    /// Whether the error indicates corrupt or unparsable record data, as
    /// opposed to an I/O failure. Recovery treats format errors as the end
    /// of valid data.
    pub(crate) fn is_format(&self) -> bool {
        matches!(
            self,
            Self::NeedleHeaderMagic
                | Self::NeedleFooterMagic
                | Self::NeedleFlag(_)
                | Self::NeedleSize(_)
                | Self::NeedleChecksum { .. }
                | Self::NeedlePadding
        )
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
