//! Haystack-style storage engine for lots of small immutable objects.
//!
//! Objects ("needles") are packed back-to-back into large append-only
//! container files ("superblocks"), with an in-memory map from key to
//! file position so any object is one positioned read away. A flat index
//! log persists that map lazily; the superblock itself is the source of
//! truth on recovery. [`Volume`] ties one superblock, one index and the
//! cache together and adds background delete flushing and online
//! compaction.
//!
//! ```no_run
//! use haystore::{Needle, StoreConfig, Volume};
//!
//! # fn main() -> haystore::Result<()> {
//! let volume = Volume::open(1, "/data/1.block", "/data/1.idx", StoreConfig::default())?;
//! volume.write(&Needle::new(42, 0x1234, b"photo bytes".to_vec())?)?;
//! let needle = volume.read(42, 0x1234)?;
//! assert_eq!(needle.data, b"photo bytes");
//! volume.close()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod index;
pub mod needle;
pub mod superblock;
pub mod types;
pub mod volume;

pub use error::{Result, StoreError};
pub use index::{IndexEntry, Indexer};
pub use needle::{Flag, Needle};
pub use superblock::SuperBlock;
pub use types::{StoreConfig, VolumeStats};
pub use volume::Volume;
