//! On-disk B+tree indexes in the style of NTFS.
//!
//! An index maps unique keys to a file reference (directory indexes) or to
//! opaque data (view indexes). Its nodes are stored in three attributes of a
//! file record: the root in `$INDEX_ROOT`, further nodes in fixed size blocks
//! of `$INDEX_ALLOCATION`, and the usage of those blocks in `$BITMAP`. The
//! [`Volume`] provides the records, clusters and page cache an index runs on.
//!
//! ```
//! use ntfs_index::{Collation, Index, IndexConfig, IndexEntry, Volume, VolumeConfig};
//!
//! let mut vol = Volume::new(VolumeConfig::default()).unwrap();
//! let mft = vol.create_record().unwrap();
//! let mut index = Index::create(&mut vol, mft, IndexConfig::view("$O", Collation::NtofsUlong)).unwrap();
//! index.insert(IndexEntry::view(7u32.to_le_bytes().to_vec(), b"seven".to_vec())).unwrap();
//! assert!(index.lookup(&7u32.to_le_bytes()).unwrap().found);
//! ```

mod bitmap;
pub mod collation;
pub mod config;
pub mod entry;
pub mod error;
mod index;
pub mod layout;
pub mod volume;

pub use collation::{file_name_key, file_name_of, Collation};
pub use config::{IndexConfig, VolumeConfig};
pub use entry::{EntryValue, IndexEntry, IndexKind};
pub use error::{Error, Result};
pub use index::{Context, DeleteStatus, Index, IndexStats, Lookup};
pub use volume::mft::{AttrType, Attribute};
pub use volume::{AttrLoc, Volume};
