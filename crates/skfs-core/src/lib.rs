//! Read-only navigation of the filesystems inside forensic disk images
//!
//! An [`ImageHandle`] owns one image and the filesystem found in it. Paths
//! resolve to [`StreamIdentifier`]s and back, a [`DirectoryWalker`] produces
//! a lazy recursive listing, and a [`FileHandle`] reads one data stream
//! through its block extents or resident bytes. Nothing is ever written to
//! the image.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod digest;
pub mod error;
pub mod file;
pub mod fs;
mod handle;
pub mod ident;
pub mod options;
mod resolve;
mod scan;
pub mod stat;
pub mod walk;

pub use digest::{calculate_hash, hash_stream, HashAlgorithm, StreamHash};
pub use error::{Result, SkError};
pub use file::{Extent, FileHandle, Whence};
pub use fs::common::{AllocState, EntryType};
pub use fs::Filesystem;
pub use handle::ImageHandle;
pub use ident::StreamIdentifier;
pub use options::{AllocFilter, ImageFormat, OpenOptions, Projection, Target, WalkOptions};
pub use scan::UnlinkedInode;
pub use stat::{FileType, NormalizedStat};
pub use walk::{DirEntry, DirectoryWalker, WalkItem, WalkStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystemType {
    Xfs,
    Btrfs,
    ExFat,
    /// Records held in memory rather than parsed from an image
    Memory,
}

impl std::fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSystemType::Xfs => write!(f, "XFS"),
            FileSystemType::Btrfs => write!(f, "Btrfs"),
            FileSystemType::ExFat => write!(f, "exFAT"),
            FileSystemType::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for FileSystemType {
    type Err = SkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xfs" => Ok(FileSystemType::Xfs),
            "btrfs" => Ok(FileSystemType::Btrfs),
            "exfat" => Ok(FileSystemType::ExFat),
            other => Err(SkError::Parse(format!(
                "unsupported filesystem type {:?}",
                other
            ))),
        }
    }
}
