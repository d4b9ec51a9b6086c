//! Filesystem backends, detection and the interface the core consumes
use anyhow::Result;

pub mod common;
pub mod exfat;
pub mod memory;

use crate::options::AllocFilter;
use crate::FileSystemType;
use common::{BlockChunk, BlockDevice, BlockWalkFlags, InodeRecord, MetaFilter, RawDirEntry};

/// A parsed filesystem inside an image
///
/// Every method is a synchronous pull: what a parser would report through
/// per-entry callbacks is returned as a collection instead. Implementations
/// keep no per-call state, but they are not required to be `Send`; one
/// handle belongs to one thread.
pub trait Filesystem {
    fn fs_type(&self) -> FileSystemType;

    /// Size in bytes of one addressable block
    fn block_size(&self) -> u32;

    fn root_inum(&self) -> u64;

    fn first_inum(&self) -> u64;

    fn last_inum(&self) -> u64;

    /// Whether objects can carry several independently addressable streams
    fn supports_multi_stream(&self) -> bool {
        false
    }

    /// Names found directly inside directory `dir`, dot entries included
    fn dir_entries(&self, dir: u64, filter: AllocFilter) -> Result<Vec<RawDirEntry>>;

    /// Metadata for one inode, `None` when the address holds no object
    fn inode_lookup(&self, inode: u64) -> Result<Option<InodeRecord>>;

    /// Every inode in `[first, last]` matching `filter`
    fn inode_scan(&self, first: u64, last: u64, filter: MetaFilter) -> Result<Vec<InodeRecord>>;

    /// Blocks (or resident bytes) of one stream, in logical order
    fn block_walk(
        &self,
        record: &InodeRecord,
        stream_type: u32,
        stream_id: u32,
        flags: BlockWalkFlags,
    ) -> Result<Vec<BlockChunk>>;

    /// Read block `addr` into `buf`, returning the number of bytes read
    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// Whether [`Filesystem::find_path`] is a real shortcut
    fn has_reverse_lookup(&self) -> bool {
        false
    }

    /// Direct inode-to-path lookup for filesystems that record parent links
    fn find_path(&self, _inode: u64) -> Result<Option<String>> {
        Ok(None)
    }

    /// Human-readable summary of the filesystem geometry
    fn describe(&self) -> String;
}

/// XFS superblock magic, "XFSB" at sector 0
const XFS_MAGIC: &[u8; 4] = b"XFSB";
/// Btrfs superblock magic at offset 0x40 of the superblock at 64KB
const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";

/// Detect the file system type from an image's superblocks
pub fn detect_filesystem(device: &BlockDevice) -> Option<FileSystemType> {
    // Check for exFAT (boot sector at sector 0)
    if let Ok(sector0) = device.read_sector(0) {
        if exfat::is_exfat_boot_sector(sector0) {
            return Some(FileSystemType::ExFat);
        }
        if sector0.starts_with(XFS_MAGIC) {
            return Some(FileSystemType::Xfs);
        }
    }

    // Check for Btrfs (superblock at 64KB)
    if let Ok(btrfs_sb) = device.read_bytes(65536, 0x48) {
        if &btrfs_sb[0x40..0x48] == BTRFS_MAGIC {
            return Some(FileSystemType::Btrfs);
        }
    }

    None
}

/// Open the filesystem of `device`, detecting its type unless one is forced
pub fn open_filesystem(
    device: BlockDevice,
    forced: Option<FileSystemType>,
) -> Result<Box<dyn Filesystem>> {
    let fs_type = match forced {
        Some(fs_type) => fs_type,
        None => match detect_filesystem(&device) {
            Some(fs_type) => fs_type,
            None => anyhow::bail!("Unknown or unsupported file system"),
        },
    };

    tracing::debug!("Opening {} as {}", device.path().display(), fs_type);

    match fs_type {
        FileSystemType::ExFat => Ok(Box::new(exfat::ExFatFilesystem::open(device)?)),
        FileSystemType::Xfs | FileSystemType::Btrfs | FileSystemType::Memory => {
            anyhow::bail!("no reader available for {} images", fs_type)
        }
    }
}
