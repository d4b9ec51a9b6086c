//! Raw records exchanged between filesystem backends and the core
//!
//! These mirror what a filesystem parser knows about one object: its
//! metadata, the attributes (streams) attached to it, the names that point
//! at it, and the blocks that hold its content.

use serde::{Deserialize, Serialize};

/// NTFS `$DATA` attribute type
pub const ATTR_TYPE_DATA: u32 = 0x80;
/// NTFS `$INDEX_ROOT` attribute type (directory index)
pub const ATTR_TYPE_INDEX_ROOT: u32 = 0x90;

/// Name the parser gives the unnamed data stream
pub const DEFAULT_DATA_NAME: &str = "$Data";
/// Name of the directory filename index
pub const DEFAULT_INDEX_NAME: &str = "$I30";

// POSIX file type bits
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocState {
    Allocated,
    Unallocated,
}

impl AllocState {
    pub fn from_allocated(allocated: bool) -> Self {
        if allocated {
            AllocState::Allocated
        } else {
            AllocState::Unallocated
        }
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self, AllocState::Allocated)
    }
}

/// One attribute (stream) attached to an inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u32,
    pub id: u32,
    pub name: String,
    pub in_use: bool,
    pub resident: bool,
}

impl Attribute {
    pub fn is_data(&self) -> bool {
        self.attr_type == ATTR_TYPE_DATA
    }

    pub fn is_index_root(&self) -> bool {
        self.attr_type == ATTR_TYPE_INDEX_ROOT
    }

    /// True for the unnamed data stream and the default directory index
    pub fn has_default_name(&self) -> bool {
        (self.is_data() && self.name == DEFAULT_DATA_NAME)
            || (self.is_index_root() && self.name == DEFAULT_INDEX_NAME)
    }
}

/// Native metadata of one on-disk object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub addr: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
    pub allocated: bool,
    /// Streams, in on-disk attribute order; empty on single-stream filesystems
    pub attrs: Vec<Attribute>,
}

impl InodeRecord {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// In-use data streams, in attribute order
    pub fn data_streams(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter().filter(|a| a.in_use && a.is_data())
    }
}

/// One name found in a directory
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub name: String,
    pub inode: u64,
    pub entry_type: EntryType,
    pub alloc: AllocState,
    /// Metadata of the named object, when the parser could load it
    pub record: Option<InodeRecord>,
}

impl RawDirEntry {
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// One unit reported by a block walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockChunk {
    /// Stream content stored inline in the metadata
    Resident(Vec<u8>),
    /// `len` bytes starting at block `addr`
    Extent { addr: u64, len: u32 },
}

/// Flags steering a block walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockWalkFlags {
    /// Report addresses only, never fetch content
    pub addresses_only: bool,
    /// Tolerate allocation-table inconsistencies (deleted content)
    pub recover: bool,
    /// Do not report sparse runs
    pub no_sparse: bool,
    /// Ignore the stream id and take the first stream of the requested type
    pub no_id: bool,
}

impl BlockWalkFlags {
    /// Flags used to build a readable file: metadata-only, recovering, no sparse runs
    pub fn for_stream(stream_id: u32) -> Self {
        Self {
            addresses_only: true,
            recover: true,
            no_sparse: true,
            no_id: stream_id == 0,
        }
    }
}

/// Which inodes an inode scan reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaFilter {
    pub allocated: bool,
    pub unallocated: bool,
    /// Only objects that no surviving directory entry references
    pub unlinked_only: bool,
}

impl MetaFilter {
    pub const UNLINKED: MetaFilter = MetaFilter {
        allocated: true,
        unallocated: true,
        unlinked_only: true,
    };

    pub const ALL: MetaFilter = MetaFilter {
        allocated: true,
        unallocated: true,
        unlinked_only: false,
    };

    pub fn accepts_alloc(&self, allocated: bool) -> bool {
        if allocated {
            self.allocated
        } else {
            self.unallocated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(attr_type: u32, name: &str) -> Attribute {
        Attribute {
            attr_type,
            id: 1,
            name: name.to_string(),
            in_use: true,
            resident: false,
        }
    }

    #[test]
    fn test_default_names() {
        assert!(attr(ATTR_TYPE_DATA, "$Data").has_default_name());
        assert!(attr(ATTR_TYPE_INDEX_ROOT, "$I30").has_default_name());
        assert!(!attr(ATTR_TYPE_DATA, "alt").has_default_name());
        assert!(!attr(ATTR_TYPE_INDEX_ROOT, "$Data").has_default_name());
    }

    #[test]
    fn test_stream_flags_no_id() {
        assert!(BlockWalkFlags::for_stream(0).no_id);
        assert!(!BlockWalkFlags::for_stream(3).no_id);
        assert!(BlockWalkFlags::for_stream(3).recover);
    }
}
