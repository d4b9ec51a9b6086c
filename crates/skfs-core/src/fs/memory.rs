//! In-memory filesystem
//!
//! Holds already-parsed records (directories, files, streams and blocks)
//! and serves them through the [`Filesystem`] interface. Useful for
//! embedders that obtain records from another parser, and for exercising the
//! core against exact layouts: NTFS-style multi-stream objects, resident
//! data, fragmented block runs, deleted and orphaned inodes, directory loops
//! and failing directories.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

use super::common::{
    Attribute, AllocState, BlockChunk, BlockWalkFlags, EntryType, InodeRecord, MetaFilter,
    RawDirEntry, ATTR_TYPE_DATA, ATTR_TYPE_INDEX_ROOT, DEFAULT_DATA_NAME, DEFAULT_INDEX_NAME,
    S_IFDIR, S_IFREG,
};
use super::Filesystem;
use crate::options::AllocFilter;
use crate::FileSystemType;

/// Inode address of the root directory
pub const ROOT_INUM: u64 = 2;

/// Filler written into blocks that belong to no file
const GAP_FILL: u8 = 0xEE;

/// How a stream's content is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Inline in the metadata record
    Resident,
    /// Consecutive blocks in order
    Contiguous,
    /// Non-adjacent blocks whose addresses run backwards
    Fragmented,
}

#[derive(Debug, Clone)]
enum Content {
    Resident(Vec<u8>),
    Extents(Vec<(u64, u32)>),
}

impl Content {
    fn len(&self) -> u64 {
        match self {
            Content::Resident(data) => data.len() as u64,
            Content::Extents(extents) => extents.iter().map(|&(_, len)| len as u64).sum(),
        }
    }
}

#[derive(Debug, Clone)]
struct Stream {
    attr: Attribute,
    content: Content,
}

#[derive(Debug, Clone)]
struct Link {
    name: String,
    inode: u64,
    allocated: bool,
}

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    allocated: bool,
    uid: u32,
    gid: u32,
    atime: i64,
    mtime: i64,
    ctime: i64,
    streams: Vec<Stream>,
    children: Vec<Link>,
    /// Directory and name this object was created under
    origin: Option<(u64, String)>,
    next_attr_id: u32,
}

impl Node {
    fn new(is_dir: bool) -> Self {
        Self {
            is_dir,
            allocated: true,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            streams: Vec::new(),
            children: Vec::new(),
            origin: None,
            next_attr_id: 1,
        }
    }

    fn push_stream(&mut self, attr_type: u32, name: &str, content: Content) -> u32 {
        let id = self.next_attr_id;
        self.next_attr_id += 1;
        self.streams.push(Stream {
            attr: Attribute {
                attr_type,
                id,
                name: name.to_string(),
                in_use: true,
                resident: matches!(content, Content::Resident(_)),
            },
            content,
        });
        id
    }

    fn default_data(&self) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|s| s.attr.is_data() && s.attr.name == DEFAULT_DATA_NAME)
    }
}

/// A filesystem assembled in memory
///
/// The builder methods take inode numbers returned by earlier calls and
/// panic when handed one that was never created.
#[derive(Debug, Clone)]
pub struct MemoryFilesystem {
    block_size: u32,
    blocks: Vec<Vec<u8>>,
    nodes: BTreeMap<u64, Node>,
    next_inum: u64,
    multi_stream: bool,
    reverse_lookup: bool,
    failing_dirs: HashSet<u64>,
}

impl MemoryFilesystem {
    /// An empty filesystem holding only the root directory
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    pub fn new(block_size: u32) -> Self {
        assert!(block_size > 0, "block size must be non-zero");

        let mut root = Node::new(true);
        root.push_stream(ATTR_TYPE_INDEX_ROOT, DEFAULT_INDEX_NAME, Content::Resident(Vec::new()));

        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_INUM, root);

        Self {
            block_size,
            blocks: Vec::new(),
            nodes,
            next_inum: ROOT_INUM + 1,
            multi_stream: false,
            reverse_lookup: false,
            failing_dirs: HashSet::new(),
        }
    }

    /// Report objects' streams individually, the way NTFS does
    pub fn with_multi_stream(mut self, enabled: bool) -> Self {
        self.multi_stream = enabled;
        self
    }

    /// Offer the direct inode-to-path shortcut
    pub fn with_reverse_lookup(mut self, enabled: bool) -> Self {
        self.reverse_lookup = enabled;
        self
    }

    pub fn root(&self) -> u64 {
        ROOT_INUM
    }

    pub fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        let mut node = Node::new(true);
        node.push_stream(ATTR_TYPE_INDEX_ROOT, DEFAULT_INDEX_NAME, Content::Resident(Vec::new()));
        self.insert_linked(parent, name, node)
    }

    pub fn add_file(&mut self, parent: u64, name: &str, data: &[u8], storage: Storage) -> u64 {
        let node = self.file_node(data, storage);
        self.insert_linked(parent, name, node)
    }

    /// A file whose block runs are given verbatim, whether or not they exist
    pub fn add_raw_file(&mut self, parent: u64, name: &str, extents: Vec<(u64, u32)>) -> u64 {
        let mut node = Node::new(false);
        node.push_stream(ATTR_TYPE_DATA, DEFAULT_DATA_NAME, Content::Extents(extents));
        self.insert_linked(parent, name, node)
    }

    /// Attach a named data stream, returning its attribute id
    ///
    /// # Panics
    ///
    /// Panics if `inode` was never created.
    pub fn add_stream(&mut self, inode: u64, name: &str, data: &[u8], storage: Storage) -> u32 {
        let content = self.store(data, storage);
        let node = self.node_mut(inode);
        node.push_stream(ATTR_TYPE_DATA, name, content)
    }

    /// An unallocated inode that no directory names
    pub fn add_orphan(&mut self, data: &[u8], storage: Storage) -> u64 {
        let mut node = self.file_node(data, storage);
        node.allocated = false;
        let inum = self.next_inum;
        self.next_inum += 1;
        self.nodes.insert(inum, node);
        inum
    }

    /// Add another name for an existing object
    ///
    /// # Panics
    ///
    /// Panics if `parent` was never created.
    pub fn link(&mut self, parent: u64, name: &str, inode: u64) {
        self.node_mut(parent).children.push(Link {
            name: name.to_string(),
            inode,
            allocated: true,
        });
    }

    /// Delete a name and its object, leaving both behind as unallocated
    pub fn delete(&mut self, parent: u64, name: &str) {
        let mut target = None;
        for link in &mut self.node_mut(parent).children {
            if link.name == name {
                link.allocated = false;
                target = Some(link.inode);
            }
        }
        if let Some(inode) = target {
            self.node_mut(inode).allocated = false;
        }
    }

    /// Remove a name entirely; the object stays allocated but unreachable
    pub fn unlink(&mut self, parent: u64, name: &str) {
        self.node_mut(parent).children.retain(|link| link.name != name);
    }

    /// Make every listing of `dir` fail
    pub fn fail_directory(&mut self, dir: u64) {
        self.failing_dirs.insert(dir);
    }

    pub fn set_owner(&mut self, inode: u64, uid: u32, gid: u32) {
        let node = self.node_mut(inode);
        node.uid = uid;
        node.gid = gid;
    }

    pub fn set_times(&mut self, inode: u64, atime: i64, mtime: i64, ctime: i64) {
        let node = self.node_mut(inode);
        node.atime = atime;
        node.mtime = mtime;
        node.ctime = ctime;
    }

    fn node_mut(&mut self, inode: u64) -> &mut Node {
        match self.nodes.get_mut(&inode) {
            Some(node) => node,
            None => panic!("inode {} was never created", inode),
        }
    }

    fn file_node(&mut self, data: &[u8], storage: Storage) -> Node {
        let content = self.store(data, storage);
        let mut node = Node::new(false);
        node.push_stream(ATTR_TYPE_DATA, DEFAULT_DATA_NAME, content);
        node
    }

    fn insert_linked(&mut self, parent: u64, name: &str, mut node: Node) -> u64 {
        let inum = self.next_inum;
        self.next_inum += 1;
        node.origin = Some((parent, name.to_string()));
        self.nodes.insert(inum, node);
        self.link(parent, name, inum);
        inum
    }

    fn store(&mut self, data: &[u8], storage: Storage) -> Content {
        let bs = self.block_size as usize;
        match storage {
            Storage::Resident => Content::Resident(data.to_vec()),
            Storage::Contiguous => {
                let extents = data
                    .chunks(bs)
                    .map(|chunk| (self.alloc_block(chunk), chunk.len() as u32))
                    .collect();
                Content::Extents(extents)
            }
            Storage::Fragmented => {
                let chunks: Vec<&[u8]> = data.chunks(bs).collect();
                let base = self.blocks.len() as u64;
                let count = chunks.len() as u64;

                // chunk i lands at base + 2 * (count - 1 - i), gaps in between
                for _ in 0..count * 2 {
                    self.blocks.push(vec![GAP_FILL; bs]);
                }
                let extents = chunks
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        let addr = base + 2 * (count - 1 - i as u64);
                        self.blocks[addr as usize][..chunk.len()].copy_from_slice(chunk);
                        (addr, chunk.len() as u32)
                    })
                    .collect();
                Content::Extents(extents)
            }
        }
    }

    fn alloc_block(&mut self, chunk: &[u8]) -> u64 {
        let mut block = vec![0u8; self.block_size as usize];
        block[..chunk.len()].copy_from_slice(chunk);
        self.blocks.push(block);
        (self.blocks.len() - 1) as u64
    }

    /// Inodes referenced by at least one allocated name
    fn linked_inodes(&self) -> HashSet<u64> {
        let mut linked: HashSet<u64> = self
            .nodes
            .values()
            .flat_map(|node| node.children.iter())
            .filter(|link| link.allocated)
            .map(|link| link.inode)
            .collect();
        linked.insert(ROOT_INUM);
        linked
    }

    fn record(&self, inum: u64, node: &Node) -> InodeRecord {
        let nlink = self
            .nodes
            .values()
            .flat_map(|n| n.children.iter())
            .filter(|link| link.allocated && link.inode == inum)
            .count() as u32;

        let (mode, size) = if node.is_dir {
            (S_IFDIR | 0o755, 0)
        } else {
            let size = node.default_data().map(|s| s.content.len()).unwrap_or(0);
            (S_IFREG | 0o644, size)
        };

        InodeRecord {
            addr: inum,
            mode,
            nlink: nlink.max(u32::from(inum == ROOT_INUM)),
            uid: node.uid,
            gid: node.gid,
            size,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
            crtime: node.ctime,
            allocated: node.allocated,
            attrs: node.streams.iter().map(|s| s.attr.clone()).collect(),
        }
    }

    fn dot_entry(&self, name: &str, inum: u64) -> Option<RawDirEntry> {
        let node = self.nodes.get(&inum)?;
        Some(RawDirEntry {
            name: name.to_string(),
            inode: inum,
            entry_type: EntryType::Directory,
            alloc: AllocState::Allocated,
            record: Some(self.record(inum, node)),
        })
    }
}

impl Filesystem for MemoryFilesystem {
    fn fs_type(&self) -> FileSystemType {
        FileSystemType::Memory
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn root_inum(&self) -> u64 {
        ROOT_INUM
    }

    fn first_inum(&self) -> u64 {
        ROOT_INUM
    }

    fn last_inum(&self) -> u64 {
        self.next_inum - 1
    }

    fn supports_multi_stream(&self) -> bool {
        self.multi_stream
    }

    fn dir_entries(&self, dir: u64, filter: AllocFilter) -> Result<Vec<RawDirEntry>> {
        if self.failing_dirs.contains(&dir) {
            anyhow::bail!("corrupt index in directory inode {}", dir);
        }
        let node = match self.nodes.get(&dir) {
            Some(node) => node,
            None => anyhow::bail!("inode {} does not exist", dir),
        };
        if !node.is_dir {
            anyhow::bail!("inode {} is not a directory", dir);
        }

        let mut entries = Vec::with_capacity(node.children.len() + 2);
        if filter.allocated {
            let parent = match &node.origin {
                Some((parent, _)) => *parent,
                None => dir,
            };
            entries.extend(self.dot_entry(".", dir));
            entries.extend(self.dot_entry("..", parent));
        }

        for link in &node.children {
            if !filter.accepts(link.allocated) {
                continue;
            }
            let record = self.nodes.get(&link.inode).map(|n| self.record(link.inode, n));
            let entry_type = match &record {
                Some(r) if r.is_dir() => EntryType::Directory,
                _ => EntryType::File,
            };
            entries.push(RawDirEntry {
                name: link.name.clone(),
                inode: link.inode,
                entry_type,
                alloc: AllocState::from_allocated(link.allocated),
                record,
            });
        }

        Ok(entries)
    }

    fn inode_lookup(&self, inode: u64) -> Result<Option<InodeRecord>> {
        Ok(self.nodes.get(&inode).map(|node| self.record(inode, node)))
    }

    fn inode_scan(&self, first: u64, last: u64, filter: MetaFilter) -> Result<Vec<InodeRecord>> {
        if first > last {
            return Ok(Vec::new());
        }
        let linked = if filter.unlinked_only {
            Some(self.linked_inodes())
        } else {
            None
        };

        Ok(self
            .nodes
            .range(first..=last)
            .filter(|(_, node)| filter.accepts_alloc(node.allocated))
            .filter(|(inum, _)| linked.as_ref().map_or(true, |l| !l.contains(*inum)))
            .map(|(&inum, node)| self.record(inum, node))
            .collect())
    }

    fn block_walk(
        &self,
        record: &InodeRecord,
        stream_type: u32,
        stream_id: u32,
        flags: BlockWalkFlags,
    ) -> Result<Vec<BlockChunk>> {
        let node = match self.nodes.get(&record.addr) {
            Some(node) => node,
            None => anyhow::bail!("inode {} does not exist", record.addr),
        };

        let defaulted = stream_type == 0;
        let wanted_type = if defaulted { ATTR_TYPE_DATA } else { stream_type };

        let stream = node.streams.iter().find(|s| {
            s.attr.in_use
                && s.attr.attr_type == wanted_type
                && (flags.no_id || s.attr.id == stream_id)
        });

        let stream = match stream {
            Some(stream) => stream,
            None if defaulted && stream_id == 0 => return Ok(Vec::new()),
            None => anyhow::bail!(
                "inode {} has no stream of type {} with id {}",
                record.addr,
                stream_type,
                stream_id
            ),
        };

        Ok(match &stream.content {
            Content::Resident(data) => vec![BlockChunk::Resident(data.clone())],
            Content::Extents(extents) => extents
                .iter()
                .map(|&(addr, len)| BlockChunk::Extent { addr, len })
                .collect(),
        })
    }

    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let block = match usize::try_from(addr).ok().and_then(|a| self.blocks.get(a)) {
            Some(block) => block,
            None => anyhow::bail!(
                "block {} beyond end of image ({} blocks)",
                addr,
                self.blocks.len()
            ),
        };
        let n = buf.len().min(block.len());
        buf[..n].copy_from_slice(&block[..n]);
        Ok(n)
    }

    fn has_reverse_lookup(&self) -> bool {
        self.reverse_lookup
    }

    fn find_path(&self, inode: u64) -> Result<Option<String>> {
        if !self.reverse_lookup {
            return Ok(None);
        }

        let mut names = Vec::new();
        let mut current = inode;
        // a parent chain longer than the inode count is a loop
        for _ in 0..=self.nodes.len() {
            if current == ROOT_INUM {
                names.reverse();
                return Ok(Some(format!("/{}", names.join("/"))));
            }
            let node = match self.nodes.get(&current) {
                Some(node) => node,
                None => return Ok(None),
            };
            let (parent, name) = match &node.origin {
                Some(origin) => origin,
                None => return Ok(None),
            };
            let still_named = self
                .nodes
                .get(parent)
                .map_or(false, |p| {
                    p.children
                        .iter()
                        .any(|l| l.allocated && l.inode == current && &l.name == name)
                });
            if !still_named {
                return Ok(None);
            }
            names.push(name.clone());
            current = *parent;
        }

        anyhow::bail!("parent chain of inode {} loops", inode)
    }

    fn describe(&self) -> String {
        format!(
            "In-memory File System\n\
             - Block Size: {}\n\
             - Blocks: {}\n\
             - Inodes: {}\n\
             - Multi-stream: {}",
            self.block_size,
            self.blocks.len(),
            self.nodes.len(),
            self.multi_stream
        )
    }
}
