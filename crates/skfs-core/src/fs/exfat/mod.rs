//! exFAT file system support
//!
//! Addresses follow the usual forensic convention for FAT-family volumes:
//! an object's inode is the byte offset of its primary directory entry
//! divided by 32, the root directory is inode 1, and block addresses are
//! cluster numbers.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;

use super::common::{
    AllocState, BlockChunk, BlockDevice, BlockWalkFlags, EntryType, InodeRecord, MetaFilter,
    RawDirEntry, S_IFDIR, S_IFREG,
};
use super::Filesystem;
use crate::options::AllocFilter;
use crate::FileSystemType;

pub mod directory;
pub mod fat;

use directory::{FileEntrySet, ENTRY_SIZE, ENTRY_TYPE_END, MAX_DIRECTORY_BYTES, MAX_SET_BYTES};
use fat::{FatTable, FIRST_DATA_CLUSTER};

/// exFAT file system signature
const EXFAT_SIGNATURE: &[u8; 8] = b"EXFAT   ";

/// Inode number reported for the root directory
pub const EXFAT_ROOT_INUM: u64 = 1;

/// exFAT boot sector structure (simplified)
#[derive(Debug, Clone)]
pub struct ExFatBootSector {
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub first_cluster_of_root_directory: u32,
    pub volume_serial_number: u32,
    pub file_system_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub percent_in_use: u8,
}

impl ExFatBootSector {
    /// Parse exFAT boot sector from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 512 {
            anyhow::bail!("Insufficient data for exFAT boot sector");
        }
        if !is_exfat_boot_sector(data) {
            anyhow::bail!("Invalid exFAT signature");
        }

        // Skip jump code, name and the zeroed legacy BPB
        let mut cursor = Cursor::new(data);
        cursor.set_position(64);

        let partition_offset = cursor.read_u64::<LittleEndian>()?;
        let volume_length = cursor.read_u64::<LittleEndian>()?;
        let fat_offset = cursor.read_u32::<LittleEndian>()?;
        let fat_length = cursor.read_u32::<LittleEndian>()?;
        let cluster_heap_offset = cursor.read_u32::<LittleEndian>()?;
        let cluster_count = cursor.read_u32::<LittleEndian>()?;
        let first_cluster_of_root_directory = cursor.read_u32::<LittleEndian>()?;
        let volume_serial_number = cursor.read_u32::<LittleEndian>()?;
        let file_system_revision = cursor.read_u16::<LittleEndian>()?;
        let volume_flags = cursor.read_u16::<LittleEndian>()?;
        let bytes_per_sector_shift = cursor.read_u8()?;
        let sectors_per_cluster_shift = cursor.read_u8()?;
        let number_of_fats = cursor.read_u8()?;
        let _drive_select = cursor.read_u8()?;
        let percent_in_use = cursor.read_u8()?;

        let boot = ExFatBootSector {
            partition_offset,
            volume_length,
            fat_offset,
            fat_length,
            cluster_heap_offset,
            cluster_count,
            first_cluster_of_root_directory,
            volume_serial_number,
            file_system_revision,
            volume_flags,
            bytes_per_sector_shift,
            sectors_per_cluster_shift,
            number_of_fats,
            percent_in_use,
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<()> {
        if !(9..=12).contains(&self.bytes_per_sector_shift) {
            anyhow::bail!(
                "Invalid bytes-per-sector shift {}",
                self.bytes_per_sector_shift
            );
        }
        // clusters are at most 32 MB
        if self.bytes_per_sector_shift as u32 + self.sectors_per_cluster_shift as u32 > 25 {
            anyhow::bail!(
                "Invalid sectors-per-cluster shift {}",
                self.sectors_per_cluster_shift
            );
        }
        if self.cluster_count == 0 {
            anyhow::bail!("Boot sector reports an empty cluster heap");
        }
        if self.fat_offset == 0 || self.fat_length == 0 {
            anyhow::bail!("Boot sector reports no allocation table");
        }
        let root = self.first_cluster_of_root_directory;
        if root < fat::FIRST_DATA_CLUSTER || root - fat::FIRST_DATA_CLUSTER >= self.cluster_count {
            anyhow::bail!("Root directory cluster {} is outside the heap", root);
        }
        Ok(())
    }

    /// Get bytes per sector
    pub fn bytes_per_sector(&self) -> u32 {
        1 << self.bytes_per_sector_shift
    }

    /// Get sectors per cluster
    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.sectors_per_cluster_shift
    }

    /// Get bytes per cluster
    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector() * self.sectors_per_cluster()
    }
}

/// Check if data contains exFAT boot sector signature
pub fn is_exfat_boot_sector(data: &[u8]) -> bool {
    if data.len() < 11 {
        return false;
    }

    // exFAT signature is at offset 3
    &data[3..11] == EXFAT_SIGNATURE
}

/// Where an object's content lives
#[derive(Debug, Clone, Copy)]
struct StreamLayout {
    first_cluster: u32,
    length: u64,
    contiguous: bool,
    deleted: bool,
    is_dir: bool,
}

/// An exFAT volume read straight from the image
pub struct ExFatFilesystem {
    device: BlockDevice,
    boot: ExFatBootSector,
    fat: FatTable,
    /// Size of the root directory, which has no entry of its own
    root_length: u64,
    /// Directory inode -> parent directory inode, learned while listing
    parents: RefCell<HashMap<u64, u64>>,
}

impl ExFatFilesystem {
    pub fn open(device: BlockDevice) -> Result<Self> {
        let sector0 = device.read_sector(0).context("reading the boot sector")?;
        let boot = ExFatBootSector::parse(sector0)?;
        let fat = FatTable::from_device(&device, &boot)?;

        let root_clusters = fat
            .get_chain(boot.first_cluster_of_root_directory, fat.cluster_count() as usize)
            .len() as u64;
        let root_length = root_clusters * fat.cluster_size() as u64;

        tracing::info!(
            "exFAT volume: {} clusters of {} bytes, root at cluster {}",
            boot.cluster_count,
            boot.bytes_per_cluster(),
            boot.first_cluster_of_root_directory
        );

        Ok(Self {
            device,
            boot,
            fat,
            root_length,
            parents: RefCell::new(HashMap::new()),
        })
    }

    /// Inode range covered by the cluster heap
    fn heap_inodes(&self) -> (u64, u64) {
        let start = self.fat.heap_offset() / ENTRY_SIZE as u64;
        let end = (self.fat.heap_offset() + self.fat.heap_length()) / ENTRY_SIZE as u64;
        (start, end.saturating_sub(1))
    }

    /// The entry set whose primary entry is inode `inum`
    fn entry_set(&self, inum: u64) -> Option<FileEntrySet> {
        let (first, last) = self.heap_inodes();
        if inum < first || inum > last {
            return None;
        }
        let offset = inum.checked_mul(ENTRY_SIZE as u64)?;
        FileEntrySet::parse(self.device.read_available(offset, MAX_SET_BYTES))
    }

    fn root_record(&self) -> InodeRecord {
        InodeRecord {
            addr: EXFAT_ROOT_INUM,
            mode: S_IFDIR | 0o755,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: self.root_length,
            atime: 0,
            mtime: 0,
            ctime: 0,
            crtime: 0,
            allocated: true,
            attrs: Vec::new(),
        }
    }

    fn record(&self, inum: u64, set: &FileEntrySet) -> InodeRecord {
        let entry = &set.file_entry;
        let mut mode = if entry.is_directory() {
            S_IFDIR | 0o755
        } else {
            S_IFREG | 0o644
        };
        if entry.is_read_only() {
            mode &= !0o222;
        }

        InodeRecord {
            addr: inum,
            mode,
            nlink: u32::from(!set.is_deleted),
            uid: 0,
            gid: 0,
            size: set.stream_extension.data_length,
            atime: entry.accessed,
            mtime: entry.modified,
            // no change time on exFAT
            ctime: 0,
            crtime: entry.created,
            allocated: !set.is_deleted,
            attrs: Vec::new(),
        }
    }

    fn layout(&self, inum: u64) -> Option<StreamLayout> {
        if inum == EXFAT_ROOT_INUM {
            return Some(StreamLayout {
                first_cluster: self.boot.first_cluster_of_root_directory,
                length: self.root_length,
                contiguous: false,
                deleted: false,
                is_dir: true,
            });
        }
        let set = self.entry_set(inum)?;
        Some(StreamLayout {
            first_cluster: set.stream_extension.first_cluster,
            length: set.stream_extension.data_length,
            contiguous: set.stream_extension.is_contiguous(),
            deleted: set.is_deleted,
            is_dir: set.file_entry.is_directory(),
        })
    }

    /// Heap clusters that start inside the image file
    fn backed_clusters(&self) -> u64 {
        let heap_bytes = self.device.size().saturating_sub(self.fat.heap_offset());
        heap_bytes
            .div_ceil(self.fat.cluster_size() as u64)
            .min(self.fat.cluster_count() as u64)
    }

    /// Clusters holding `layout`'s content, in logical order
    ///
    /// Clusters past the end of the image file are never listed, whatever
    /// length the entry claims.
    fn clusters(&self, layout: &StreamLayout, recover: bool) -> Result<Vec<u32>> {
        let cluster_size = self.fat.cluster_size() as u64;
        let backed = self.backed_clusters();
        let claimed = layout.length.div_ceil(cluster_size);
        let needed = claimed.min(backed);
        if needed < claimed {
            tracing::warn!(
                "Entry at cluster {} claims {} clusters, the image holds {}",
                layout.first_cluster,
                claimed,
                backed
            );
        }
        if needed == 0 {
            return Ok(Vec::new());
        }

        if layout.deleted && !recover {
            anyhow::bail!("content of a deleted entry is only available in recovery mode");
        }

        // a deleted entry's chain is gone; assume the clusters were consecutive
        if layout.deleted || layout.contiguous {
            let backed_end = FIRST_DATA_CLUSTER as u64 + backed;
            let run = needed.min(backed_end.saturating_sub(layout.first_cluster as u64));
            Ok(self.fat.contiguous_run(layout.first_cluster, run))
        } else {
            let chain = self.fat.get_chain(layout.first_cluster, needed as usize);
            if (chain.len() as u64) < needed {
                tracing::warn!(
                    "FAT chain from cluster {} ends after {} of {} clusters",
                    layout.first_cluster,
                    chain.len(),
                    needed
                );
            }
            Ok(chain)
        }
    }

    fn dot_entry(&self, name: &str, inum: u64) -> Option<RawDirEntry> {
        let record = self.inode_lookup(inum).ok().flatten()?;
        Some(RawDirEntry {
            name: name.to_string(),
            inode: inum,
            entry_type: EntryType::Directory,
            alloc: AllocState::Allocated,
            record: Some(record),
        })
    }
}

impl Filesystem for ExFatFilesystem {
    fn fs_type(&self) -> FileSystemType {
        FileSystemType::ExFat
    }

    fn block_size(&self) -> u32 {
        self.fat.cluster_size()
    }

    fn root_inum(&self) -> u64 {
        EXFAT_ROOT_INUM
    }

    fn first_inum(&self) -> u64 {
        EXFAT_ROOT_INUM
    }

    fn last_inum(&self) -> u64 {
        self.heap_inodes().1
    }

    fn dir_entries(&self, dir: u64, filter: AllocFilter) -> Result<Vec<RawDirEntry>> {
        let layout = match self.layout(dir) {
            Some(layout) => layout,
            None => anyhow::bail!("inode {} holds no directory entry", dir),
        };
        if !layout.is_dir {
            anyhow::bail!("inode {} is not a directory", dir);
        }

        let cluster_size = self.fat.cluster_size() as usize;
        let mut clusters = self.clusters(&layout, true)?;
        let max_clusters = (MAX_DIRECTORY_BYTES / cluster_size as u64).max(1) as usize;
        if clusters.len() > max_clusters {
            tracing::warn!(
                "Directory inode {} spans {} clusters, reading the first {}",
                dir,
                clusters.len(),
                max_clusters
            );
            clusters.truncate(max_clusters);
        }

        // Directory bytes, one full cluster per chain link
        let total = clusters.len() * cluster_size;
        let mut data = Vec::new();
        data.try_reserve_exact(total).map_err(|_| {
            anyhow::anyhow!("cannot allocate {} bytes for directory inode {}", total, dir)
        })?;
        let mut offsets = Vec::with_capacity(clusters.len());
        for &cluster in &clusters {
            let offset = match self.fat.cluster_offset(cluster) {
                Some(offset) => offset,
                None => break,
            };
            let start = data.len();
            data.extend_from_slice(self.device.read_available(offset, cluster_size));
            data.resize(start + cluster_size, 0);
            offsets.push(offset);
        }

        let mut entries = Vec::new();
        if filter.allocated {
            let parent = if dir == EXFAT_ROOT_INUM {
                EXFAT_ROOT_INUM
            } else {
                self.parents
                    .borrow()
                    .get(&dir)
                    .copied()
                    .unwrap_or(EXFAT_ROOT_INUM)
            };
            entries.extend(self.dot_entry(".", dir));
            entries.extend(self.dot_entry("..", parent));
        }

        let mut pos = 0;
        while pos + ENTRY_SIZE <= data.len() {
            let entry_type = data[pos];
            if entry_type == ENTRY_TYPE_END {
                break;
            }

            let set = if directory::is_primary_file_entry(entry_type) {
                FileEntrySet::parse(&data[pos..])
            } else {
                None
            };
            let set = match set {
                Some(set) => set,
                None => {
                    pos += ENTRY_SIZE;
                    continue;
                }
            };

            let inum = (offsets[pos / cluster_size] + (pos % cluster_size) as u64)
                / ENTRY_SIZE as u64;
            let allocated = !set.is_deleted;
            let is_dir = set.file_entry.is_directory();

            if is_dir {
                self.parents.borrow_mut().insert(inum, dir);
            }
            if filter.accepts(allocated) {
                entries.push(RawDirEntry {
                    name: set.filename.clone(),
                    inode: inum,
                    entry_type: if is_dir {
                        EntryType::Directory
                    } else {
                        EntryType::File
                    },
                    alloc: AllocState::from_allocated(allocated),
                    record: Some(self.record(inum, &set)),
                });
            }

            // a deleted set's slots may since have been reused
            pos += if allocated { set.byte_len() } else { ENTRY_SIZE };
        }

        Ok(entries)
    }

    fn inode_lookup(&self, inode: u64) -> Result<Option<InodeRecord>> {
        if inode == EXFAT_ROOT_INUM {
            return Ok(Some(self.root_record()));
        }
        Ok(self.entry_set(inode).map(|set| self.record(inode, &set)))
    }

    fn inode_scan(&self, first: u64, last: u64, filter: MetaFilter) -> Result<Vec<InodeRecord>> {
        let mut records = Vec::new();
        if first > last {
            return Ok(records);
        }

        if (first..=last).contains(&EXFAT_ROOT_INUM)
            && filter.allocated
            && !filter.unlinked_only
        {
            records.push(self.root_record());
        }

        let (heap_first, heap_last) = self.heap_inodes();
        let start = first.max(heap_first);
        let end = last.min(heap_last);
        if start > end {
            return Ok(records);
        }

        let heap = self
            .device
            .read_available(self.fat.heap_offset(), self.fat.heap_length() as usize);
        tracing::debug!("Scanning directory entries {}..={}", start, end);

        for inum in start..=end {
            let pos = ((inum - heap_first) as usize) * ENTRY_SIZE;
            if pos + ENTRY_SIZE * 2 > heap.len() {
                break;
            }
            if !directory::is_primary_file_entry(heap[pos])
                || !directory::is_stream_entry(heap[pos + ENTRY_SIZE])
            {
                continue;
            }
            let set = match FileEntrySet::parse(&heap[pos..]) {
                Some(set) => set,
                None => continue,
            };

            let allocated = !set.is_deleted;
            // deleted entries are the only ones no directory names
            if filter.unlinked_only && allocated {
                continue;
            }
            if filter.accepts_alloc(allocated) {
                records.push(self.record(inum, &set));
            }
        }

        Ok(records)
    }

    fn block_walk(
        &self,
        record: &InodeRecord,
        stream_type: u32,
        stream_id: u32,
        flags: BlockWalkFlags,
    ) -> Result<Vec<BlockChunk>> {
        if stream_type != 0 || stream_id != 0 {
            anyhow::bail!(
                "exFAT objects have a single stream, not {}-{}",
                stream_type,
                stream_id
            );
        }
        let layout = match self.layout(record.addr) {
            Some(layout) => layout,
            None => anyhow::bail!("inode {} holds no directory entry", record.addr),
        };

        let cluster_size = self.fat.cluster_size() as u64;
        let mut remaining = layout.length;
        let mut chunks = Vec::new();
        for cluster in self.clusters(&layout, flags.recover)? {
            if remaining == 0 {
                break;
            }
            let len = remaining.min(cluster_size);
            chunks.push(BlockChunk::Extent {
                addr: cluster as u64,
                len: len as u32,
            });
            remaining -= len;
        }

        Ok(chunks)
    }

    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = u32::try_from(addr)
            .ok()
            .and_then(|cluster| self.fat.cluster_offset(cluster));
        let offset = match offset {
            Some(offset) => offset,
            None => anyhow::bail!("cluster {} is outside the cluster heap", addr),
        };

        let want = buf.len().min(self.fat.cluster_size() as usize);
        let bytes = self.device.read_available(offset, want);
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn describe(&self) -> String {
        let boot = &self.boot;
        let bytes_per_sector = boot.bytes_per_sector();
        let bytes_per_cluster = boot.bytes_per_cluster();
        let volume_size_mb = (boot.volume_length * bytes_per_sector as u64) / (1024 * 1024);

        format!(
            "exFAT File System\n\
             - Bytes per Sector: {}\n\
             - Sectors per Cluster: {}\n\
             - Bytes per Cluster: {}\n\
             - Volume Size: {} MB\n\
             - Cluster Count: {}\n\
             - Free Clusters: {}\n\
             - FAT Offset: {} sectors\n\
             - FAT Length: {} sectors\n\
             - Root Directory Cluster: {}\n\
             - Volume Serial: 0x{:08X}\n\
             - File System Revision: {}.{}\n\
             - Inode Range: {}-{}",
            bytes_per_sector,
            boot.sectors_per_cluster(),
            bytes_per_cluster,
            volume_size_mb,
            boot.cluster_count,
            self.fat.free_cluster_count(),
            boot.fat_offset,
            boot.fat_length,
            boot.first_cluster_of_root_directory,
            boot.volume_serial_number,
            boot.file_system_revision >> 8,
            boot.file_system_revision & 0xFF,
            self.first_inum(),
            self.last_inum()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::directory::*;
    use super::*;
    use std::io::Write;

    const SECTOR: usize = 512;
    const CLUSTERS: usize = 16;
    const EOC: u32 = 0xFFFF_FFFF;

    /// 512-byte sectors, one sector per cluster, FAT at sector 1, heap at 2
    struct Image {
        bytes: Vec<u8>,
    }

    impl Image {
        fn new() -> Self {
            let mut bytes = vec![0u8; SECTOR * (2 + CLUSTERS)];
            bytes[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
            bytes[3..11].copy_from_slice(EXFAT_SIGNATURE);
            bytes[72..80].copy_from_slice(&((2 + CLUSTERS) as u64).to_le_bytes());
            bytes[80..84].copy_from_slice(&1u32.to_le_bytes());
            bytes[84..88].copy_from_slice(&1u32.to_le_bytes());
            bytes[88..92].copy_from_slice(&2u32.to_le_bytes());
            bytes[92..96].copy_from_slice(&(CLUSTERS as u32).to_le_bytes());
            bytes[96..100].copy_from_slice(&2u32.to_le_bytes());
            bytes[104..106].copy_from_slice(&0x0100u16.to_le_bytes());
            bytes[108] = 9;
            bytes[110] = 1;
            bytes[510] = 0x55;
            bytes[511] = 0xAA;

            let mut image = Image { bytes };
            image.set_fat(0, 0xFFFF_FFF8);
            image.set_fat(1, EOC);
            image.set_fat(2, EOC);
            image
        }

        fn set_fat(&mut self, cluster: u32, value: u32) {
            let pos = SECTOR + cluster as usize * 4;
            self.bytes[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn cluster_pos(cluster: u32) -> usize {
            SECTOR * 2 + (cluster as usize - 2) * SECTOR
        }

        fn fill(&mut self, cluster: u32, data: &[u8]) {
            let pos = Self::cluster_pos(cluster);
            self.bytes[pos..pos + data.len()].copy_from_slice(data);
        }

        #[allow(clippy::too_many_arguments)]
        fn entry(
            &mut self,
            dir_cluster: u32,
            slot: usize,
            name: &str,
            attrs: u16,
            first_cluster: u32,
            length: u64,
            no_fat_chain: bool,
            deleted: bool,
        ) -> u64 {
            let pos = Self::cluster_pos(dir_cluster) + slot * ENTRY_SIZE;
            let units: Vec<u16> = name.encode_utf16().collect();
            let mask = if deleted { 0x7F } else { 0xFF };

            let b = &mut self.bytes[pos..pos + ENTRY_SIZE * 3];
            b[0] = ENTRY_TYPE_FILE & mask;
            b[1] = 2;
            b[4..6].copy_from_slice(&attrs.to_le_bytes());
            b[32] = ENTRY_TYPE_STREAM & mask;
            b[33] = if no_fat_chain { 0x03 } else { 0x01 };
            b[35] = units.len() as u8;
            b[40..48].copy_from_slice(&length.to_le_bytes());
            b[52..56].copy_from_slice(&first_cluster.to_le_bytes());
            b[56..64].copy_from_slice(&length.to_le_bytes());
            b[64] = ENTRY_TYPE_FILENAME & mask;
            for (i, unit) in units.iter().enumerate() {
                b[66 + i * 2..68 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
            (pos / ENTRY_SIZE) as u64
        }

        fn open(&self) -> (tempfile::NamedTempFile, ExFatFilesystem) {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&self.bytes).unwrap();
            file.flush().unwrap();
            let device = BlockDevice::open(file.path()).unwrap();
            let fs = ExFatFilesystem::open(device).unwrap();
            (file, fs)
        }
    }

    struct Sample {
        hello: u64,
        sub: u64,
        frag: u64,
        gone: u64,
    }

    fn sample() -> (Image, Sample) {
        let mut image = Image::new();
        let hello = image.entry(2, 0, "hello.txt", 0x20, 3, 11, true, false);
        image.fill(3, b"hello world");

        let sub = image.entry(2, 3, "sub", ATTR_DIRECTORY, 4, SECTOR as u64, false, false);
        image.set_fat(4, EOC);

        let frag = image.entry(4, 0, "frag.bin", 0x20, 5, 700, false, false);
        image.set_fat(5, 7);
        image.set_fat(7, EOC);
        image.fill(5, &[b'a'; SECTOR]);
        image.fill(7, &[b'b'; 188]);

        let gone = image.entry(2, 6, "gone.txt", 0x20, 9, 5, true, true);
        image.fill(9, b"ghost");

        (image, Sample { hello, sub, frag, gone })
    }

    #[test]
    fn test_exfat_signature_detection() {
        let mut test_data = vec![0u8; 11];
        test_data[3..11].copy_from_slice(EXFAT_SIGNATURE);
        assert!(is_exfat_boot_sector(&test_data));

        let wrong_signature = vec![0u8; 11];
        assert!(!is_exfat_boot_sector(&wrong_signature));
    }

    #[test]
    fn test_boot_sector_validation() {
        let image = Image::new();
        let boot = ExFatBootSector::parse(&image.bytes[..SECTOR]).unwrap();
        assert_eq!(boot.bytes_per_cluster(), 512);
        assert_eq!(boot.cluster_count, CLUSTERS as u32);

        let mut bad = image.bytes[..SECTOR].to_vec();
        bad[108] = 20;
        assert!(ExFatBootSector::parse(&bad).is_err());

        let mut bad_root = image.bytes[..SECTOR].to_vec();
        bad_root[96..100].copy_from_slice(&100u32.to_le_bytes());
        assert!(ExFatBootSector::parse(&bad_root).is_err());
    }

    #[test]
    fn test_root_listing() {
        let (image, s) = sample();
        let (_file, fs) = image.open();

        let entries = fs.dir_entries(EXFAT_ROOT_INUM, AllocFilter::ALLOCATED).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "hello.txt", "sub"]);
        assert_eq!(entries[2].inode, s.hello);
        assert_eq!(entries[3].entry_type, EntryType::Directory);

        let deleted = fs
            .dir_entries(EXFAT_ROOT_INUM, AllocFilter::new(false, true))
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "gone.txt");
        assert_eq!(deleted[0].inode, s.gone);
        assert!(!deleted[0].record.as_ref().unwrap().allocated);
    }

    #[test]
    fn test_subdirectory_parent_link() {
        let (image, s) = sample();
        let (_file, fs) = image.open();

        fs.dir_entries(EXFAT_ROOT_INUM, AllocFilter::ALLOCATED).unwrap();
        let entries = fs.dir_entries(s.sub, AllocFilter::ALLOCATED).unwrap();
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].inode, EXFAT_ROOT_INUM);
        assert_eq!(entries[2].name, "frag.bin");
        assert_eq!(entries[2].inode, s.frag);

        assert!(fs.dir_entries(s.hello, AllocFilter::ALLOCATED).is_err());
    }

    #[test]
    fn test_fragmented_chain_extents() {
        let (image, s) = sample();
        let (_file, fs) = image.open();

        let record = fs.inode_lookup(s.frag).unwrap().unwrap();
        assert_eq!(record.size, 700);
        let chunks = fs
            .block_walk(&record, 0, 0, BlockWalkFlags::for_stream(0))
            .unwrap();
        assert_eq!(
            chunks,
            vec![
                BlockChunk::Extent { addr: 5, len: 512 },
                BlockChunk::Extent { addr: 7, len: 188 },
            ]
        );

        let mut buf = vec![0u8; 512];
        assert_eq!(fs.read_block(7, &mut buf).unwrap(), 512);
        assert_eq!(&buf[..188], &[b'b'; 188][..]);
        assert!(fs.read_block(40, &mut buf).is_err());
    }

    #[test]
    fn test_deleted_content_needs_recovery() {
        let (image, s) = sample();
        let (_file, fs) = image.open();

        let record = fs.inode_lookup(s.gone).unwrap().unwrap();
        let strict = BlockWalkFlags {
            recover: false,
            ..BlockWalkFlags::for_stream(0)
        };
        assert!(fs.block_walk(&record, 0, 0, strict).is_err());

        let chunks = fs
            .block_walk(&record, 0, 0, BlockWalkFlags::for_stream(0))
            .unwrap();
        assert_eq!(chunks, vec![BlockChunk::Extent { addr: 9, len: 5 }]);
        assert!(fs.block_walk(&record, 0x80, 1, strict).is_err());
    }

    #[test]
    fn test_unlinked_scan_reports_deleted_entries() {
        let (image, s) = sample();
        let (_file, fs) = image.open();

        let found: Vec<u64> = fs
            .inode_scan(fs.first_inum(), fs.last_inum(), MetaFilter::UNLINKED)
            .unwrap()
            .into_iter()
            .map(|r| r.addr)
            .collect();
        assert_eq!(found, vec![s.gone]);

        let all = fs
            .inode_scan(fs.first_inum(), fs.last_inum(), MetaFilter::ALL)
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].addr, EXFAT_ROOT_INUM);
    }

    #[test]
    fn test_lookup_outside_heap() {
        let (image, _) = sample();
        let (_file, fs) = image.open();

        assert!(fs.inode_lookup(EXFAT_ROOT_INUM).unwrap().unwrap().is_dir());
        assert!(fs.inode_lookup(3).unwrap().is_none());
        assert!(fs.inode_lookup(u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_claimed_length_clipped_to_image() {
        let mut image = Image::new();
        let huge = image.entry(2, 0, "huge", 0x20, 14, 1 << 40, true, false);
        let lost = image.entry(2, 3, "lost", 0x20, 16, 1 << 40, true, true);
        let (_file, fs) = image.open();
        assert_eq!(fs.backed_clusters(), CLUSTERS as u64);

        let record = fs.inode_lookup(huge).unwrap().unwrap();
        let chunks = fs
            .block_walk(&record, 0, 0, BlockWalkFlags::for_stream(0))
            .unwrap();
        let addrs: Vec<u64> = chunks
            .iter()
            .map(|chunk| match chunk {
                BlockChunk::Extent { addr, .. } => *addr,
                BlockChunk::Resident(_) => panic!("exFAT content is never resident"),
            })
            .collect();
        assert_eq!(addrs, vec![14, 15, 16, 17]);

        let record = fs.inode_lookup(lost).unwrap().unwrap();
        let chunks = fs
            .block_walk(&record, 0, 0, BlockWalkFlags::for_stream(0))
            .unwrap();
        assert_eq!(chunks.len(), 2);
    }
}
