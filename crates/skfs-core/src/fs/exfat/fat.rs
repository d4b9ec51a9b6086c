//! exFAT File Allocation Table (FAT) parsing and chain traversal
//!
//! The FAT maps cluster chains for files in exFAT.
//!
//! FAT Entry Values:
//! - 0x00000000: Free cluster
//! - 0x00000001: Reserved
//! - 0x00000002-0xFFFFFFF6: Next cluster in chain
//! - 0xFFFFFFF7: Bad cluster
//! - 0xFFFFFFF8-0xFFFFFFFF: End of chain

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashSet;
use std::io::Cursor;

use super::ExFatBootSector;
use crate::fs::common::BlockDevice;

/// Special FAT entry values
pub const FAT_ENTRY_FREE: u32 = 0x00000000;
pub const FAT_ENTRY_BAD: u32 = 0xFFFFFFF7;
pub const FAT_ENTRY_EOC_MIN: u32 = 0xFFFFFFF8; // End of chain minimum

/// First cluster number of the cluster heap
pub const FIRST_DATA_CLUSTER: u32 = 2;

/// exFAT File Allocation Table
#[derive(Debug)]
pub struct FatTable {
    /// FAT entries (one per cluster, including the two reserved ones)
    entries: Vec<u32>,
    /// Clusters in the heap, from the boot sector
    cluster_count: u32,
    /// Bytes per cluster
    cluster_size: u32,
    /// Cluster heap offset in bytes
    heap_offset: u64,
}

impl FatTable {
    /// Read the first FAT from the image
    pub fn from_device(device: &BlockDevice, boot: &ExFatBootSector) -> Result<Self> {
        let bytes_per_sector = boot.bytes_per_sector() as u64;
        let fat_offset_bytes = boot.fat_offset as u64 * bytes_per_sector;

        // Only entries for real clusters matter; a longer FAT is padding
        let wanted = (boot.cluster_count as u64 + FIRST_DATA_CLUSTER as u64) * 4;
        let fat_size_bytes = (boot.fat_length as u64 * bytes_per_sector).min(wanted);

        tracing::debug!(
            "Reading FAT: offset=0x{:x}, size={} bytes",
            fat_offset_bytes,
            fat_size_bytes
        );

        let fat_data = device
            .read_bytes(fat_offset_bytes, fat_size_bytes as usize)
            .context("reading the allocation table")?;

        // Parse FAT entries (4 bytes each)
        let mut entries = Vec::with_capacity(fat_data.len() / 4);
        let mut cursor = Cursor::new(fat_data);
        while let Ok(entry) = cursor.read_u32::<LittleEndian>() {
            entries.push(entry);
        }

        tracing::debug!("Parsed {} FAT entries", entries.len());

        Ok(FatTable {
            entries,
            cluster_count: boot.cluster_count,
            cluster_size: boot.bytes_per_cluster(),
            heap_offset: boot.cluster_heap_offset as u64 * bytes_per_sector,
        })
    }

    /// Whether `cluster` addresses a cluster inside the heap
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= FIRST_DATA_CLUSTER
            && (cluster - FIRST_DATA_CLUSTER) < self.cluster_count
    }

    /// Check if entry is end of chain
    pub fn is_end_of_chain(&self, entry: u32) -> bool {
        entry >= FAT_ENTRY_EOC_MIN
    }

    /// Get the next cluster in chain (None if end of chain or invalid)
    pub fn next_cluster(&self, cluster: u32) -> Option<u32> {
        let next = *self.entries.get(cluster as usize)?;
        if self.is_valid_cluster(next) && next < FAT_ENTRY_BAD {
            Some(next)
        } else {
            None // End of chain, free or bad cluster
        }
    }

    /// Follow the chain starting at `start_cluster`, at most `limit` clusters
    pub fn get_chain(&self, start_cluster: u32, limit: usize) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start_cluster;

        // Follow chain with loop detection
        while self.is_valid_cluster(current) && chain.len() < limit {
            if !visited.insert(current) {
                tracing::warn!("FAT chain loop detected at cluster {}", current);
                break;
            }
            chain.push(current);

            match self.next_cluster(current) {
                Some(next) => current = next,
                None => break,
            }
        }

        chain
    }

    /// Consecutive clusters from `start_cluster`, clipped to the heap
    pub fn contiguous_run(&self, start_cluster: u32, count: u64) -> Vec<u32> {
        if !self.is_valid_cluster(start_cluster) {
            return Vec::new();
        }
        let available = (self.cluster_count - (start_cluster - FIRST_DATA_CLUSTER)) as u64;
        let count = count.min(available) as u32;
        (start_cluster..start_cluster + count).collect()
    }

    /// Get cluster size in bytes
    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Byte offset of the cluster heap
    pub fn heap_offset(&self) -> u64 {
        self.heap_offset
    }

    /// Byte length of the cluster heap
    pub fn heap_length(&self) -> u64 {
        self.cluster_count as u64 * self.cluster_size as u64
    }

    /// Calculate byte offset for a cluster
    pub fn cluster_offset(&self, cluster: u32) -> Option<u64> {
        if !self.is_valid_cluster(cluster) {
            return None;
        }
        Some(self.heap_offset + (cluster - FIRST_DATA_CLUSTER) as u64 * self.cluster_size as u64)
    }

    /// Get total cluster count
    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Count free clusters
    pub fn free_cluster_count(&self) -> usize {
        self.entries
            .iter()
            .skip(FIRST_DATA_CLUSTER as usize) // Skip first two reserved entries
            .filter(|&&e| e == FAT_ENTRY_FREE)
            .count()
    }
}
