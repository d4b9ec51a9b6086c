//! exFAT directory entry parsing
//!
//! exFAT uses 32-byte directory entries with multiple types:
//! - 0x85: File entry (deleted: 0x05)
//! - 0xC0: Stream extension (deleted: 0x40)
//! - 0xC1: File name entry (deleted: 0x41)
//! - 0x81: Allocation bitmap
//! - 0x82: Up-case table
//! - 0x83: Volume label

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{NaiveDate, TimeZone, Utc};
use encoding_rs::UTF_16LE;
use std::io::Cursor;

/// Directory entry size in bytes
pub const ENTRY_SIZE: usize = 32;

/// Entry type codes (high bit set = in-use)
pub const ENTRY_TYPE_END: u8 = 0x00;
pub const ENTRY_TYPE_FILE: u8 = 0x85;
pub const ENTRY_TYPE_STREAM: u8 = 0xC0;
pub const ENTRY_TYPE_FILENAME: u8 = 0xC1;

/// Deleted entry type codes (high bit cleared)
pub const ENTRY_TYPE_FILE_DELETED: u8 = 0x05;
pub const ENTRY_TYPE_STREAM_DELETED: u8 = 0x40;
pub const ENTRY_TYPE_FILENAME_DELETED: u8 = 0x41;

/// File attributes
pub const ATTR_READ_ONLY: u16 = 0x01;
pub const ATTR_DIRECTORY: u16 = 0x10;

/// Stream extension flag: clusters are contiguous, the FAT is not used
const FLAG_NO_FAT_CHAIN: u8 = 0x02;

/// Largest possible entry set: a file entry plus 255 secondaries
pub const MAX_SET_BYTES: usize = ENTRY_SIZE * 256;

/// Largest directory the format allows (256 MiB)
pub const MAX_DIRECTORY_BYTES: u64 = 256 * 1024 * 1024;

/// Whether `entry_type` starts a file entry set, in use or deleted
pub fn is_primary_file_entry(entry_type: u8) -> bool {
    entry_type == ENTRY_TYPE_FILE || entry_type == ENTRY_TYPE_FILE_DELETED
}

/// Whether `entry_type` is a stream extension, in use or deleted
pub fn is_stream_entry(entry_type: u8) -> bool {
    entry_type == ENTRY_TYPE_STREAM || entry_type == ENTRY_TYPE_STREAM_DELETED
}

/// File entry (primary entry for a file or directory)
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Number of secondary entries (StreamExtension + FileNames)
    pub secondary_count: u8,
    /// File attributes (directory, hidden, etc.)
    pub file_attributes: u16,
    /// Creation time, Unix seconds
    pub created: i64,
    /// Last modified time, Unix seconds
    pub modified: i64,
    /// Last accessed time, Unix seconds
    pub accessed: i64,
    /// Is this entry deleted?
    pub is_deleted: bool,
}

impl FileEntry {
    /// Parse file entry from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let entry_type = cursor.read_u8()?;
        let secondary_count = cursor.read_u8()?;
        let _set_checksum = cursor.read_u16::<LittleEndian>()?;
        let file_attributes = cursor.read_u16::<LittleEndian>()?;
        let _reserved1 = cursor.read_u16::<LittleEndian>()?;
        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let modify_timestamp = cursor.read_u32::<LittleEndian>()?;
        let access_timestamp = cursor.read_u32::<LittleEndian>()?;
        let _create_10ms = cursor.read_u8()?;
        let _modify_10ms = cursor.read_u8()?;
        let create_utc_offset = cursor.read_u8()?;
        let modify_utc_offset = cursor.read_u8()?;
        let access_utc_offset = cursor.read_u8()?;

        Ok(FileEntry {
            secondary_count,
            file_attributes,
            created: decode_timestamp(create_timestamp, create_utc_offset),
            modified: decode_timestamp(modify_timestamp, modify_utc_offset),
            accessed: decode_timestamp(access_timestamp, access_utc_offset),
            is_deleted: entry_type == ENTRY_TYPE_FILE_DELETED,
        })
    }

    /// Check if this is a directory
    pub fn is_directory(&self) -> bool {
        self.file_attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.file_attributes & ATTR_READ_ONLY != 0
    }
}

/// Stream extension entry (contains size and cluster info)
#[derive(Debug, Clone)]
pub struct StreamExtensionEntry {
    /// General flags (NoFatChain bit)
    pub general_flags: u8,
    /// File name length in characters
    pub name_length: u8,
    /// Valid data length
    pub valid_data_length: u64,
    /// First cluster of data
    pub first_cluster: u32,
    /// Data length (file size)
    pub data_length: u64,
}

impl StreamExtensionEntry {
    /// Parse stream extension entry from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let _entry_type = cursor.read_u8()?;
        let general_flags = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        let name_length = cursor.read_u8()?;
        let _name_hash = cursor.read_u16::<LittleEndian>()?;
        let _reserved2 = cursor.read_u16::<LittleEndian>()?;
        let valid_data_length = cursor.read_u64::<LittleEndian>()?;
        let _reserved3 = cursor.read_u32::<LittleEndian>()?;
        let first_cluster = cursor.read_u32::<LittleEndian>()?;
        let data_length = cursor.read_u64::<LittleEndian>()?;

        Ok(StreamExtensionEntry {
            general_flags,
            name_length,
            valid_data_length,
            first_cluster,
            data_length,
        })
    }

    /// Check if file uses contiguous allocation (NoFatChain)
    pub fn is_contiguous(&self) -> bool {
        self.general_flags & FLAG_NO_FAT_CHAIN != 0
    }
}

/// A complete file entry set (File + StreamExtension + FileNames)
#[derive(Debug, Clone)]
pub struct FileEntrySet {
    /// Primary file entry
    pub file_entry: FileEntry,
    /// Stream extension with size/cluster info
    pub stream_extension: StreamExtensionEntry,
    /// Complete filename (concatenated from FileName entries)
    pub filename: String,
    /// Is this a deleted file entry set?
    pub is_deleted: bool,
}

impl FileEntrySet {
    /// Parse the entry set that starts at the beginning of `data`
    ///
    /// Deleted sets are accepted as long as their secondary entries still
    /// carry the deleted stream and name types.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_SIZE * 3 || !is_primary_file_entry(data[0]) {
            return None;
        }

        let file_entry = FileEntry::parse(&data[..ENTRY_SIZE]).ok()?;
        let secondary_count = file_entry.secondary_count as usize;
        if secondary_count < 2 || data.len() < ENTRY_SIZE * (secondary_count + 1) {
            return None;
        }

        // Second entry must be StreamExtension
        let stream_data = &data[ENTRY_SIZE..ENTRY_SIZE * 2];
        if !is_stream_entry(stream_data[0]) {
            return None;
        }
        let stream_extension = StreamExtensionEntry::parse(stream_data).ok()?;

        // Remaining entries are FileName entries, 15 UTF-16 units each
        let mut name_units = Vec::with_capacity(secondary_count * 30);
        for i in 2..=secondary_count {
            let entry = &data[ENTRY_SIZE * i..ENTRY_SIZE * (i + 1)];
            match entry[0] {
                ENTRY_TYPE_FILENAME | ENTRY_TYPE_FILENAME_DELETED => {
                    name_units.extend_from_slice(&entry[2..ENTRY_SIZE]);
                }
                // other secondaries (vendor extensions) carry no name
                _ => {}
            }
        }

        // Trim filename to actual length
        let name_bytes = (stream_extension.name_length as usize * 2).min(name_units.len());
        let filename = decode_utf16_filename(&name_units[..name_bytes]);
        if filename.is_empty() {
            return None;
        }

        Some(FileEntrySet {
            is_deleted: file_entry.is_deleted,
            file_entry,
            stream_extension,
            filename,
        })
    }

    /// Bytes occupied by the whole set
    pub fn byte_len(&self) -> usize {
        ENTRY_SIZE * (self.file_entry.secondary_count as usize + 1)
    }
}

/// Decode UTF-16LE filename, dropping trailing NULs
pub fn decode_utf16_filename(utf16_data: &[u8]) -> String {
    let mut end = utf16_data.len() & !1;
    while end >= 2 && utf16_data[end - 2] == 0 && utf16_data[end - 1] == 0 {
        end -= 2;
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(&utf16_data[..end]);
    if had_errors {
        tracing::debug!("Replacing invalid UTF-16 in filename");
    }
    decoded.into_owned()
}

/// Convert an exFAT timestamp and its UTC offset byte into Unix seconds
///
/// Layout: year-1980 (7 bits), month (4), day (5), hour (5), minute (6),
/// seconds/2 (5). The offset byte is valid when bit 7 is set and counts
/// signed 15 minute steps. Invalid dates decode to 0.
pub fn decode_timestamp(raw: u32, utc_offset: u8) -> i64 {
    let year = 1980 + (raw >> 25) as i32;
    let month = (raw >> 21) & 0x0F;
    let day = (raw >> 16) & 0x1F;
    let hour = (raw >> 11) & 0x1F;
    let minute = (raw >> 5) & 0x3F;
    let second = (raw & 0x1F) * 2;

    let naive = match NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
    {
        Some(naive) => naive,
        None => return 0,
    };
    let local = Utc.from_utc_datetime(&naive).timestamp();

    if utc_offset & 0x80 != 0 {
        // sign-extend the 7-bit field
        let steps = ((utc_offset << 1) as i8 >> 1) as i64;
        local - steps * 15 * 60
    } else {
        local
    }
}
