//! Readable byte streams over block extents or resident data

use serde::{Deserialize, Serialize};
use std::io;

use crate::error::{Result, SkError};
use crate::fs::common::{BlockChunk, BlockWalkFlags, InodeRecord};
use crate::handle::ImageHandle;
use crate::ident::StreamIdentifier;

/// A run of `length` bytes starting at block `addr`
///
/// Runs longer than one block continue in the following blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub addr: u64,
    pub length: u32,
}

/// Reference point for [`FileHandle::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

impl Whence {
    /// Map the conventional 0/1/2 `whence` values
    pub fn from_raw(whence: i32) -> Result<Self> {
        match whence {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(SkError::Parse(format!("invalid whence {}", other))),
        }
    }
}

#[derive(Debug)]
enum Content {
    Resident(Vec<u8>),
    Extents(Vec<Extent>),
}

/// One open data stream
///
/// The layout is captured once at open time; afterwards only the cursor
/// changes.
pub struct FileHandle<'a> {
    image: &'a ImageHandle,
    id: StreamIdentifier,
    record: InodeRecord,
    size: u64,
    cursor: u64,
    content: Content,
}

impl<'a> FileHandle<'a> {
    pub(crate) fn open(image: &'a ImageHandle, id: StreamIdentifier) -> Result<Self> {
        let record = image.inode_record(id.inode)?;

        if !id.is_default_stream()
            && image.supports_multi_stream()
            && !record
                .attrs
                .iter()
                .any(|a| a.in_use && a.attr_type == id.stream_type && a.id == id.stream_id)
        {
            return Err(SkError::stream_not_found(id));
        }

        let chunks = image
            .fs()
            .block_walk(
                &record,
                id.stream_type,
                id.stream_id,
                BlockWalkFlags::for_stream(id.stream_id),
            )
            .map_err(|e| SkError::scan(format!("block walk of {}", id), e))?;

        let mut resident = None;
        let mut extents = Vec::new();
        let mut size = 0u64;
        for chunk in chunks {
            match chunk {
                BlockChunk::Resident(data) => resident = Some(data),
                BlockChunk::Extent { addr, len } if len > 0 => {
                    extents.push(Extent { addr, length: len });
                    size += len as u64;
                }
                BlockChunk::Extent { .. } => {}
            }
        }

        let content = match resident {
            Some(data) => {
                size = data.len() as u64;
                Content::Resident(data)
            }
            None => Content::Extents(extents),
        };

        tracing::debug!(
            "Opened {}: {} bytes, {}",
            id,
            size,
            match &content {
                Content::Resident(_) => "resident".to_string(),
                Content::Extents(e) => format!("{} extents", e.len()),
            }
        );

        Ok(Self {
            image,
            id,
            record,
            size,
            cursor: 0,
            content,
        })
    }

    pub fn id(&self) -> StreamIdentifier {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.content, Content::Resident(_))
    }

    /// Block runs backing the stream, in logical order; empty when resident
    pub fn list_extents(&self) -> &[Extent] {
        match &self.content {
            Content::Resident(_) => &[],
            Content::Extents(extents) => extents,
        }
    }

    pub(crate) fn record(&self) -> &InodeRecord {
        &self.record
    }

    /// Move the cursor; the result may lie past the end but never before 0
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.cursor as i128,
            Whence::End => self.size as i128,
        };
        let target = base + offset as i128;
        if target < 0 {
            return Err(SkError::Parse(format!(
                "seek to negative offset {} in {}",
                target, self.id
            )));
        }
        self.cursor = u64::try_from(target)
            .map_err(|_| SkError::Parse(format!("seek offset {} out of range", target)))?;
        Ok(self.cursor)
    }

    /// Read up to `requested` bytes at the cursor, or everything left when
    /// `None`; returns no bytes at or past the end
    pub fn read(&mut self, requested: Option<u64>) -> Result<Vec<u8>> {
        let remaining = self.size.saturating_sub(self.cursor);
        let length = requested.map_or(remaining, |r| r.min(remaining));
        let length = usize::try_from(length).map_err(|_| SkError::OutOfMemory(usize::MAX))?;

        let mut out = Vec::new();
        out.try_reserve_exact(length)
            .map_err(|_| SkError::OutOfMemory(length))?;
        if length == 0 {
            return Ok(out);
        }

        match &self.content {
            Content::Resident(data) => {
                let start = self.cursor as usize;
                out.extend_from_slice(&data[start..start + length]);
            }
            Content::Extents(extents) => {
                self.read_extents(extents, self.cursor, length as u64, &mut out)?;
            }
        }

        self.cursor += out.len() as u64;
        Ok(out)
    }

    fn read_extents(
        &self,
        extents: &[Extent],
        offset: u64,
        length: u64,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let block_size = self.image.block_size() as u64;
        let mut block = vec![0u8; block_size as usize];
        let end = offset + length;
        let mut logical = 0u64;

        for extent in extents {
            let extent_start = logical;
            let extent_end = logical + extent.length as u64;
            logical = extent_end;
            if extent_end <= offset {
                continue;
            }
            if extent_start >= end {
                break;
            }

            // byte range wanted from this extent, relative to its start
            let mut pos = offset.max(extent_start) - extent_start;
            let stop = end.min(extent_end) - extent_start;
            while pos < stop {
                let addr = extent.addr + pos / block_size;
                let within = (pos % block_size) as usize;
                let take = (block_size - within as u64).min(stop - pos) as usize;

                self.fetch_block(addr, &mut block, within + take)?;
                out.extend_from_slice(&block[within..within + take]);
                pos += take as u64;
            }
        }
        Ok(())
    }

    /// Read block `addr`, zero-filling whatever the backend could not supply
    fn fetch_block(&self, addr: u64, block: &mut [u8], needed: usize) -> Result<()> {
        let got = self
            .image
            .fs()
            .read_block(addr, block)
            .map_err(|e| SkError::scan(format!("block {} of {}", addr, self.id), e))?;
        if got < block.len() {
            block[got..].fill(0);
            if got < needed {
                tracing::warn!(
                    "Short read of block {} for {}: {} of {} bytes",
                    addr,
                    self.id,
                    got,
                    needed
                );
            }
        }
        Ok(())
    }
}

impl io::Read for FileHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = FileHandle::read(self, Some(buf.len() as u64))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Seek for FileHandle<'_> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let result = match pos {
            io::SeekFrom::Start(offset) => {
                self.cursor = offset;
                Ok(offset)
            }
            io::SeekFrom::Current(offset) => FileHandle::seek(self, offset, Whence::Current),
            io::SeekFrom::End(offset) => FileHandle::seek(self, offset, Whence::End),
        };
        result.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

impl std::fmt::Debug for FileHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .field("content", &self.content)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::{MemoryFilesystem, Storage};
    use std::io::{Read, Seek, SeekFrom};

    fn image_with(data: &[u8], storage: Storage) -> ImageHandle {
        let mut fs = MemoryFilesystem::new(4);
        let root = fs.root();
        fs.add_file(root, "f", data, storage);
        ImageHandle::from_filesystem(fs)
    }

    #[test]
    fn test_resident_read() {
        let image = image_with(b"0123456789", Storage::Resident);
        let mut file = image.open_file("/f").unwrap();
        assert!(file.is_resident());
        assert!(file.list_extents().is_empty());
        assert_eq!(file.size(), 10);
        assert_eq!(file.read(Some(4)).unwrap(), b"0123");
        assert_eq!(file.tell(), 4);
        assert_eq!(file.read(None).unwrap(), b"456789");
        assert!(file.read(None).unwrap().is_empty());
    }

    #[test]
    fn test_fragmented_read_across_blocks() {
        let image = image_with(b"abcdefghij", Storage::Fragmented);
        let mut file = image.open_file("/f").unwrap();
        assert_eq!(file.list_extents().len(), 3);
        assert_eq!(file.list_extents()[0].addr, 4);

        file.seek(2, Whence::Start).unwrap();
        assert_eq!(file.read(Some(7)).unwrap(), b"cdefghi");
        assert_eq!(file.tell(), 9);
        assert_eq!(file.read(Some(100)).unwrap(), b"j");
    }

    #[test]
    fn test_seek_semantics() {
        let image = image_with(b"0123456789", Storage::Contiguous);
        let mut file = image.open_file("/f").unwrap();

        assert_eq!(file.seek(-3, Whence::End).unwrap(), 7);
        assert_eq!(file.read(None).unwrap(), b"789");
        assert_eq!(file.seek(-5, Whence::Current).unwrap(), 5);
        assert!(matches!(file.seek(-6, Whence::Current), Err(SkError::Parse(_))));
        assert_eq!(file.tell(), 5);

        assert_eq!(file.seek(1_000_000, Whence::Start).unwrap(), 1_000_000);
        assert!(file.read(Some(5)).unwrap().is_empty());
        assert_eq!(file.tell(), 1_000_000);
    }

    #[test]
    fn test_empty_stream() {
        let image = image_with(b"", Storage::Contiguous);
        let mut file = image.open_file("/f").unwrap();
        assert_eq!(file.size(), 0);
        assert!(file.read(None).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_block_is_scan_failure() {
        let mut fs = MemoryFilesystem::new(4);
        let root = fs.root();
        fs.add_file(root, "real", b"wxyz", Storage::Contiguous);
        // second run points past the last block
        fs.add_raw_file(root, "bad", vec![(0, 4), (50, 4)]);
        let image = ImageHandle::from_filesystem(fs);

        let mut file = image.open_file("/bad").unwrap();
        assert_eq!(file.size(), 8);
        assert_eq!(file.read(Some(4)).unwrap(), b"wxyz");
        assert!(matches!(file.read(None), Err(SkError::ScanFailed { .. })));
    }

    #[test]
    fn test_long_extent_spans_blocks() {
        let mut fs = MemoryFilesystem::new(4);
        let root = fs.root();
        fs.add_file(root, "src", b"0123456789AB", Storage::Contiguous);
        fs.add_raw_file(root, "run", vec![(0, 10)]);
        let image = ImageHandle::from_filesystem(fs);

        let mut file = image.open_file("/run").unwrap();
        file.seek(3, Whence::Start).unwrap();
        assert_eq!(file.read(None).unwrap(), b"3456789");
    }

    #[test]
    fn test_io_traits() {
        let image = image_with(b"stream contents", Storage::Fragmented);
        let mut file = image.open_file("/f").unwrap();

        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        assert_eq!(text, "stream contents");

        Seek::seek(&mut file, SeekFrom::End(-8)).unwrap();
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"contents");
        assert!(Seek::seek(&mut file, SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn test_missing_stream_id() {
        let mut fs = MemoryFilesystem::new(4).with_multi_stream(true);
        let root = fs.root();
        let inode = fs.add_file(root, "f", b"x", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        let err = image
            .open_file(StreamIdentifier::new(inode, 0x80, 42))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(image.open_file(StreamIdentifier::inode(999)).unwrap_err().is_not_found());
    }
}
