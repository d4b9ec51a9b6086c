//! Read-only access to raw image files
use anyhow::{Context, Result};
use memmap2::MmapOptions;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped image file, never written through
pub struct BlockDevice {
    _file: File,
    mmap: memmap2::Mmap,
    size: u64,
    path: PathBuf,
}

impl BlockDevice {
    /// Open a raw image file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let size = file.metadata()?.len();

        if size == 0 {
            anyhow::bail!("{} is empty", path.display());
        }

        // Safety: the mapping is read-only and the image is treated as
        // immutable evidence for the lifetime of the handle.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        tracing::debug!("Mapped image {} ({} bytes)", path.display(), size);

        Ok(BlockDevice {
            _file: file,
            mmap,
            size,
            path: path.to_path_buf(),
        })
    }

    /// Get the size of the image in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a slice of bytes from the image
    pub fn read_bytes(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let start = usize::try_from(offset)
            .with_context(|| format!("offset {} does not fit in memory", offset))?;
        let end = start
            .checked_add(length)
            .with_context(|| format!("read of {} bytes at {} overflows", length, offset))?;

        if end > self.mmap.len() {
            anyhow::bail!("Read beyond end of device: {} > {}", end, self.mmap.len());
        }

        Ok(&self.mmap[start..end])
    }

    /// Read whatever is available of `length` bytes at `offset`, possibly fewer
    pub fn read_available(&self, offset: u64, length: usize) -> &[u8] {
        let len = self.mmap.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(length).min(len);
        &self.mmap[start..end]
    }

    /// Read a single sector (512 bytes)
    pub fn read_sector(&self, sector: u64) -> Result<&[u8]> {
        let offset = sector
            .checked_mul(512)
            .with_context(|| format!("sector {} out of range", sector))?;
        self.read_bytes(offset, 512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image_with(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_bytes_bounds() {
        let image = image_with(&[1u8; 1024]);
        let device = BlockDevice::open(image.path()).unwrap();

        assert_eq!(device.size(), 1024);
        assert_eq!(device.read_bytes(1000, 24).unwrap().len(), 24);
        assert!(device.read_bytes(1000, 25).is_err());
        assert!(device.read_bytes(u64::MAX, 2).is_err());
        assert_eq!(device.read_sector(1).unwrap().len(), 512);
        assert!(device.read_sector(2).is_err());
    }

    #[test]
    fn test_read_available_truncates() {
        let image = image_with(&[7u8; 100]);
        let device = BlockDevice::open(image.path()).unwrap();

        assert_eq!(device.read_available(90, 20).len(), 10);
        assert!(device.read_available(200, 20).is_empty());
    }

    #[test]
    fn test_empty_image_rejected() {
        let image = image_with(&[]);
        assert!(BlockDevice::open(image.path()).is_err());
    }
}
