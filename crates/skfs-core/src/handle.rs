//! The open image and its filesystem

use std::path::Path;

use crate::error::{Result, SkError};
use crate::file::FileHandle;
use crate::fs::common::{BlockDevice, InodeRecord, RawDirEntry};
use crate::fs::{self, Filesystem};
use crate::ident::StreamIdentifier;
use crate::options::{AllocFilter, ImageFormat, OpenOptions, Target, WalkOptions};
use crate::stat::NormalizedStat;
use crate::walk::{DirEntry, DirectoryWalker};
use crate::FileSystemType;

/// One forensic image and the filesystem inside it
///
/// Every other object (walkers, open files) borrows the handle, so the
/// image stays open for as long as any of them is alive. Dropping the
/// handle closes both the filesystem and the image.
pub struct ImageHandle {
    fs: Box<dyn Filesystem>,
    source: String,
    image_format: ImageFormat,
    root: u64,
    block_size: u32,
    first_inum: u64,
    last_inum: u64,
    multi_stream: bool,
}

impl ImageHandle {
    /// Open the image at `path` and the filesystem it contains
    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let source = path.display().to_string();

        let device = match options.image_format {
            ImageFormat::Raw => BlockDevice::open(path),
        }
        .map_err(|e| SkError::ImageOpenFailed {
            path: source.clone(),
            message: format!("{:#}", e),
        })?;

        let fs = fs::open_filesystem(device, options.fs_type).map_err(|e| {
            SkError::FilesystemOpenFailed {
                path: source.clone(),
                message: format!("{:#}", e),
            }
        })?;

        let handle = Self::with_backend(fs, source, options.image_format);
        tracing::info!(
            "Opened {} image {}: {} filesystem, block size {}, inodes {}-{}",
            handle.image_format,
            handle.source,
            handle.fs_type(),
            handle.block_size,
            handle.first_inum,
            handle.last_inum
        );
        Ok(handle)
    }

    /// Wrap an already constructed filesystem
    pub fn from_filesystem<F: Filesystem + 'static>(fs: F) -> Self {
        let source = format!("<{}>", fs.fs_type());
        Self::with_backend(Box::new(fs), source, ImageFormat::Raw)
    }

    fn with_backend(fs: Box<dyn Filesystem>, source: String, image_format: ImageFormat) -> Self {
        Self {
            root: fs.root_inum(),
            block_size: fs.block_size(),
            first_inum: fs.first_inum(),
            last_inum: fs.last_inum(),
            multi_stream: fs.supports_multi_stream(),
            fs,
            source,
            image_format,
        }
    }

    pub fn fs_type(&self) -> FileSystemType {
        self.fs.fs_type()
    }

    /// Where the image came from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn root_inum(&self) -> u64 {
        self.root
    }

    pub fn first_inum(&self) -> u64 {
        self.first_inum
    }

    pub fn last_inum(&self) -> u64 {
        self.last_inum
    }

    /// Whether objects may carry several addressable data streams
    pub fn supports_multi_stream(&self) -> bool {
        self.multi_stream
    }

    pub fn describe(&self) -> String {
        format!(
            "Image: {} ({})\n{}",
            self.source,
            self.image_format,
            self.fs.describe()
        )
    }

    pub(crate) fn fs(&self) -> &dyn Filesystem {
        self.fs.as_ref()
    }

    /// Metadata record of `inode`
    pub fn inode_record(&self, inode: u64) -> Result<InodeRecord> {
        match self.fs.inode_lookup(inode) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(SkError::inode_not_found(inode)),
            Err(e) => Err(SkError::scan(format!("inode {}", inode), e)),
        }
    }

    /// Directory scan of `dir`; `context` names it in errors
    pub(crate) fn scan_dir(
        &self,
        dir: u64,
        filter: AllocFilter,
        context: &str,
    ) -> Result<Vec<RawDirEntry>> {
        tracing::debug!("Scanning directory {} (inode {})", context, dir);
        self.fs
            .dir_entries(dir, filter)
            .map_err(|e| SkError::scan(format!("{} (inode {})", context, dir), e))
    }

    /// Fail with TypeMismatch unless `inode` is a directory
    pub(crate) fn ensure_dir(&self, inode: u64, what: &str) -> Result<InodeRecord> {
        let record = self.inode_record(inode)?;
        if !record.is_dir() {
            return Err(SkError::TypeMismatch(format!("{} is not a directory", what)));
        }
        Ok(record)
    }

    /// The stream a target names
    pub fn target_id(&self, target: &Target) -> Result<StreamIdentifier> {
        match target {
            Target::Path(path) => self.resolve_stream(path),
            Target::Id(id) => Ok(*id),
        }
    }

    /// Names inside the directory at `path`, without `.` and `..`
    pub fn list(&self, path: &str, filter: AllocFilter) -> Result<Vec<String>> {
        Ok(self
            .list_entries(path, filter)?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Entries inside the directory at `path`, without `.` and `..`
    pub fn list_entries(&self, path: &str, filter: AllocFilter) -> Result<Vec<DirEntry>> {
        filter.validate()?;
        let inode = self.resolve(path)?;
        self.ensure_dir(inode, path)?;

        Ok(self
            .scan_dir(inode, filter, path)?
            .into_iter()
            .filter(|raw| !raw.is_dot())
            .map(|raw| DirEntry::from_raw(&raw))
            .collect())
    }

    /// Open one data stream for reading
    pub fn open_file(&self, target: impl Into<Target>) -> Result<FileHandle<'_>> {
        let id = self.target_id(&target.into())?;
        FileHandle::open(self, id)
    }

    /// Start a lazy recursive listing below a directory
    pub fn walk(
        &self,
        target: impl Into<Target>,
        options: WalkOptions,
    ) -> Result<DirectoryWalker<'_>> {
        DirectoryWalker::new(self, target.into(), options)
    }

    pub fn stat(&self, target: impl Into<Target>) -> Result<NormalizedStat> {
        let id = self.target_id(&target.into())?;
        Ok(NormalizedStat::from(&self.inode_record(id.inode)?))
    }

    /// Metadata of an already open file
    pub fn fstat(&self, file: &FileHandle<'_>) -> NormalizedStat {
        NormalizedStat::from(file.record())
    }
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("source", &self.source)
            .field("fs_type", &self.fs_type())
            .field("root", &self.root)
            .field("block_size", &self.block_size)
            .finish()
    }
}
