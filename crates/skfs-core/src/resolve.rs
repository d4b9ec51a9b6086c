//! Path to identifier resolution and back

use std::collections::HashSet;

use crate::error::{Result, SkError};
use crate::fs::common::{EntryType, RawDirEntry};
use crate::handle::ImageHandle;
use crate::ident::{is_root_path, join_path, split_path, split_stream_suffix, StreamIdentifier};
use crate::options::AllocFilter;

impl ImageHandle {
    /// Inode of the object at `path`
    ///
    /// Segments are matched exactly against allocated names only. The root
    /// (`""` or `"/"`) resolves without touching the filesystem.
    pub fn resolve(&self, path: &str) -> Result<u64> {
        if is_root_path(path) {
            return Ok(self.root_inum());
        }
        let segments: Vec<&str> = split_path(path).collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Ok(self.root_inum()),
        };

        let (dir, dir_path) = self.descend(parents, path)?;
        match self.find_child(dir, &dir_path, last)? {
            Some(entry) => Ok(entry.inode),
            None => Err(SkError::path_not_found(path)),
        }
    }

    /// Stream identifier of `path`, honouring a trailing `:stream` suffix
    ///
    /// The suffix is only recognized on multi-stream filesystems, and only
    /// when no object carries the literal name.
    pub fn resolve_stream(&self, path: &str) -> Result<StreamIdentifier> {
        if is_root_path(path) {
            return Ok(StreamIdentifier::inode(self.root_inum()));
        }
        let segments: Vec<&str> = split_path(path).collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return Ok(StreamIdentifier::inode(self.root_inum())),
        };

        let (dir, dir_path) = self.descend(parents, path)?;
        let entries = self.scan_dir(dir, AllocFilter::ALLOCATED, &dir_path)?;

        if let Some(entry) = entries.iter().find(|e| !e.is_dot() && e.name == *last) {
            return Ok(StreamIdentifier::inode(entry.inode));
        }

        let (name, stream) = match split_stream_suffix(last) {
            Some(split) if self.supports_multi_stream() => split,
            _ => return Err(SkError::path_not_found(path)),
        };
        let entry = match entries.iter().find(|e| !e.is_dot() && e.name == name) {
            Some(entry) => entry,
            None => return Err(SkError::path_not_found(path)),
        };

        let record = match &entry.record {
            Some(record) => record.clone(),
            None => self.inode_record(entry.inode)?,
        };
        let found = record
            .data_streams()
            .find(|attr| attr.name == stream)
            .map(|attr| (attr.attr_type, attr.id));
        match found {
            Some((attr_type, attr_id)) => Ok(StreamIdentifier::new(entry.inode, attr_type, attr_id)),
            None => Err(SkError::NotFound(format!(
                "stream {:?} of {}",
                stream,
                join_path(&dir_path, name)
            ))),
        }
    }

    /// A path naming `inode`
    ///
    /// Uses the filesystem's own reverse lookup when it has one, otherwise
    /// searches allocated names from the root in pre-order and returns the
    /// first match.
    pub fn reverse_resolve(&self, inode: u64) -> Result<String> {
        if inode == self.root_inum() {
            return Ok("/".to_string());
        }

        if self.fs().has_reverse_lookup() {
            return match self.fs().find_path(inode) {
                Ok(Some(path)) => Ok(path),
                Ok(None) => Err(SkError::inode_not_found(inode)),
                Err(e) => Err(SkError::scan(format!("path lookup of inode {}", inode), e)),
            };
        }

        // (inode, path, is directory), popped in pre-order
        let mut stack = vec![(self.root_inum(), "/".to_string(), true)];
        let mut visited = HashSet::new();

        while let Some((current, path, is_dir)) = stack.pop() {
            if current == inode && path != "/" {
                return Ok(path);
            }
            if !is_dir || !visited.insert(current) {
                continue;
            }

            let entries = self.scan_dir(current, AllocFilter::ALLOCATED, &path)?;
            for entry in entries.iter().rev().filter(|e| !e.is_dot()) {
                stack.push((
                    entry.inode,
                    join_path(&path, &entry.name),
                    entry.entry_type == EntryType::Directory,
                ));
            }
        }

        Err(SkError::inode_not_found(inode))
    }

    /// Follow `segments` from the root, each of which must be a directory
    fn descend(&self, segments: &[&str], full_path: &str) -> Result<(u64, String)> {
        let mut dir = self.root_inum();
        let mut dir_path = "/".to_string();

        for segment in segments {
            let entry = match self.find_child(dir, &dir_path, segment)? {
                Some(entry) => entry,
                None => return Err(SkError::path_not_found(full_path)),
            };
            dir_path = join_path(&dir_path, segment);
            if entry.entry_type != EntryType::Directory {
                return Err(SkError::TypeMismatch(format!(
                    "{} is not a directory",
                    dir_path
                )));
            }
            dir = entry.inode;
        }

        Ok((dir, dir_path))
    }

    fn find_child(&self, dir: u64, dir_path: &str, name: &str) -> Result<Option<RawDirEntry>> {
        Ok(self
            .scan_dir(dir, AllocFilter::ALLOCATED, dir_path)?
            .into_iter()
            .find(|e| !e.is_dot() && e.name == name))
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::memory::{MemoryFilesystem, Storage};
    use crate::{ImageHandle, SkError, StreamIdentifier};

    fn tree() -> (ImageHandle, u64, u64) {
        let mut fs = MemoryFilesystem::new(512).with_multi_stream(true);
        let root = fs.root();
        let dir = fs.add_dir(root, "dir1");
        let nested = fs.add_dir(dir, "nested");
        let file = fs.add_file(nested, "x.bin", b"abc", Storage::Contiguous);
        fs.add_stream(file, "alt", b"hidden", Storage::Resident);
        (ImageHandle::from_filesystem(fs), nested, file)
    }

    #[test]
    fn test_resolve_root_forms() {
        let (image, _, _) = tree();
        assert_eq!(image.resolve("").unwrap(), image.root_inum());
        assert_eq!(image.resolve("/").unwrap(), image.root_inum());
        assert_eq!(image.reverse_resolve(image.root_inum()).unwrap(), "/");
    }

    #[test]
    fn test_resolve_nested() {
        let (image, nested, file) = tree();
        assert_eq!(image.resolve("/dir1/nested").unwrap(), nested);
        assert_eq!(image.resolve("dir1//nested/x.bin/").unwrap(), file);
        assert!(image.resolve("/dir1/none").unwrap_err().is_not_found());
        assert!(matches!(
            image.resolve("/dir1/nested/x.bin/deeper"),
            Err(SkError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_reverse_resolve_by_search() {
        let (image, nested, file) = tree();
        assert_eq!(image.reverse_resolve(nested).unwrap(), "/dir1/nested");
        assert_eq!(image.reverse_resolve(file).unwrap(), "/dir1/nested/x.bin");
        assert!(image.reverse_resolve(9999).unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_stream_suffix() {
        let (image, _, file) = tree();
        let default = image.resolve_stream("/dir1/nested/x.bin").unwrap();
        assert_eq!(default, StreamIdentifier::inode(file));

        let alt = image.resolve_stream("/dir1/nested/x.bin:alt").unwrap();
        assert_eq!(alt.inode, file);
        assert_eq!(alt.stream_type, 0x80);
        assert_ne!(alt.stream_id, 0);

        assert!(image
            .resolve_stream("/dir1/nested/x.bin:nope")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_stream_suffix_ignored_on_single_stream() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        let file = fs.add_file(root, "f", b"abc", Storage::Resident);
        fs.add_stream(file, "alt", b"x", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);
        assert!(image.resolve_stream("/f:alt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_scan_failure_is_not_absence() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        let dir = fs.add_dir(root, "broken");
        fs.fail_directory(dir);
        let image = ImageHandle::from_filesystem(fs);
        assert!(matches!(
            image.resolve("/broken/file"),
            Err(SkError::ScanFailed { .. })
        ));
    }

    #[test]
    fn test_reverse_resolve_uses_direct_lookup() {
        let mut fs = MemoryFilesystem::new(512).with_reverse_lookup(true);
        let root = fs.root();
        let dir = fs.add_dir(root, "d");
        let file = fs.add_file(dir, "f", b"", Storage::Resident);
        // the search would fail on this directory; the direct lookup never scans
        fs.fail_directory(dir);
        let image = ImageHandle::from_filesystem(fs);
        assert_eq!(image.reverse_resolve(file).unwrap(), "/d/f");
    }
}
