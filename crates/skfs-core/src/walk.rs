//! Lazy, restartable depth-first directory walker
//!
//! Each step lists exactly one directory and returns it together with its
//! subdirectories and files; subdirectories are queued on an explicit stack
//! and expanded by later steps. On multi-stream filesystems every data stream
//! and directory index of a child becomes its own entry, named
//! `name:stream` unless the stream carries the default name.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkError};
use crate::fs::common::{AllocState, Attribute, EntryType, RawDirEntry};
use crate::handle::ImageHandle;
use crate::ident::{is_root_path, join_path, split_path, StreamIdentifier};
use crate::options::{Projection, Target, WalkOptions};

/// One name inside a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub id: StreamIdentifier,
    pub entry_type: EntryType,
    pub alloc: AllocState,
}

impl DirEntry {
    /// The entry for a directory scan result, addressing its default stream
    pub(crate) fn from_raw(raw: &RawDirEntry) -> Self {
        Self {
            name: raw.name.clone(),
            id: StreamIdentifier::inode(raw.inode),
            entry_type: raw.entry_type,
            alloc: raw.alloc,
        }
    }

    fn for_stream(raw: &RawDirEntry, attr: &Attribute, entry_type: EntryType) -> Self {
        let name = if attr.has_default_name() {
            raw.name.clone()
        } else {
            format!("{}:{}", raw.name, attr.name)
        };
        Self {
            name,
            id: StreamIdentifier::new(raw.inode, attr.attr_type, attr.id),
            entry_type,
            alloc: raw.alloc,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// A directory waiting to be listed
#[derive(Debug)]
struct PendingDir {
    entry: DirEntry,
    path: String,
    /// Directory inodes from the walk's start down to this one
    ancestors: Vec<u64>,
}

/// A walker entry, carrying only what the projection asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<StreamIdentifier>,
    pub allocated: bool,
}

impl WalkItem {
    fn project(name: &str, entry: &DirEntry, projection: Projection) -> Self {
        Self {
            name: projection.wants_names().then(|| name.to_string()),
            id: projection.wants_identifiers().then_some(entry.id),
            allocated: entry.alloc.is_allocated(),
        }
    }
}

/// Result of one walker step: a directory (by full path) and its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkStep {
    pub dir: WalkItem,
    pub subdirs: Vec<WalkItem>,
    pub files: Vec<WalkItem>,
}

/// Recursive directory listing, one directory per step
///
/// Directory loops are cut: a subdirectory whose inode already appears on
/// its own path from the start is still reported but not descended. A
/// directory reachable under several names is walked under each. A directory
/// that cannot be listed produces one `Err` step and is recorded in
/// [`DirectoryWalker::skipped`]; the rest of the walk continues.
pub struct DirectoryWalker<'a> {
    image: &'a ImageHandle,
    options: WalkOptions,
    stack: Vec<PendingDir>,
    skipped: Vec<String>,
}

impl<'a> DirectoryWalker<'a> {
    pub(crate) fn new(image: &'a ImageHandle, target: Target, options: WalkOptions) -> Result<Self> {
        options.filter.validate()?;

        let (path, id) = match target {
            Target::Path(path) => {
                let id = image.resolve_stream(&path)?;
                (normalize(&path), id)
            }
            Target::Id(id) => (image.reverse_resolve(id.inode)?, id),
        };
        image.ensure_dir(id.inode, &path)?;

        tracing::debug!("Walking from {} ({})", path, id);
        Ok(Self {
            image,
            options,
            stack: vec![PendingDir {
                entry: DirEntry {
                    name: String::new(),
                    id,
                    entry_type: EntryType::Directory,
                    alloc: AllocState::Allocated,
                },
                path,
                ancestors: vec![id.inode],
            }],
            skipped: Vec::new(),
        })
    }

    /// Directories queued but not yet listed
    pub fn pending(&self) -> usize {
        self.stack.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.stack.is_empty()
    }

    /// Paths of directories whose listing failed
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// List the next queued directory; `None` once the walk is complete
    pub fn next_step(&mut self) -> Option<Result<WalkStep>> {
        let current = self.stack.pop()?;

        let raw_entries = match self.image.scan_dir(
            current.entry.id.inode,
            self.options.filter,
            &current.path,
        ) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!("Skipping {} ({}): {}", current.path, current.entry.id, err);
                self.skipped.push(current.path.clone());
                return Some(Err(match err {
                    SkError::ScanFailed { message, .. } => SkError::ScanFailed {
                        context: format!("{} ({})", current.path, current.entry.id),
                        message,
                    },
                    other => other,
                }));
            }
        };

        let projection = self.options.projection;
        let mut subdirs = Vec::new();
        let mut files = Vec::new();

        for raw in &raw_entries {
            if raw.is_dot() && !self.options.include_dots {
                continue;
            }
            for (entry, pushable) in self.fan_out(raw) {
                let item = WalkItem::project(&entry.name, &entry, projection);
                if !entry.is_dir() {
                    files.push(item);
                    continue;
                }
                subdirs.push(item);

                if pushable
                    && entry.alloc.is_allocated()
                    && !current.ancestors.contains(&entry.id.inode)
                {
                    let path = join_path(&current.path, &entry.name);
                    let mut ancestors = current.ancestors.clone();
                    ancestors.push(entry.id.inode);
                    self.stack.push(PendingDir {
                        entry,
                        path,
                        ancestors,
                    });
                }
            }
        }

        Some(Ok(WalkStep {
            dir: WalkItem::project(&current.path, &current.entry, projection),
            subdirs,
            files,
        }))
    }

    /// The entries one directory scan result stands for, each flagged with
    /// whether it may be descended into
    fn fan_out(&self, raw: &RawDirEntry) -> Vec<(DirEntry, bool)> {
        let record = match &raw.record {
            Some(record) if self.image.supports_multi_stream() => record,
            _ => return vec![(DirEntry::from_raw(raw), !raw.is_dot())],
        };

        let mut entries = Vec::new();
        let mut qualified = false;

        for attr in record.attrs.iter().filter(|a| a.in_use) {
            if attr.is_data() {
                qualified = true;
                // a directory's data stream is listed as a file
                entries.push((DirEntry::for_stream(raw, attr, EntryType::File), false));
            } else if attr.is_index_root() {
                qualified = true;
                let pushable = !raw.is_dot() && attr.has_default_name();
                entries.push((DirEntry::for_stream(raw, attr, raw.entry_type), pushable));
            }
        }

        if !qualified {
            entries.push((DirEntry::from_raw(raw), !raw.is_dot()));
        }
        entries
    }
}

impl Iterator for DirectoryWalker<'_> {
    type Item = Result<WalkStep>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_step()
    }
}

/// `"/"` for the root, otherwise `/seg/seg`
fn normalize(path: &str) -> String {
    if is_root_path(path) {
        return "/".to_string();
    }
    split_path(path).fold(String::new(), |acc, segment| format!("{}/{}", acc, segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::{MemoryFilesystem, Storage};
    use crate::options::AllocFilter;

    fn names(items: &[WalkItem]) -> Vec<&str> {
        items.iter().filter_map(|i| i.name.as_deref()).collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("//"), "/");
        assert_eq!(normalize("a//b/"), "/a/b");
    }

    #[test]
    fn test_single_directory_step() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        fs.add_dir(root, "dir1");
        fs.add_file(root, "a.txt", b"0123456789", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        let mut walker = image.walk("/", WalkOptions::default()).unwrap();
        let step = walker.next().unwrap().unwrap();
        assert_eq!(step.dir.name.as_deref(), Some("/"));
        assert_eq!(names(&step.subdirs), vec!["dir1"]);
        assert_eq!(names(&step.files), vec!["a.txt"]);
        assert_eq!(walker.pending(), 1);

        let step = walker.next().unwrap().unwrap();
        assert_eq!(step.dir.name.as_deref(), Some("/dir1"));
        assert!(step.subdirs.is_empty() && step.files.is_empty());
        assert!(walker.next().is_none());
        assert!(walker.next().is_none());
        assert!(walker.is_exhausted());
    }

    #[test]
    fn test_walk_rejects_files_and_bad_filters() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        fs.add_file(root, "f", b"x", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        assert!(matches!(
            image.walk("/f", WalkOptions::default()),
            Err(SkError::TypeMismatch(_))
        ));
        let options = WalkOptions {
            filter: AllocFilter::new(false, false),
            ..WalkOptions::default()
        };
        assert!(matches!(image.walk("/", options), Err(SkError::Parse(_))));
        assert!(image.walk("/missing", WalkOptions::default()).is_err());
    }

    #[test]
    fn test_walk_from_identifier() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        let dir = fs.add_dir(root, "d");
        fs.add_file(dir, "f", b"x", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        let options = WalkOptions {
            projection: Projection::Both,
            ..WalkOptions::default()
        };
        let mut walker = image.walk(StreamIdentifier::inode(dir), options).unwrap();
        let step = walker.next().unwrap().unwrap();
        assert_eq!(step.dir.name.as_deref(), Some("/d"));
        assert_eq!(step.dir.id, Some(StreamIdentifier::inode(dir)));
        assert!(step.files[0].id.is_some());
    }

    #[test]
    fn test_ads_fan_out() {
        let mut fs = MemoryFilesystem::new(512).with_multi_stream(true);
        let root = fs.root();
        let file = fs.add_file(root, "report.doc", b"body", Storage::Resident);
        fs.add_stream(file, "Zone.Identifier", b"[ZoneTransfer]", Storage::Resident);
        let dir = fs.add_dir(root, "docs");
        fs.add_stream(dir, "meta", b"m", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        let options = WalkOptions {
            projection: Projection::Both,
            ..WalkOptions::default()
        };
        let mut walker = image.walk("/", options).unwrap();
        let step = walker.next().unwrap().unwrap();

        assert_eq!(
            names(&step.files),
            vec!["report.doc", "report.doc:Zone.Identifier", "docs:meta"]
        );
        assert_eq!(names(&step.subdirs), vec!["docs"]);
        assert_eq!(step.subdirs[0].id.unwrap().stream_type, 0x90);

        let ids: Vec<StreamIdentifier> = step.files.iter().map(|f| f.id.unwrap()).collect();
        assert_eq!(ids[0].inode, ids[1].inode);
        assert_ne!(ids[0].stream_id, ids[1].stream_id);

        // only the directory itself is descended into
        assert_eq!(walker.pending(), 1);
    }

    #[test]
    fn test_dot_streams_on_request() {
        let mut fs = MemoryFilesystem::new(512).with_multi_stream(true);
        let root = fs.root();
        fs.add_file(root, "f", b"x", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        let options = WalkOptions {
            include_dots: true,
            ..WalkOptions::default()
        };
        let mut walker = image.walk("/", options).unwrap();
        let step = walker.next().unwrap().unwrap();
        assert_eq!(names(&step.subdirs), vec![".", ".."]);
        assert_eq!(names(&step.files), vec!["f"]);
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_projection_neither() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        fs.add_file(root, "f", b"x", Storage::Resident);
        let image = ImageHandle::from_filesystem(fs);

        let options = WalkOptions {
            projection: Projection::Neither,
            ..WalkOptions::default()
        };
        let step = image.walk("/", options).unwrap().next().unwrap().unwrap();
        assert_eq!(step.files.len(), 1);
        assert_eq!(step.files[0].name, None);
        assert_eq!(step.files[0].id, None);
        assert_eq!(step.dir.name, None);
    }

    #[test]
    fn test_directory_loop_terminates() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        let a = fs.add_dir(root, "a");
        let b = fs.add_dir(a, "b");
        fs.link(b, "back", a);
        let image = ImageHandle::from_filesystem(fs);

        let steps: Vec<WalkStep> = image
            .walk("/", WalkOptions::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let dirs: Vec<&str> = steps.iter().filter_map(|s| s.dir.name.as_deref()).collect();
        assert_eq!(dirs, vec!["/", "/a", "/a/b"]);
        assert_eq!(names(&steps[2].subdirs), vec!["back"]);
    }

    #[test]
    fn test_aliased_directory_walked_under_each_name() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        let a = fs.add_dir(root, "a");
        fs.add_file(a, "x", b"x", Storage::Resident);
        fs.link(root, "b", a);
        let image = ImageHandle::from_filesystem(fs);

        let steps: Vec<WalkStep> = image
            .walk("/", WalkOptions::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let mut dirs: Vec<&str> = steps.iter().filter_map(|s| s.dir.name.as_deref()).collect();
        dirs.sort_unstable();
        assert_eq!(dirs, vec!["/", "/a", "/b"]);
        for step in &steps[1..] {
            assert_eq!(names(&step.files), vec!["x"]);
        }
    }

    #[test]
    fn test_failed_directory_is_skipped() {
        let mut fs = MemoryFilesystem::new(512);
        let root = fs.root();
        let bad = fs.add_dir(root, "bad");
        fs.add_file(bad, "lost", b"x", Storage::Resident);
        let good = fs.add_dir(root, "good");
        fs.add_file(good, "kept", b"y", Storage::Resident);
        fs.fail_directory(bad);
        let image = ImageHandle::from_filesystem(fs);

        let mut walker = image.walk("/", WalkOptions::default()).unwrap();
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for step in &mut walker {
            match step {
                Ok(step) => ok.push(step.dir.name.unwrap()),
                Err(err) => failed.push(err.to_string()),
            }
        }
        assert_eq!(ok, vec!["/", "/good"]);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("/bad"));
        assert_eq!(walker.skipped(), &["/bad".to_string()]);
    }
}
