//! POSIX-style metadata projection

use serde::{Deserialize, Serialize};

use crate::fs::common::{InodeRecord, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

const S_IFBLK: u32 = 0o060000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

/// File type decoded from a POSIX mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    SymbolicLink,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Socket,
    Unknown,
}

/// The `stat` view of an inode record
///
/// `device` is always 0: objects inside an image belong to no host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedStat {
    pub mode: u32,
    pub inode: u64,
    pub device: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl NormalizedStat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn file_type(&self) -> FileType {
        match self.mode & S_IFMT {
            S_IFREG => FileType::RegularFile,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::SymbolicLink,
            S_IFBLK => FileType::BlockDevice,
            S_IFCHR => FileType::CharacterDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// Permission bits in `ls -l` form, e.g. `-rw-r--r--`
    pub fn mode_string(&self) -> String {
        let kind = match self.file_type() {
            FileType::Directory => 'd',
            FileType::SymbolicLink => 'l',
            FileType::BlockDevice => 'b',
            FileType::CharacterDevice => 'c',
            FileType::Fifo => 'p',
            FileType::Socket => 's',
            FileType::RegularFile | FileType::Unknown => '-',
        };
        let mut text = String::with_capacity(10);
        text.push(kind);
        for shift in [6, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            text.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            text.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            text.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        text
    }
}

impl From<&InodeRecord> for NormalizedStat {
    fn from(record: &InodeRecord) -> Self {
        Self {
            mode: record.mode,
            inode: record.addr,
            device: 0,
            nlink: record.nlink,
            uid: record.uid,
            gid: record.gid,
            size: record.size,
            atime: record.atime,
            mtime: record.mtime,
            ctime: record.ctime,
        }
    }
}
