//! Bulk scan for inodes no directory entry points at

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkError};
use crate::fs::common::MetaFilter;
use crate::handle::ImageHandle;
use crate::ident::StreamIdentifier;

/// An inode found by [`ImageHandle::scan_unlinked`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkedInode {
    pub id: StreamIdentifier,
    /// Whether the inode's metadata is still marked in use
    pub allocated: bool,
}

impl ImageHandle {
    /// Every unlinked inode in the filesystem's inode range
    ///
    /// On multi-stream filesystems each in-use data stream is reported
    /// separately; elsewhere each inode appears once with the zero stream.
    pub fn scan_unlinked(&self) -> Result<Vec<UnlinkedInode>> {
        let records = self
            .fs()
            .inode_scan(self.first_inum(), self.last_inum(), MetaFilter::UNLINKED)
            .map_err(|e| {
                SkError::scan(
                    format!(
                        "unlinked inode scan {}-{}",
                        self.first_inum(),
                        self.last_inum()
                    ),
                    e,
                )
            })?;

        let mut found = Vec::with_capacity(records.len());
        for record in &records {
            if self.supports_multi_stream() {
                found.extend(record.data_streams().map(|attr| UnlinkedInode {
                    id: StreamIdentifier::new(record.addr, attr.attr_type, attr.id),
                    allocated: record.allocated,
                }));
            } else {
                found.push(UnlinkedInode {
                    id: StreamIdentifier::inode(record.addr),
                    allocated: record.allocated,
                });
            }
        }

        tracing::info!(
            "Unlinked scan: {} inodes, {} entries",
            records.len(),
            found.len()
        );
        Ok(found)
    }
}
