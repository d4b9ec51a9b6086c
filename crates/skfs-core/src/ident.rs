//! Stream identifiers and path segments
//!
//! A [`StreamIdentifier`] names one data stream of one on-disk object:
//! the inode address plus the attribute type and id of the stream. On
//! filesystems with a single stream per object the type and id are both 0.
//!
//! The canonical text form is `<inode>-<type>-<id>`. When parsing, the
//! trailing `-type-id` may be omitted and defaults to zero.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SkError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamIdentifier {
    pub inode: u64,
    pub stream_type: u32,
    pub stream_id: u32,
}

impl StreamIdentifier {
    pub fn new(inode: u64, stream_type: u32, stream_id: u32) -> Self {
        Self {
            inode,
            stream_type,
            stream_id,
        }
    }

    /// Identifier of the default (unnamed) stream of an inode
    pub fn inode(inode: u64) -> Self {
        Self::new(inode, 0, 0)
    }

    pub fn is_default_stream(&self) -> bool {
        self.stream_type == 0 && self.stream_id == 0
    }
}

impl From<u64> for StreamIdentifier {
    fn from(inode: u64) -> Self {
        Self::inode(inode)
    }
}

impl fmt::Display for StreamIdentifier {
    /// `{}` prints the full triple, `{:#}` drops a `-0-0` suffix
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() && self.is_default_stream() {
            write!(f, "{}", self.inode)
        } else {
            write!(f, "{}-{}-{}", self.inode, self.stream_type, self.stream_id)
        }
    }
}

impl FromStr for StreamIdentifier {
    type Err = SkError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let mut parts = text.split('-');

        // split always yields at least one item
        let inode_token = parts.next().unwrap_or_default();
        let inode = inode_token
            .parse::<u64>()
            .map_err(|_| bad_token(text, inode_token, "inode"))?;

        let stream_type = match parts.next() {
            Some(token) => token
                .parse::<u32>()
                .map_err(|_| bad_token(text, token, "stream type"))?,
            None => 0,
        };

        let stream_id = match parts.next() {
            Some(token) => token
                .parse::<u32>()
                .map_err(|_| bad_token(text, token, "stream id"))?,
            None => 0,
        };

        if let Some(extra) = parts.next() {
            return Err(SkError::Parse(format!(
                "identifier {:?} has an unexpected trailing component {:?}",
                text, extra
            )));
        }

        Ok(Self::new(inode, stream_type, stream_id))
    }
}

fn bad_token(text: &str, token: &str, what: &str) -> SkError {
    SkError::Parse(format!(
        "identifier {:?}: {} component {:?} is not an unsigned integer \
         (expected \"inode[-type-id]\")",
        text, what, token
    ))
}

/// Split a slash separated path into its non-empty segments
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// True for the paths that name the root directory without a scan
pub fn is_root_path(path: &str) -> bool {
    split_path(path).next().is_none()
}

/// Join a child name onto a parent directory path
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Split a `name:stream` segment into its object name and stream name
pub fn split_stream_suffix(segment: &str) -> Option<(&str, &str)> {
    let (name, stream) = segment.rsplit_once(':')?;
    if name.is_empty() || stream.is_empty() {
        return None;
    }
    Some((name, stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_triple() {
        let id: StreamIdentifier = "1234-128-3".parse().unwrap();
        assert_eq!(id, StreamIdentifier::new(1234, 128, 3));
    }

    #[test]
    fn test_parse_partial() {
        assert_eq!(
            "42".parse::<StreamIdentifier>().unwrap(),
            StreamIdentifier::new(42, 0, 0)
        );
        assert_eq!(
            "42-128".parse::<StreamIdentifier>().unwrap(),
            StreamIdentifier::new(42, 128, 0)
        );
        assert_eq!(
            " 7-0-0 ".parse::<StreamIdentifier>().unwrap(),
            StreamIdentifier::inode(7)
        );
    }

    #[test]
    fn test_parse_rejects_malformed_components() {
        let err = "abc".parse::<StreamIdentifier>().unwrap_err();
        assert!(matches!(err, SkError::Parse(ref m) if m.contains("\"abc\"")));

        let err = "12-x-3".parse::<StreamIdentifier>().unwrap_err();
        assert!(matches!(err, SkError::Parse(ref m) if m.contains("\"x\"")));

        assert!("12-".parse::<StreamIdentifier>().is_err());
        assert!("".parse::<StreamIdentifier>().is_err());
        assert!("-1".parse::<StreamIdentifier>().is_err());
        assert!("1-2-3-4".parse::<StreamIdentifier>().is_err());
        assert!("1-99999999999".parse::<StreamIdentifier>().is_err());
    }

    #[test]
    fn test_round_trip() {
        let samples = [
            StreamIdentifier::new(0, 0, 0),
            StreamIdentifier::new(5, 0, 0),
            StreamIdentifier::new(64, 128, 1),
            StreamIdentifier::new(u64::MAX, u32::MAX, u32::MAX),
            StreamIdentifier::new(9, 144, 0),
        ];
        for id in samples {
            assert_eq!(id.to_string().parse::<StreamIdentifier>().unwrap(), id);
            assert_eq!(format!("{:#}", id).parse::<StreamIdentifier>().unwrap(), id);
        }
    }

    #[test]
    fn test_display_forms() {
        let id = StreamIdentifier::inode(33);
        assert_eq!(id.to_string(), "33-0-0");
        assert_eq!(format!("{:#}", id), "33");
        assert_eq!(format!("{:#}", StreamIdentifier::new(33, 128, 4)), "33-128-4");
    }

    #[test]
    fn test_path_helpers() {
        assert!(is_root_path(""));
        assert!(is_root_path("/"));
        assert!(is_root_path("//"));
        assert!(!is_root_path("/a"));

        let segments: Vec<_> = split_path("/a//b/c/").collect();
        assert_eq!(segments, vec!["a", "b", "c"]);

        assert_eq!(join_path("/", "dir1"), "/dir1");
        assert_eq!(join_path("/dir1", "sub"), "/dir1/sub");
    }

    #[test]
    fn test_stream_suffix() {
        assert_eq!(split_stream_suffix("a.txt:alt"), Some(("a.txt", "alt")));
        assert_eq!(split_stream_suffix("a.txt"), None);
        assert_eq!(split_stream_suffix(":alt"), None);
        assert_eq!(split_stream_suffix("a.txt:"), None);
    }
}
