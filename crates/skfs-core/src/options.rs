//! Caller-selected options for opening images, listing and walking
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SkError;
use crate::ident::StreamIdentifier;
use crate::FileSystemType;

/// Image container formats
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Plain sector-for-sector copy of a device
    #[default]
    Raw,
}

impl FromStr for ImageFormat {
    type Err = SkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "dd" => Ok(ImageFormat::Raw),
            other => Err(SkError::Parse(format!("unsupported image type {:?}", other))),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
        }
    }
}

/// How an [`crate::ImageHandle`] is opened
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Container format; raw unless told otherwise so autodetection never
    /// guesses a container that isn't there
    pub image_format: ImageFormat,
    /// Force a filesystem type instead of probing superblocks
    pub fs_type: Option<FileSystemType>,
}

/// Which directory entries a scan reports, by allocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocFilter {
    pub allocated: bool,
    pub unallocated: bool,
}

impl AllocFilter {
    pub const ALLOCATED: AllocFilter = AllocFilter {
        allocated: true,
        unallocated: false,
    };

    pub const ALL: AllocFilter = AllocFilter {
        allocated: true,
        unallocated: true,
    };

    pub fn new(allocated: bool, unallocated: bool) -> Self {
        Self {
            allocated,
            unallocated,
        }
    }

    pub fn accepts(&self, allocated: bool) -> bool {
        if allocated {
            self.allocated
        } else {
            self.unallocated
        }
    }

    /// At least one allocation state must be selected
    pub fn validate(&self) -> Result<(), SkError> {
        if !self.allocated && !self.unallocated {
            return Err(SkError::Parse(
                "at least one of allocated or unallocated entries must be requested".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AllocFilter {
    fn default() -> Self {
        Self::ALLOCATED
    }
}

/// What each walker entry carries
///
/// `Neither` is accepted and produces empty placeholder entries; callers
/// almost always want `Names`, `Identifiers` or `Both`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    #[default]
    Names,
    Identifiers,
    Both,
    Neither,
}

impl Projection {
    pub fn from_flags(names: bool, identifiers: bool) -> Self {
        match (names, identifiers) {
            (true, true) => Projection::Both,
            (true, false) => Projection::Names,
            (false, true) => Projection::Identifiers,
            (false, false) => Projection::Neither,
        }
    }

    pub fn wants_names(&self) -> bool {
        matches!(self, Projection::Names | Projection::Both)
    }

    pub fn wants_identifiers(&self) -> bool {
        matches!(self, Projection::Identifiers | Projection::Both)
    }
}

/// Directory walker configuration
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub filter: AllocFilter,
    pub projection: Projection,
    /// Report `.`/`..` streams on multi-stream filesystems
    pub include_dots: bool,
}

/// The object an operation applies to: a path or an identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Path(String),
    Id(StreamIdentifier),
}

impl Target {
    /// Build a target from optional arguments; the path wins when both are given
    pub fn from_options(
        path: Option<&str>,
        id: Option<StreamIdentifier>,
    ) -> Result<Self, SkError> {
        match (path, id) {
            (Some(path), _) => Ok(Target::Path(path.to_string())),
            (None, Some(id)) => Ok(Target::Id(id)),
            (None, None) => Err(SkError::Parse(
                "One of path or inode must be specified".to_string(),
            )),
        }
    }
}

impl From<&str> for Target {
    fn from(path: &str) -> Self {
        Target::Path(path.to_string())
    }
}

impl From<StreamIdentifier> for Target {
    fn from(id: StreamIdentifier) -> Self {
        Target::Id(id)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(path) => write!(f, "{}", path),
            Target::Id(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_filter() {
        assert!(AllocFilter::default().accepts(true));
        assert!(!AllocFilter::default().accepts(false));
        assert!(AllocFilter::ALL.accepts(false));
        assert!(AllocFilter::new(false, false).validate().is_err());
        assert!(AllocFilter::new(false, true).validate().is_ok());
    }

    #[test]
    fn test_projection_flags() {
        assert_eq!(Projection::from_flags(true, false), Projection::Names);
        assert_eq!(Projection::from_flags(true, true), Projection::Both);
        assert_eq!(Projection::from_flags(false, false), Projection::Neither);
        assert!(Projection::Both.wants_names());
        assert!(!Projection::Identifiers.wants_names());
    }

    #[test]
    fn test_target_from_options() {
        assert!(matches!(
            Target::from_options(None, None),
            Err(SkError::Parse(_))
        ));
        assert_eq!(
            Target::from_options(Some("/a"), Some(StreamIdentifier::inode(3))).unwrap(),
            Target::Path("/a".into())
        );
        assert_eq!(
            Target::from_options(None, Some(StreamIdentifier::inode(3))).unwrap(),
            Target::Id(StreamIdentifier::inode(3))
        );
    }

    #[test]
    fn test_image_format_parse() {
        assert_eq!("RAW".parse::<ImageFormat>().unwrap(), ImageFormat::Raw);
        assert!("ewf".parse::<ImageFormat>().is_err());
    }
}
