#![forbid(unsafe_code)]
//! Error types for e4.
//!
//! # Error Taxonomy
//!
//! e4 uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e4-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `Ext4Error` | `e4-error` (this crate) | Failures of mount, inode reads, block resolution and lookup |
//!
//! `e4-error` does not depend on `e4-types`; each runtime crate converts
//! `ParseError` at its own boundary and attaches the block or inode it was
//! decoding.
//!
//! ## Severity
//!
//! | Variant | Raised by | Effect |
//! |---------|-----------|--------|
//! | `BadSuperblock` | mount | fatal, the image is not mounted |
//! | `InodeRead` | inode resolver | aborts the current resolution |
//! | `BlockUnavailable` | buffer cache / device | aborts the current traversal step |
//! | `ExtentTreeCorrupt` | block resolver | local lookup failure, logged |
//! | `HTreeSearchFailed` | directory lookup | local lookup failure, logged |
//! | `NotFound` | directory lookup | normal "name absent" outcome |
//! | `UnsupportedFeature` | mount / lookup | explicit rejection (GPT, FAT, `..` via HTree) |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`Ext4Error::to_errno`].
//! The match is exhaustive so adding a variant forces an errno decision.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `BadSuperblock` | `EINVAL` |
//! | `InodeRead` | `EIO` |
//! | `BlockUnavailable` | `EIO` |
//! | `ExtentTreeCorrupt` | `EIO` |
//! | `HTreeSearchFailed` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `Parse` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |

use thiserror::Error;

/// Unified error type for e4 operations.
#[derive(Debug, Error)]
pub enum Ext4Error {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock is missing, has the wrong magic, or describes
    /// impossible geometry.
    #[error("bad superblock: {0}")]
    BadSuperblock(String),

    /// The inode number is out of range or its record could not be fetched.
    #[error("cannot read inode {ino}: {detail}")]
    InodeRead { ino: u64, detail: String },

    /// A block could not be supplied by the cache or the device beneath it.
    #[error("block {block} unavailable: {detail}")]
    BlockUnavailable { block: u64, detail: String },

    /// The extent tree of an inode is malformed or has no covering index.
    #[error("extent tree of inode {ino} is corrupt: {detail}")]
    ExtentTreeCorrupt { ino: u64, detail: String },

    /// The hashed directory index of an inode could not be descended.
    #[error("htree search in inode {ino} failed: {detail}")]
    HTreeSearchFailed { ino: u64, detail: String },

    /// On-disk metadata failed to decode at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Parse-layer error surfaced without a better location.
    #[error("parse error: {0}")]
    Parse(String),

    /// A name or path component is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component that must be a directory is not one.
    #[error("not a directory")]
    NotDirectory,

    /// The request is valid but deliberately not handled.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl Ext4Error {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InodeRead { .. }
            | Self::BlockUnavailable { .. }
            | Self::ExtentTreeCorrupt { .. }
            | Self::HTreeSearchFailed { .. }
            | Self::Corruption { .. } => libc::EIO,
            Self::BadSuperblock(_) | Self::Parse(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
        }
    }

    /// `true` for the ordinary "name absent" outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// `true` for failures that are logged and reported as a failed lookup
    /// rather than escalated.
    #[must_use]
    pub fn is_local_lookup_failure(&self) -> bool {
        matches!(
            self,
            Self::ExtentTreeCorrupt { .. } | Self::HTreeSearchFailed { .. } | Self::NotFound(_)
        )
    }
}

/// Result alias using `Ext4Error`.
pub type Result<T> = std::result::Result<T, Ext4Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_exhaustive_and_stable() {
        let cases: Vec<(Ext4Error, libc::c_int)> = vec![
            (Ext4Error::BadSuperblock("magic".into()), libc::EINVAL),
            (
                Ext4Error::InodeRead {
                    ino: 9,
                    detail: "group 4 out of range".into(),
                },
                libc::EIO,
            ),
            (
                Ext4Error::BlockUnavailable {
                    block: 77,
                    detail: "short read".into(),
                },
                libc::EIO,
            ),
            (
                Ext4Error::ExtentTreeCorrupt {
                    ino: 12,
                    detail: "bad magic".into(),
                },
                libc::EIO,
            ),
            (
                Ext4Error::HTreeSearchFailed {
                    ino: 2,
                    detail: "no index".into(),
                },
                libc::EIO,
            ),
            (
                Ext4Error::Corruption {
                    block: 1,
                    detail: "x".into(),
                },
                libc::EIO,
            ),
            (Ext4Error::Parse("x".into()), libc::EINVAL),
            (Ext4Error::NotFound("a".into()), libc::ENOENT),
            (Ext4Error::NotDirectory, libc::ENOTDIR),
            (Ext4Error::UnsupportedFeature("gpt".into()), libc::EOPNOTSUPP),
        ];
        for (err, errno) in cases {
            assert_eq!(err.to_errno(), errno, "{err}");
        }
    }

    #[test]
    fn io_error_keeps_raw_os_code() {
        let err = Ext4Error::from(std::io::Error::from_raw_os_error(libc::ENXIO));
        assert_eq!(err.to_errno(), libc::ENXIO);
        let err = Ext4Error::from(std::io::Error::other("synthetic"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn display_strings() {
        assert_eq!(
            Ext4Error::NotFound("file.txt".into()).to_string(),
            "not found: file.txt"
        );
        assert_eq!(
            Ext4Error::BlockUnavailable {
                block: 5,
                detail: "beyond device".into()
            }
            .to_string(),
            "block 5 unavailable: beyond device"
        );
    }

    #[test]
    fn lookup_failure_classification() {
        assert!(Ext4Error::NotFound("x".into()).is_not_found());
        assert!(
            Ext4Error::HTreeSearchFailed {
                ino: 2,
                detail: String::new()
            }
            .is_local_lookup_failure()
        );
        assert!(!Ext4Error::BadSuperblock(String::new()).is_local_lookup_failure());
    }
}
