//! Filesystem metadata as the archiver sees it.
//!
//! Metadata is read without following symlinks, so a link is archived as a
//! link and never as its target.

use std::fs;
#[cfg(test)]
use std::path::Path;

/// The archive entry type a filesystem node maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Devices and FIFOs: header only
    Special,
    /// Unix sockets have no tar representation
    Socket,
}

impl EntryKind {
    pub fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else if is_socket(&file_type) {
            EntryKind::Socket
        } else {
            EntryKind::Special
        }
    }

    /// Only regular files carry a payload
    pub fn has_payload(self) -> bool {
        self == EntryKind::File
    }
}

#[cfg(unix)]
fn is_socket(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: &fs::FileType) -> bool {
    false
}

/// Metadata for a single node, as recorded in its archive header
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub kind: EntryKind,

    /// Payload size in bytes (0 for anything but regular files)
    pub size: u64,

    /// Raw metadata; mode, owner, mtime and device numbers come from here
    pub raw: fs::Metadata,
}

impl NodeMetadata {
    pub fn from_metadata(metadata: fs::Metadata) -> Self {
        let kind = EntryKind::from_file_type(metadata.file_type());
        Self {
            kind,
            size: if kind.has_payload() { metadata.len() } else { 0 },
            raw: metadata,
        }
    }

    /// Read metadata for `path` without following a final symlink
    #[cfg(test)]
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(fs::symlink_metadata(path)?))
    }
}
