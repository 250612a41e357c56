//! Filesystem traversal and metadata for the archiver.

pub mod metadata;
pub mod walker;

pub use metadata::{EntryKind, NodeMetadata};
pub use walker::{walk_entries, ArchiveEntry, WalkOptions};
