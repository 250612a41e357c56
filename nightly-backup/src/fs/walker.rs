//! Directory traversal feeding the archiver.
//!
//! Entries are handed to a callback one at a time as the walk discovers
//! them; the tree is never collected in memory.

use crate::fs::metadata::{EntryKind, NodeMetadata};
use crate::utils::errors::{BackupError, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// File-name substrings to skip; a skipped directory skips its subtree
    pub exclude_patterns: Vec<String>,
}

/// One filesystem node below the walk root
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Full path to the node
    pub path: PathBuf,

    /// Name inside the archive: relative, `/`-separated, directories end in `/`.
    /// Kept as raw OS bytes so names that are not UTF-8 survive unchanged.
    pub archive_name: PathBuf,

    pub metadata: NodeMetadata,
}

impl ArchiveEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        // Not following links, so this is the link's own metadata
        let metadata = NodeMetadata::from_metadata(entry.metadata()?);
        let relative = path.strip_prefix(root).unwrap_or(&path);

        Ok(Self {
            archive_name: archive_name(relative, metadata.kind),
            path,
            metadata,
        })
    }
}

/// Archive name for a path relative to the walk root.
///
/// Separators are always `/` whatever the host uses.
pub fn archive_name(relative: &Path, kind: EntryKind) -> PathBuf {
    let mut name = OsString::new();
    for part in relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part),
        _ => None,
    }) {
        if !name.is_empty() {
            name.push("/");
        }
        name.push(part);
    }

    if kind == EntryKind::Directory {
        name.push("/");
    }
    PathBuf::from(name)
}

/// Walk every node below `root` (the root itself excluded) in file-name
/// order, calling `callback` for each.
///
/// The first error, from the walk or the callback, stops the walk and is
/// returned as an archive error naming the path involved.
pub fn walk_entries<F>(root: &Path, options: &WalkOptions, mut callback: F) -> Result<()>
where
    F: FnMut(ArchiveEntry) -> std::io::Result<()>,
{
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_exclude(e, &options.exclude_patterns));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            BackupError::archive(path, e.into())
        })?;

        let archive_entry = ArchiveEntry::from_entry(&entry, root)
            .map_err(|e| BackupError::archive(entry.path(), e))?;

        callback(archive_entry).map_err(|e| BackupError::archive(entry.path(), e))?;
    }

    Ok(())
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(entries: &[ArchiveEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.archive_name.to_string_lossy().into_owned())
            .collect()
    }

    fn collect(root: &Path, options: &WalkOptions) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        walk_entries(root, options, |e| {
            entries.push(e);
            Ok(())
        })?;
        Ok(entries)
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_includes_directories_in_order() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::create_dir(temp_dir.path().join("empty"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(
            names(&entries),
            vec!["empty/", "file1.txt", "subdir/", "subdir/file2.txt"]
        );
        assert_eq!(entries[1].metadata.kind, EntryKind::File);
        assert_eq!(entries[1].metadata.size, 8);
        assert_eq!(entries[2].metadata.kind, EntryKind::Directory);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_walk_keeps_symlinks_as_links() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("real"))?;
        fs::write(temp_dir.path().join("real/data.bin"), b"abc")?;
        std::os::unix::fs::symlink("real", temp_dir.path().join("alias"))?;

        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        // The link to a directory is not descended into
        assert_eq!(names(&entries), vec!["alias", "real/", "real/data.bin"]);
        assert_eq!(entries[0].metadata.kind, EntryKind::Symlink);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns_skip_subtrees() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::create_dir(temp_dir.path().join(".cache"))?;
        fs::write(temp_dir.path().join(".cache/blob"), b"skip")?;

        let options = WalkOptions {
            exclude_patterns: vec![".cache".to_string()],
        };
        let entries = collect(temp_dir.path(), &options)?;

        assert_eq!(entries.len(), 1);
        assert_eq!(names(&entries), vec!["file.txt"]);

        Ok(())
    }

    #[test]
    fn test_missing_root_is_archive_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("gone");

        let err = collect(&missing, &WalkOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "ArchiveError");
    }

    #[test]
    fn test_callback_error_stops_walk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"1")?;
        fs::write(temp_dir.path().join("b"), b"2")?;

        let mut seen = 0;
        let result = walk_entries(temp_dir.path(), &WalkOptions::default(), |_| {
            seen += 1;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "stop"))
        });

        assert!(matches!(result, Err(BackupError::Archive { .. })));
        assert_eq!(seen, 1);
        Ok(())
    }

    #[test]
    fn test_archive_name_uses_forward_slashes() {
        let relative: PathBuf = ["a", "b", "c.txt"].iter().collect();
        assert_eq!(
            archive_name(&relative, EntryKind::File).as_os_str(),
            "a/b/c.txt"
        );
        assert_eq!(
            archive_name(Path::new("b"), EntryKind::Directory).as_os_str(),
            "b/"
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_archive_name_keeps_raw_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let relative = Path::new("dir").join(OsStr::from_bytes(b"caf\xe9.txt"));
        let name = archive_name(&relative, EntryKind::File);
        assert_eq!(name.as_os_str().as_bytes(), b"dir/caf\xe9.txt");
    }
}
