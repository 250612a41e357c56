//! Streaming tar archive writer.
//!
//! A compression stage wraps a tar builder and both write straight into the
//! destination as the source tree is walked. Nothing is staged on disk and
//! file contents are streamed, so memory use does not depend on the size of
//! the tree.

use crate::config::{CompressionKind, Config};
use crate::fs::{walk_entries, ArchiveEntry, EntryKind, WalkOptions};
use crate::transfer::PipeWriter;
use crate::utils::errors::{BackupError, Result};
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Builder, Header, HeaderMode};
use tracing::error;

/// How the archive is produced
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub compression: CompressionKind,
    pub level: i32,
    pub exclude_patterns: Vec<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Gzip,
            level: 6,
            exclude_patterns: Vec::new(),
        }
    }
}

impl ArchiveOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            compression: config.upload.compression,
            level: config.upload.compression_level,
            exclude_patterns: config.source.exclude.clone(),
        }
    }
}

/// What went into an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub special: u64,
    /// Sockets found and left out
    pub skipped: u64,
    /// Sum of regular file sizes, before compression
    pub payload_bytes: u64,
}

impl ArchiveStats {
    /// Number of entries written to the archive
    pub fn entries(&self) -> u64 {
        self.files + self.directories + self.symlinks + self.special
    }

    fn record(&mut self, kind: EntryKind, size: u64) {
        match kind {
            EntryKind::File => {
                self.files += 1;
                self.payload_bytes += size;
            }
            EntryKind::Directory => self.directories += 1,
            EntryKind::Symlink => self.symlinks += 1,
            EntryKind::Special => self.special += 1,
            EntryKind::Socket => self.skipped += 1,
        }
    }
}

/// Compression stage in front of the destination
enum Encoder<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(dest: W, kind: CompressionKind, level: i32) -> io::Result<Self> {
        Ok(match kind {
            CompressionKind::Gzip => {
                let level = level.clamp(0, 9) as u32;
                Encoder::Gzip(GzEncoder::new(dest, flate2::Compression::new(level)))
            }
            CompressionKind::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(dest, level)?),
        })
    }

    /// Write the compression trailer and hand back the destination
    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

/// Reads exactly `remaining` bytes; running dry early is an error.
///
/// The header already promised the size, so a file that shrinks between
/// stat and read would otherwise corrupt the archive.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }

        self.remaining -= n as u64;
        Ok(n)
    }
}

fn append_entry<W: Write>(builder: &mut Builder<W>, entry: &ArchiveEntry) -> io::Result<()> {
    let meta = &entry.metadata;

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&meta.raw, HeaderMode::Complete);
    header.set_size(meta.size);

    match meta.kind {
        EntryKind::File => {
            let file = File::open(&entry.path)?;
            let reader = ExactReader {
                inner: file,
                remaining: meta.size,
            };
            builder.append_data(&mut header, &entry.archive_name, reader)
        }
        EntryKind::Symlink => {
            let target = std::fs::read_link(&entry.path)?;
            builder.append_link(&mut header, &entry.archive_name, target)
        }
        EntryKind::Directory | EntryKind::Special => {
            builder.append_data(&mut header, &entry.archive_name, io::empty())
        }
        EntryKind::Socket => Ok(()),
    }
}

/// Archive everything below `source` into `dest`.
///
/// On success the tar end-of-archive marker and the compression trailer
/// have both been written. On error, `dest` holds valid archive data up to
/// the failing entry.
pub fn write_archive<W: Write>(
    source: &Path,
    dest: W,
    options: &ArchiveOptions,
) -> Result<ArchiveStats> {
    let encoder = Encoder::new(dest, options.compression, options.level)
        .map_err(|e| BackupError::archive(source, e))?;
    let mut builder = Builder::new(encoder);
    let mut stats = ArchiveStats::default();

    let walk_options = WalkOptions {
        exclude_patterns: options.exclude_patterns.clone(),
    };
    walk_entries(source, &walk_options, |entry| {
        append_entry(&mut builder, &entry)?;
        stats.record(entry.metadata.kind, entry.metadata.size);
        Ok(())
    })?;

    let encoder = builder
        .into_inner()
        .map_err(|e| BackupError::archive(source, e))?;
    let mut dest = encoder
        .finish()
        .map_err(|e| BackupError::archive(source, e))?;
    dest.flush().map_err(|e| BackupError::archive(source, e))?;

    Ok(stats)
}

/// Archive `source` into the writer half of a pipe and close it.
///
/// The pipe is closed on every path: cleanly on success, with the error
/// otherwise, so the reading side never waits on a dead producer.
pub fn archive_into_pipe(
    source: &Path,
    mut writer: PipeWriter,
    options: &ArchiveOptions,
) -> Result<ArchiveStats> {
    match write_archive(source, &mut writer, options) {
        Ok(stats) => {
            writer
                .close()
                .map_err(|e| BackupError::archive(source, e))?;
            Ok(stats)
        }
        Err(e) => {
            error!(
                source = %source.display(),
                kind = e.kind(),
                "Failed to create archive: {}",
                e
            );
            let io_kind = match &e {
                BackupError::Archive { source, .. } => source.kind(),
                _ => io::ErrorKind::Other,
            };
            writer.close_with_error(io::Error::new(io_kind, e.to_string()));
            Err(e)
        }
    }
}
