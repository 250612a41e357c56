//! Backup job executor - runs one archive-and-upload.
//!
//! The archiver runs on a blocking thread and writes into one end of a pipe;
//! the other end is the body of the storage upload. Compression and network
//! transfer overlap, and memory use is bounded by the pipe.

use crate::archive::{archive_into_pipe, ArchiveOptions, ArchiveStats};
use crate::config::{Config, UploadConfig};
use crate::storage::{ByteStream, LifecycleRule, StoreConnector};
use crate::transfer::{pipe, ProgressStream};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// One scheduled backup
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub source_dir: PathBuf,
    pub trigger_time: DateTime<Local>,
    pub destination_key: String,
}

impl BackupJob {
    /// Build the job for `trigger_time`; the key is prefix + formatted time + suffix
    pub fn new(
        source_dir: PathBuf,
        trigger_time: DateTime<Local>,
        upload: &UploadConfig,
    ) -> Result<Self> {
        let mut destination_key = upload.key_prefix.clone();
        write!(
            destination_key,
            "{}",
            trigger_time.format(&upload.key_time_format)
        )
        .map_err(|_| {
            BackupError::Config(format!(
                "invalid key time format {:?}",
                upload.key_time_format
            ))
        })?;
        destination_key.push_str(&upload.key_suffix);

        Ok(Self {
            source_dir,
            trigger_time,
            destination_key,
        })
    }
}

/// Backup execution result
#[derive(Debug)]
pub struct BackupResult {
    pub key: String,
    pub archive: ArchiveStats,
    /// Compressed bytes handed to the storage client
    pub uploaded_bytes: u64,
    pub duration: Duration,
}

/// Runs backup jobs against one bucket
pub struct BackupExecutor {
    connector: Arc<dyn StoreConnector>,
    bucket: String,
    source_dir: PathBuf,
    upload: UploadConfig,
    options: ArchiveOptions,
}

impl BackupExecutor {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        bucket: impl Into<String>,
        source_dir: PathBuf,
        upload: UploadConfig,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            connector,
            bucket: bucket.into(),
            source_dir,
            upload,
            options,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(config.storage.clone()),
            config.storage.bucket.clone(),
            config.source.dir.clone(),
            config.upload.clone(),
            ArchiveOptions::from_config(config),
        )
    }

    /// Job backing up the configured source for `trigger_time`
    pub fn job_for(&self, trigger_time: DateTime<Local>) -> Result<BackupJob> {
        BackupJob::new(self.source_dir.clone(), trigger_time, &self.upload)
    }

    /// Execute a backup job, logging the outcome under the job's key
    pub async fn execute(&self, job: &BackupJob) -> Result<BackupResult> {
        info!(
            "Starting backup of {} to {}/{}",
            job.source_dir.display(),
            self.bucket,
            job.destination_key
        );

        match self.run(job).await {
            Ok(result) => {
                info!(
                    key = %result.key,
                    "Backup completed: {} entries, {} bytes archived, {} bytes uploaded in {:.1}s",
                    result.archive.entries(),
                    result.archive.payload_bytes,
                    result.uploaded_bytes,
                    result.duration.as_secs_f64()
                );
                if result.archive.skipped > 0 {
                    warn!(
                        key = %result.key,
                        "{} sockets were left out of the archive",
                        result.archive.skipped
                    );
                }
                Ok(result)
            }
            Err(e) => {
                error!(
                    key = %job.destination_key,
                    kind = e.kind(),
                    "Backup failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn run(&self, job: &BackupJob) -> Result<BackupResult> {
        let started = Instant::now();

        // Nothing is archived unless the destination is reachable
        let store = self.connector.connect()?;
        let bucket = store.open_bucket(&self.bucket).await?;

        let (writer, reader) = pipe(self.upload.chunk_size, self.upload.pipe_depth);

        let source = job.source_dir.clone();
        let options = self.options.clone();
        let archiver =
            tokio::task::spawn_blocking(move || archive_into_pipe(&source, writer, &options));

        let uploaded = Arc::new(AtomicU64::new(0));
        let body: ByteStream = Box::pin(ProgressStream::new(
            reader,
            job.destination_key.clone(),
            Arc::clone(&uploaded),
        ));
        // Returning drops the body, which unblocks an archiver still writing
        let upload_result = bucket.put_object(&job.destination_key, body).await;

        let archive_result = match archiver.await {
            Ok(result) => result,
            Err(e) => Err(BackupError::archive(
                &job.source_dir,
                io::Error::new(io::ErrorKind::Other, format!("archiver task failed: {}", e)),
            )),
        };

        let archive = settle(archive_result, upload_result)?;

        Ok(BackupResult {
            key: job.destination_key.clone(),
            archive,
            uploaded_bytes: uploaded.load(Ordering::Relaxed),
            duration: started.elapsed(),
        })
    }

    /// Install the expiration rule for uploaded archives on the bucket
    pub async fn apply_lifecycle(&self, expiration_days: u32) -> Result<()> {
        let rule = LifecycleRule::for_key_prefix(&self.upload.key_prefix, expiration_days);
        let store = self.connector.connect()?;
        let bucket = store.open_bucket(&self.bucket).await?;
        bucket.put_lifecycle(&rule).await?;

        info!(
            "Lifecycle rule applied to {}: objects under {:?} expire after {} days",
            bucket.name(),
            rule.prefix,
            rule.expiration_days
        );
        Ok(())
    }
}

/// Pick the error to report when archiving and uploading ran together.
///
/// A failed archiver is the root cause of whatever the upload saw, except
/// when the archiver only failed because the upload stopped reading.
fn settle(archive: Result<ArchiveStats>, upload: Result<()>) -> Result<ArchiveStats> {
    match (archive, upload) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Err(a), Err(u)) if is_broken_pipe(&a) => Err(u),
        (Err(a), _) => Err(a),
        (Ok(_), Err(u)) => Err(u),
    }
}

fn is_broken_pipe(err: &BackupError) -> bool {
    matches!(
        err,
        BackupError::Archive { source, .. } if source.kind() == io::ErrorKind::BrokenPipe
    )
}
