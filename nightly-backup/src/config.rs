//! Configuration management for the backup daemon.
//!
//! Loads configuration from TOML file with environment variable overrides
//! for the source directory, endpoint, bucket and credentials.

use crate::utils::errors::{BackupError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix of every environment variable that overrides a config value.
pub const ENV_PREFIX: &str = "NIGHTLY_BACKUP_";

/// Smallest multipart part S3 accepts (all but the last part)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory tree to back up
    pub dir: PathBuf,

    /// File-name substrings to leave out of the archive
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// S3-compatible HTTP endpoint
    #[default]
    S3,
    /// Directory on the local filesystem
    Local,
}

/// How the bucket appears in S3 request URLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStyle {
    /// `https://endpoint/bucket/key`
    #[default]
    Path,
    /// `https://bucket.endpoint/key`
    Virtual,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    /// Endpoint URL (s3 only)
    #[serde(default)]
    pub endpoint: String,

    /// Signing region (s3 only)
    #[serde(default = "default_region")]
    pub region: String,

    /// Bucket addressing (s3 only)
    #[serde(default)]
    pub url_style: UrlStyle,

    /// Bytes per multipart upload part (s3 only, at least 5 MiB)
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub access_secret: String,

    pub bucket: String,

    /// Root directory holding bucket directories (local only)
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Expire uploaded archives after this many days (lifecycle rule)
    #[serde(default)]
    pub expiration_days: Option<u32>,
}

// Hand-written so credentials never end up in logs.
impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("url_style", &self.url_style)
            .field("part_size", &self.part_size)
            .field("access_key", &self.access_key)
            .field("access_secret", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("root", &self.root)
            .field("expiration_days", &self.expiration_days)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Skip a trigger while the previous run is still in flight
    #[default]
    Skip,
    /// Start a new run even if the previous one has not finished
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local hour of the daily trigger (0-23)
    #[serde(default = "default_trigger_hour")]
    pub trigger_hour: u32,

    /// Minute of the daily trigger (0-59)
    #[serde(default)]
    pub trigger_minute: u32,

    #[serde(default)]
    pub overlap: OverlapPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// chrono format string applied to the trigger time
    #[serde(default = "default_key_time_format")]
    pub key_time_format: String,

    #[serde(default = "default_key_suffix")]
    pub key_suffix: String,

    #[serde(default)]
    pub compression: CompressionKind,

    /// Compression level (0-9 for gzip, 1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Bytes per chunk handed from the archiver to the uploader
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks buffered between archiver and uploader
    #[serde(default = "default_pipe_depth")]
    pub pipe_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    File,
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file, appended to (output = "file")
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Messages buffered before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

// Default values
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_part_size() -> usize {
    crate::storage::s3::DEFAULT_PART_SIZE
}

fn default_trigger_hour() -> u32 {
    1
}

fn default_key_prefix() -> String {
    "backups/docker_".to_string()
}

fn default_key_time_format() -> String {
    "%Y%m%d_%H%M%S".to_string()
}

fn default_key_suffix() -> String {
    ".tar.gz".to_string()
}

fn default_compression_level() -> i32 {
    6
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

fn default_pipe_depth() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./logs/backup.log")
}

fn default_queue_capacity() -> usize {
    100
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            trigger_hour: default_trigger_hour(),
            trigger_minute: 0,
            overlap: OverlapPolicy::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            key_time_format: default_key_time_format(),
            key_suffix: default_key_suffix(),
            compression: CompressionKind::default(),
            compression_level: default_compression_level(),
            chunk_size: default_chunk_size(),
            pipe_depth: default_pipe_depth(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: LogOutput::default(),
            file: default_log_file(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ScheduleConfig {
    /// The daily trigger as a wall-clock time
    pub fn trigger_time(&self) -> Result<NaiveTime> {
        NaiveTime::from_hms_opt(self.trigger_hour, self.trigger_minute, 0).ok_or_else(|| {
            BackupError::Config(format!(
                "invalid trigger time {:02}:{:02}",
                self.trigger_hour, self.trigger_minute
            ))
        })
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overwrite values for which `lookup` returns a value.
    ///
    /// `lookup` receives the full variable name, e.g. `NIGHTLY_BACKUP_BUCKET`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(dir) = var("SOURCE_DIR") {
            self.source.dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = var("ENDPOINT") {
            self.storage.endpoint = endpoint;
        }
        if let Some(key) = var("ACCESS_KEY") {
            self.storage.access_key = key;
        }
        if let Some(secret) = var("ACCESS_SECRET") {
            self.storage.access_secret = secret;
        }
        if let Some(bucket) = var("BUCKET") {
            self.storage.bucket = bucket;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.dir.as_os_str().is_empty() {
            return Err(BackupError::Config("source.dir must be set".into()));
        }
        if self.storage.bucket.is_empty() {
            return Err(BackupError::Config("storage.bucket must be set".into()));
        }
        if self.storage.kind == StorageKind::Local && self.storage.root.is_none() {
            return Err(BackupError::Config(
                "storage.root must be set for local storage".into(),
            ));
        }
        if self.storage.kind == StorageKind::S3 && self.storage.part_size < MIN_PART_SIZE {
            return Err(BackupError::Config(format!(
                "storage.part_size must be at least {} bytes",
                MIN_PART_SIZE
            )));
        }
        self.schedule.trigger_time()?;
        if self.upload.key_time_format.is_empty()
            || StrftimeItems::new(&self.upload.key_time_format).any(|i| matches!(i, Item::Error))
        {
            return Err(BackupError::Config(format!(
                "upload.key_time_format {:?} is not a valid time format",
                self.upload.key_time_format
            )));
        }
        if self.upload.chunk_size == 0 || self.upload.pipe_depth == 0 {
            return Err(BackupError::Config(
                "upload.chunk_size and upload.pipe_depth must be positive".into(),
            ));
        }
        if self.log.queue_capacity == 0 {
            return Err(BackupError::Config(
                "log.queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[source]
dir = "/app/docker"

[storage]
endpoint = "https://oss.example.com"
bucket = "backups"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.storage.kind, StorageKind::S3);
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.storage.url_style, UrlStyle::Path);
        assert_eq!(config.storage.part_size, 8 * 1024 * 1024);
        assert_eq!(config.schedule.trigger_hour, 1);
        assert_eq!(config.schedule.overlap, OverlapPolicy::Skip);
        assert_eq!(config.upload.key_prefix, "backups/docker_");
        assert_eq!(config.upload.key_suffix, ".tar.gz");
        assert_eq!(config.upload.compression, CompressionKind::Gzip);
        assert_eq!(config.log.output, LogOutput::File);
        assert_eq!(config.log.queue_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        let env: HashMap<String, String> = [
            ("NIGHTLY_BACKUP_ACCESS_KEY", "AKID"),
            ("NIGHTLY_BACKUP_ACCESS_SECRET", "s3cr3t"),
            ("NIGHTLY_BACKUP_BUCKET", "other"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_overrides(|name| env.get(name).cloned());

        assert_eq!(config.storage.access_key, "AKID");
        assert_eq!(config.storage.access_secret, "s3cr3t");
        assert_eq!(config.storage.bucket, "other");
        assert_eq!(config.source.dir, PathBuf::from("/app/docker"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.storage.access_secret = "hunter2".to_string();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_validate_rejects_bad_trigger_time() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.schedule.trigger_hour = 24;
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));

        config.schedule.trigger_hour = 23;
        config.schedule.trigger_minute = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_local_requires_root() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.storage.kind = StorageKind::Local;
        assert!(config.validate().is_err());

        config.storage.root = Some(PathBuf::from("/var/backups"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_part_size() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.storage.part_size = 1024;
        assert!(config.validate().is_err());

        config.storage.part_size = MIN_PART_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_virtual_url_style() {
        let text = MINIMAL.replace("[storage]", "[storage]\nurl_style = \"virtual\"");
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.storage.url_style, UrlStyle::Virtual);
    }

    #[test]
    fn test_validate_rejects_bad_key_format() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.upload.key_time_format = "%Y%Q".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
[source]
dir = "/srv/data"
exclude = [".cache"]

[storage]
kind = "local"
root = "/var/backups"
bucket = "nightly"

[schedule]
trigger_hour = 3
trigger_minute = 30
overlap = "allow"

[upload]
compression = "zstd"
key_suffix = ".tar.zst"
"#,
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.source.exclude, vec![".cache".to_string()]);
        assert_eq!(config.storage.kind, StorageKind::Local);
        assert_eq!(config.schedule.overlap, OverlapPolicy::Allow);
        assert_eq!(
            config.schedule.trigger_time()?,
            NaiveTime::from_hms_opt(3, 30, 0).unwrap()
        );
        assert_eq!(config.upload.compression, CompressionKind::Zstd);
        Ok(())
    }
}
