//! Logging configuration using tracing, drained through an async sink.
//!
//! Every formatted event becomes one message on a bounded channel. A single
//! consumer task writes messages to the destination in arrival order, so a
//! slow disk never stalls the code that logs. When the channel is full the
//! message is dropped and counted; the consumer reports the count the next
//! time it writes.

use crate::config::{LogConfig, LogOutput};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Producer side of the log sink. Cheap to clone, never blocks.
#[derive(Clone, Debug)]
pub struct LogHandle {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl LogHandle {
    /// Enqueue a message. Returns false if it was dropped.
    pub fn log(&self, msg: impl Into<String>) -> bool {
        match self.tx.try_send(msg.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Messages dropped since the consumer last reported them
    pub fn pending_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Give the consumer up to `timeout` to take everything queued so far.
    /// Used before the process exits; never required for correctness.
    pub async fn wait_idle(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.tx.capacity() < self.tx.max_capacity() {
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The last message taken may still be in the middle of its write
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Bounded queue plus its single consumer task
pub struct LogSink;

impl LogSink {
    /// Start the consumer task writing into `writer`.
    ///
    /// The task ends once every [`LogHandle`] is gone and hands the writer
    /// back, flushed.
    pub fn spawn<W>(writer: W, capacity: usize) -> (LogHandle, JoinHandle<io::Result<W>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = LogHandle {
            tx,
            dropped: Arc::clone(&dropped),
        };
        let consumer = tokio::spawn(drain(rx, writer, dropped));

        (handle, consumer)
    }
}

async fn drain<W>(
    mut rx: mpsc::Receiver<String>,
    mut writer: W,
    dropped: Arc<AtomicU64>,
) -> io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        write_line(&mut writer, &msg).await;

        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let notice = format!("{} log messages dropped (queue full)", lost);
            write_line(&mut writer, &notice).await;
        }

        if rx.is_empty() {
            if let Err(e) = writer.flush().await {
                eprintln!("log sink flush failed: {}", e);
            }
        }
    }

    writer.flush().await?;
    Ok(writer)
}

// A failed write must not stop the consumer; stderr is the only place left
// to say so.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, msg: &str) {
    let result = async {
        writer.write_all(msg.as_bytes()).await?;
        if !msg.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        Ok::<(), io::Error>(())
    }
    .await;

    if let Err(e) = result {
        eprintln!("log sink write failed: {}", e);
    }
}

/// Buffers one formatted event and enqueues it when dropped.
pub struct LogLine<'a> {
    buf: Vec<u8>,
    handle: &'a LogHandle,
}

impl Write for LogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogLine<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.handle
                .log(String::from_utf8_lossy(&self.buf).into_owned());
        }
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = LogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine {
            buf: Vec::new(),
            handle: self,
        }
    }
}

/// Open the log destination, start the sink and install the global
/// subscriber. Must be called from within the tokio runtime.
pub fn init(config: &LogConfig, level: &str) -> anyhow::Result<LogHandle> {
    let writer: Box<dyn AsyncWrite + Send + Unpin> = match config.output {
        LogOutput::File => {
            if let Some(parent) = config.file.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.file)?;
            Box::new(tokio::fs::File::from_std(file))
        }
        LogOutput::Stdout => Box::new(tokio::io::stdout()),
    };

    let (handle, _consumer) = LogSink::spawn(writer, config.queue_capacity);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(handle.clone()),
        )
        .try_init()?;

    Ok(handle)
}
