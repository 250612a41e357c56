//! Byte-counting stream wrapper for the upload body.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Stream wrapper that counts bytes handed to the uploader and reports
/// throughput at debug level
pub struct ProgressStream<S> {
    inner: S,
    transferred: Arc<AtomicU64>,
    key: String,
    started: Instant,
    last_report: Instant,
    report_interval: Duration,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    /// `transferred` is shared so the caller can read the total afterwards
    pub fn new(inner: S, key: impl Into<String>, transferred: Arc<AtomicU64>) -> Self {
        let now = Instant::now();
        Self {
            inner,
            transferred,
            key: key.into(),
            started: now,
            last_report: now,
            report_interval: Duration::from_secs(30),
        }
    }

    fn report(&self, total: u64) {
        let secs = self.started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { (total as f64 / secs) as u64 } else { 0 };
        tracing::debug!(
            key = %self.key,
            bytes = total,
            bytes_per_second = rate,
            "Upload progress"
        );
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let total = self
                    .transferred
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed)
                    + bytes.len() as u64;

                let now = Instant::now();
                if now.duration_since(self.last_report) >= self.report_interval {
                    self.report(total);
                    self.last_report = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                self.report(self.transferred.load(Ordering::Relaxed));
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn test_counts_all_bytes() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
        ];
        let counter = Arc::new(AtomicU64::new(0));
        let mut progress = ProgressStream::new(stream::iter(chunks), "k", Arc::clone(&counter));

        while let Some(chunk) = progress.next().await {
            chunk.unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
        ];
        let counter = Arc::new(AtomicU64::new(0));
        let progress = ProgressStream::new(stream::iter(chunks), "k", Arc::clone(&counter));

        let items: Vec<_> = progress.collect().await;
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
