//! Connected byte stream between the archiver and the uploader.
//!
//! The writer half is a blocking [`std::io::Write`] meant for a blocking
//! thread; the reader half is a [`Stream`] of chunks an HTTP body can be
//! built from. At most `depth` chunks of `chunk_size` bytes are in flight.
//!
//! Teardown is symmetric. If the reader goes away, the next chunk the writer
//! hands over fails with `BrokenPipe`. If the writer fails or is dropped
//! without [`PipeWriter::close`], the reader yields an error instead of a
//! clean end-of-stream, so a truncated archive is never mistaken for a
//! complete one.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;

type Chunk = io::Result<Bytes>;

/// Create a connected writer/reader pair
pub fn pipe(chunk_size: usize, depth: usize) -> (PipeWriter, PipeReader) {
    let chunk_size = chunk_size.max(1);
    let (tx, rx) = mpsc::channel(depth.max(1));
    let finished = Arc::new(AtomicBool::new(false));

    let writer = PipeWriter {
        tx: Some(tx),
        buf: BytesMut::with_capacity(chunk_size),
        chunk_size,
        finished: Arc::clone(&finished),
    };
    let reader = PipeReader {
        rx,
        finished,
        done: false,
    };

    (writer, reader)
}

/// Producer half. Must not be used from inside an async task.
pub struct PipeWriter {
    tx: Option<mpsc::Sender<Chunk>>,
    buf: BytesMut,
    chunk_size: usize,
    finished: Arc<AtomicBool>,
}

impl PipeWriter {
    fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed"))?;

        tx.blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader went away"))
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = self.buf.split().freeze();
            self.send(chunk)?;
        }
        Ok(())
    }

    /// Hand over buffered bytes and signal a clean end-of-stream
    pub fn close(mut self) -> io::Result<()> {
        self.send_buffered()?;
        self.finished.store(true, Ordering::Release);
        self.tx = None;
        Ok(())
    }

    /// Discard buffered bytes and make the reader fail with `err`
    pub fn close_with_error(mut self, err: io::Error) {
        self.buf.clear();
        if let Some(tx) = self.tx.take() {
            // Reader may already be gone; nothing left to tell then
            let _ = tx.blocking_send(Err(err));
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.tx.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed"));
        }

        let room = self.chunk_size - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);

        if self.buf.len() >= self.chunk_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Consumer half
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    finished: Arc<AtomicBool>,
    done: bool,
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(e)) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                self.done = true;
                if self.finished.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "archive stream ended without being closed",
                    ))))
                }
            }
        }
    }
}
