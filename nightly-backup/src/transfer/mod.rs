//! Moving archive bytes from the archiver to the uploader.

pub mod pipe;
pub mod progress_stream;

pub use pipe::{pipe, PipeReader, PipeWriter};
pub use progress_stream::ProgressStream;
