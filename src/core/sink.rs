//! Purpose: Chunk consumers terminating a pipeline.
//! Exports: `Sink`, `FileSink`, `ChannelSink`, `BodyItem`.
//! Role: The sink sets the pace; `accept` returns only once a chunk is fully taken.
//! Invariants: Exactly one of `finish`/`abort` is called per pipeline run.
//! Invariants: A failed or dropped file pipeline never leaves a complete-looking destination file.
//! Invariants: A failed channel pipeline ends the body with an error, never a clean end.
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::core::error::{Error, ErrorKind};

/// Consumer side of a pipeline.
pub trait Sink: Send {
    /// Takes one chunk. Returning means the chunk is fully accepted.
    fn accept(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Commits everything accepted so far. Called once after the last chunk.
    fn finish(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Discards or poisons the output. Called once when the pipeline fails.
    fn abort(&mut self, err: &Error) -> impl Future<Output = ()> + Send;

    /// Resolves when the downstream consumer is gone and further work is pointless.
    fn closed(&self) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }
}

/// Writes into a private staging file beside `path` and renames onto `path` in `finish`.
///
/// Each sink owns its staging file, so concurrent sinks for one destination
/// never share bytes; the last one to finish wins whole. Dropping an
/// unfinished sink removes its staging file.
pub struct FileSink {
    path: PathBuf,
    staged: Option<TempPath>,
    file: Option<File>,
    written: u64,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let parent = match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(|err| {
            Error::from_io(err, "failed to create sink directory").with_path(&parent)
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".partial")
            .tempfile_in(&parent)
            .map_err(|err| Error::from_io(err, "failed to create sink file").with_path(&parent))?;
        let (file, staged) = staged.into_parts();
        Ok(Self {
            path,
            staged: Some(staged),
            file: Some(File::from_std(file)),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn staged_path(&self) -> &Path {
        self.staged.as_deref().unwrap_or(&self.path)
    }

    fn io_error(&self, err: io::Error, message: &str) -> Error {
        Error::from_io(err, message)
            .with_path(self.staged_path())
            .with_offset(self.written)
    }

    fn closed_error(&self) -> Error {
        Error::new(ErrorKind::Internal)
            .with_message("sink already closed")
            .with_path(&self.path)
    }
}

impl Sink for FileSink {
    async fn accept(&mut self, chunk: Bytes) -> Result<(), Error> {
        let Some(file) = self.file.as_mut() else {
            return Err(self.closed_error());
        };
        if let Err(err) = file.write_all(&chunk).await {
            return Err(self.io_error(err, "failed to write sink file"));
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), Error> {
        let Some(mut file) = self.file.take() else {
            return Err(self.closed_error());
        };
        if let Err(err) = file.flush().await {
            return Err(self.io_error(err, "failed to flush sink file"));
        }
        if let Err(err) = file.sync_all().await {
            return Err(self.io_error(err, "failed to sync sink file"));
        }
        drop(file);
        let Some(staged) = self.staged.take() else {
            return Err(self.closed_error());
        };
        staged.persist(&self.path).map_err(|err| {
            Error::from_io(err.error, "failed to commit sink file").with_path(&self.path)
        })
    }

    async fn abort(&mut self, _err: &Error) {
        self.file = None;
        if let Some(staged) = self.staged.take() {
            let display_path = staged.display().to_string();
            if let Err(err) = staged.close() {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %display_path, error = %err, "failed to remove partial file");
                }
            }
        }
    }
}

/// Item type of a streamed HTTP body fed by a `ChannelSink`.
pub type BodyItem = Result<Bytes, io::Error>;

/// Forwards chunks into a bounded channel drained by a response body.
///
/// Built over a capacity-1 channel, `accept` parks until the previous chunk
/// has been taken by the body.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<BodyItem>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BodyItem>) -> Self {
        Self { tx }
    }

    /// A capacity-1 channel pair: the sink and the receiver for the body stream.
    pub fn channel() -> (Self, mpsc::Receiver<BodyItem>) {
        let (tx, rx) = mpsc::channel(1);
        (Self::new(tx), rx)
    }
}

fn downstream_closed() -> Error {
    Error::new(ErrorKind::Cancelled).with_message("downstream consumer disconnected")
}

impl Sink for ChannelSink {
    async fn accept(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| downstream_closed())
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if self.tx.is_closed() {
            return Err(downstream_closed());
        }
        Ok(())
    }

    async fn abort(&mut self, err: &Error) {
        if err.kind() == ErrorKind::Cancelled {
            return;
        }
        let _ = self.tx.send(Err(io::Error::other(err.to_string()))).await;
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}
