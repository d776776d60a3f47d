//! Purpose: Pull-based chunk producers feeding a pipeline.
//! Exports: `Source`, `FileSource`, `BodySource`, `BytesSource`, `DEFAULT_CHUNK_BYTES`.
//! Role: Leaf of every pipeline; the coordinator asks for one chunk at a time.
//! Invariants: `produce` yields `Some(chunk)`, then `None` exactly once at end of stream.
//! Invariants: Calling `produce` after end of stream or an error is an `Internal` error.
//! Invariants: No source reads ahead of demand; a cursor only moves forward.
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::{Stream, StreamExt};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

/// Producer side of a pipeline.
pub trait Source: Send {
    /// Returns the next chunk, `None` at end of stream.
    fn produce(&mut self) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;

    /// Releases held resources early. Called by the coordinator on failure or cancellation.
    fn abort(&mut self) {}
}

pub(crate) fn exhausted_error() -> Error {
    Error::new(ErrorKind::Internal).with_message("produce called after end of stream")
}

/// Reads a file front to back, or a fixed `[start, end]` window of it.
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    chunk_bytes: usize,
    offset: u64,
    remaining: Option<u64>,
    finished: bool,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>, chunk_bytes: usize) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|err| Error::from_io(err, "failed to open source file").with_path(&path))?;
        Ok(Self {
            path,
            file: Some(file),
            chunk_bytes: chunk_bytes.max(1),
            offset: 0,
            remaining: None,
            finished: false,
        })
    }

    /// Opens `path` positioned at `start`; reads exactly `end - start + 1` bytes.
    pub async fn open_window(
        path: impl AsRef<Path>,
        start: u64,
        end: u64,
        chunk_bytes: usize,
    ) -> Result<Self, Error> {
        if end < start {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("window end precedes start")
                .with_offset(start));
        }
        let mut source = Self::open(path, chunk_bytes).await?;
        if let Some(file) = source.file.as_mut() {
            file.seek(SeekFrom::Start(start)).await.map_err(|err| {
                Error::from_io(err, "failed to seek source file")
                    .with_path(&source.path)
                    .with_offset(start)
            })?;
        }
        source.offset = start;
        source.remaining = Some(end - start + 1);
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    async fn produce(&mut self) -> Result<Option<Bytes>, Error> {
        if self.finished {
            return Err(exhausted_error());
        }
        let want = match self.remaining {
            Some(0) => {
                self.finished = true;
                self.file = None;
                return Ok(None);
            }
            Some(remaining) => remaining.min(self.chunk_bytes as u64) as usize,
            None => self.chunk_bytes,
        };
        let Some(file) = self.file.as_mut() else {
            self.finished = true;
            return Err(Error::new(ErrorKind::Cancelled)
                .with_message("source was aborted")
                .with_path(&self.path));
        };

        let mut buf = vec![0u8; want];
        let read = match file.read(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                self.finished = true;
                self.file = None;
                return Err(Error::from_io(err, "failed to read source file")
                    .with_path(&self.path)
                    .with_offset(self.offset));
            }
        };
        if read == 0 {
            self.finished = true;
            self.file = None;
            if self.remaining.is_some() {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("source file ended inside the requested window")
                    .with_path(&self.path)
                    .with_offset(self.offset));
            }
            return Ok(None);
        }
        buf.truncate(read);
        self.offset += read as u64;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= read as u64;
        }
        Ok(Some(Bytes::from(buf)))
    }

    fn abort(&mut self) {
        self.file = None;
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Adapts a push-style byte stream (e.g. an HTTP request body) to `produce`.
///
/// The stream is only polled when the coordinator asks for the next chunk, so
/// the transport's own flow control applies while the sink is busy.
pub struct BodySource {
    stream: Option<ChunkStream>,
    finished: bool,
}

impl BodySource {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + 'static,
    {
        let stream = stream.map(|item| {
            item.map_err(|err| {
                Error::new(ErrorKind::Io).with_message(format!("body stream failed: {err}"))
            })
        });
        Self {
            stream: Some(Box::pin(stream)),
            finished: false,
        }
    }
}

impl Source for BodySource {
    async fn produce(&mut self) -> Result<Option<Bytes>, Error> {
        if self.finished {
            return Err(exhausted_error());
        }
        let Some(stream) = self.stream.as_mut() else {
            self.finished = true;
            return Err(Error::new(ErrorKind::Cancelled).with_message("source was aborted"));
        };
        loop {
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok(Some(chunk)),
                Some(Err(err)) => {
                    self.finished = true;
                    self.stream = None;
                    return Err(err);
                }
                None => {
                    self.finished = true;
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }

    fn abort(&mut self) {
        self.stream = None;
    }
}

/// Fixed in-memory chunks, yielded in order.
pub struct BytesSource {
    chunks: VecDeque<Bytes>,
    finished: bool,
}

impl BytesSource {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            finished: false,
        }
    }
}

impl Source for BytesSource {
    async fn produce(&mut self) -> Result<Option<Bytes>, Error> {
        if self.finished {
            return Err(exhausted_error());
        }
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn abort(&mut self) {
        self.chunks.clear();
    }
}
