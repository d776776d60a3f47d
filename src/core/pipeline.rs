//! Purpose: Drive chunks from one source through ordered stages into one sink.
//! Exports: `Pipeline`, `PipelineReport`.
//! Role: The flow-control core shared by every gateway route and CLI command.
//! Invariants: A new chunk is pulled only after all output of the previous one was accepted.
//! Invariants: Chunk order is preserved; stages run strictly in sequence per chunk.
//! Invariants: Exactly one terminal outcome; the sink sees exactly one of finish/abort.
//! Invariants: No chunk reaches the sink after any part of the chain has failed.
use bytes::Bytes;
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::sink::Sink;
use crate::core::source::Source;
use crate::core::stage::Stage;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PipelineReport {
    pub chunks_in: u64,
    pub bytes_in: u64,
    pub chunks_out: u64,
    pub bytes_out: u64,
}

pub struct Pipeline<S, K> {
    source: S,
    stages: Vec<Box<dyn Stage>>,
    sink: K,
}

impl<S: Source, K: Sink> Pipeline<S, K> {
    pub fn new(source: S, sink: K) -> Self {
        Self {
            source,
            stages: Vec::new(),
            sink,
        }
    }

    /// Appends a stage after the ones already added.
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Runs to completion and hands the sink back for inspection.
    ///
    /// On failure the source is aborted and the sink is told once before the
    /// error is returned.
    pub async fn run(mut self) -> Result<(PipelineReport, K), Error> {
        let mut report = PipelineReport::default();
        match self.drive(&mut report).await {
            Ok(()) => {
                tracing::debug!(
                    chunks_in = report.chunks_in,
                    bytes_in = report.bytes_in,
                    chunks_out = report.chunks_out,
                    bytes_out = report.bytes_out,
                    "pipeline complete"
                );
                Ok((report, self.sink))
            }
            Err(err) => {
                self.source.abort();
                self.sink.abort(&err).await;
                if err.kind() == ErrorKind::Cancelled {
                    tracing::debug!(bytes_out = report.bytes_out, "pipeline cancelled");
                } else {
                    tracing::debug!(bytes_out = report.bytes_out, error = %err, "pipeline failed");
                }
                Err(err)
            }
        }
    }

    async fn drive(&mut self, report: &mut PipelineReport) -> Result<(), Error> {
        loop {
            let next = tokio::select! {
                biased;
                () = self.sink.closed() => {
                    return Err(Error::new(ErrorKind::Cancelled)
                        .with_message("downstream consumer disconnected"));
                }
                next = self.source.produce() => next.map_err(|err| wrap("source", err))?,
            };
            let Some(chunk) = next else {
                break;
            };
            report.chunks_in += 1;
            report.bytes_in += chunk.len() as u64;

            let outputs = push_through(&mut self.stages, chunk)?;
            deliver(&mut self.sink, outputs, report).await?;
        }

        for index in 0..self.stages.len() {
            let (head, rest) = self.stages.split_at_mut(index + 1);
            let stage = &mut head[index];
            let flushed = stage
                .flush()
                .map_err(|err| wrap(&format!("stage {}", stage.name()), err))?;
            for chunk in flushed {
                let outputs = push_through(rest, chunk)?;
                deliver(&mut self.sink, outputs, report).await?;
            }
        }

        self.sink.finish().await.map_err(|err| wrap("sink", err))
    }
}

fn wrap(origin: &str, err: Error) -> Error {
    if err.kind() == ErrorKind::Cancelled {
        return err;
    }
    let detail = err.message().unwrap_or("error").to_string();
    let mut wrapped =
        Error::new(ErrorKind::Pipeline).with_message(format!("{origin} failed: {detail}"));
    if let Some(path) = err.path() {
        wrapped = wrapped.with_path(path);
    }
    if let Some(offset) = err.offset() {
        wrapped = wrapped.with_offset(offset);
    }
    wrapped.with_source(err)
}

fn push_through(stages: &mut [Box<dyn Stage>], chunk: Bytes) -> Result<Vec<Bytes>, Error> {
    let mut pending = vec![chunk];
    for stage in stages.iter_mut() {
        let mut next = Vec::with_capacity(pending.len());
        for chunk in pending {
            let out = stage
                .transform(chunk)
                .map_err(|err| wrap(&format!("stage {}", stage.name()), err))?;
            next.extend(out);
        }
        pending = next;
    }
    Ok(pending)
}

async fn deliver<K: Sink>(
    sink: &mut K,
    outputs: Vec<Bytes>,
    report: &mut PipelineReport,
) -> Result<(), Error> {
    for chunk in outputs {
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len() as u64;
        sink.accept(chunk).await.map_err(|err| wrap("sink", err))?;
        report.chunks_out += 1;
        report.bytes_out += len;
    }
    Ok(())
}
