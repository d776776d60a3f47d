//! Purpose: Hold top-level CLI command dispatch for `streamgate`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: One-shot commands run a single pipeline and print one JSON document.
//! Invariants: File outputs are committed only when the pipeline finishes cleanly.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use streamgate::core::ingest::{IngestConfig, IngestOutcome, IngestSink};
use streamgate::core::pipeline::{Pipeline, PipelineReport};
use streamgate::core::sink::FileSink;
use streamgate::core::source::{DEFAULT_CHUNK_BYTES, FileSource};
use streamgate::core::stage::{GzipCompress, GzipDecompress};
use streamgate::core::store::SqliteStore;

use super::*;

pub(super) fn dispatch_command(command: Command, root: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Serve(args) => {
            let config = serve_config_from_args(args, &root)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(runtime_error)?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Ingest {
            file,
            store,
            max_row_bytes,
        } => {
            if max_row_bytes == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--max-row-bytes must be greater than zero")
                    .with_hint("Use a positive value like 65536."));
            }
            let store_path = store.unwrap_or_else(|| default_store_path(&root));
            let config = IngestConfig {
                max_row_bytes,
                ..IngestConfig::default()
            };
            let value = block_on(ingest_file(&file, &store_path, config))??;
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        Command::Compress { src, dest } => {
            let dest = dest.unwrap_or_else(|| gz_path(&src));
            let report = block_on(gzip_file(&src, &dest, true))??;
            emit_json(transfer_json(&src, &dest, report));
            Ok(RunOutcome::ok())
        }
        Command::Decompress { src, dest } => {
            let report = block_on(gzip_file(&src, &dest, false))??;
            emit_json(transfer_json(&src, &dest, report));
            Ok(RunOutcome::ok())
        }
    }
}

fn runtime_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("failed to start runtime")
        .with_source(err)
}

fn block_on<F: Future>(future: F) -> Result<F::Output, Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(runtime_error)?;
    Ok(runtime.block_on(future))
}

fn default_store_path(root: &Path) -> PathBuf {
    root.join("data.db")
}

fn gz_path(src: &Path) -> PathBuf {
    let mut dest = src.as_os_str().to_os_string();
    dest.push(".gz");
    PathBuf::from(dest)
}

fn serve_config_from_args(args: ServeArgs, root: &Path) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8000.")
    })?;
    Ok(serve::ServeConfig {
        bind,
        root: root.to_path_buf(),
        store_path: args.store.unwrap_or_else(|| default_store_path(root)),
        chunk_bytes: args.chunk_bytes,
        range_budget: args.range_budget,
        feed_interval_ms: args.feed_interval_ms,
        feed_duration_ms: args.feed_duration_ms,
        allow_non_loopback: args.allow_non_loopback,
    })
}

async fn gzip_file(src: &Path, dest: &Path, compress: bool) -> Result<PipelineReport, Error> {
    let source = FileSource::open(src, DEFAULT_CHUNK_BYTES).await?;
    let sink = FileSink::create(dest).await?;
    let pipeline = if compress {
        Pipeline::new(source, sink).stage(GzipCompress::new())
    } else {
        Pipeline::new(source, sink).stage(GzipDecompress::new())
    };
    let (report, _sink) = pipeline.run().await?;
    Ok(report)
}

async fn ingest_file(file: &Path, store_path: &Path, config: IngestConfig) -> Result<Value, Error> {
    let source = FileSource::open(file, DEFAULT_CHUNK_BYTES).await?;
    let store = SqliteStore::open(store_path)?;
    let sink = IngestSink::new(store.clone(), config);
    let (report, sink) = Pipeline::new(source, sink).run().await?;
    let stored = store.count()?;
    Ok(ingest_json(file, store_path, &sink.into_outcome(), report, stored))
}

fn transfer_json(src: &Path, dest: &Path, report: PipelineReport) -> Value {
    json!({
        "source": src.display().to_string(),
        "dest": dest.display().to_string(),
        "report": report,
    })
}

fn ingest_json(
    file: &Path,
    store_path: &Path,
    outcome: &IngestOutcome,
    report: PipelineReport,
    stored: u64,
) -> Value {
    let failures = outcome
        .failures
        .iter()
        .map(|failure| {
            json!({
                "row": failure.row,
                "kind": failure.kind,
                "message": failure.message,
            })
        })
        .collect::<Vec<_>>();
    json!({
        "file": file.display().to_string(),
        "store": store_path.display().to_string(),
        "rows": outcome.rows,
        "inserted": outcome.inserted,
        "ignored": outcome.ignored,
        "rejected": outcome.rejected,
        "failed": outcome.failed,
        "failures": failures,
        "bytes": report.bytes_in,
        "stored_users": stored,
    })
}

#[cfg(test)]
mod tests {
    use super::{gz_path, serve_config_from_args};
    use crate::ServeArgs;
    use std::path::{Path, PathBuf};

    #[test]
    fn gz_path_appends_suffix() {
        assert_eq!(gz_path(Path::new("data/large.txt")), PathBuf::from("data/large.txt.gz"));
    }

    #[test]
    fn serve_config_defaults_store_under_root() {
        let args = ServeArgs {
            bind: "127.0.0.1:8000".to_string(),
            store: None,
            chunk_bytes: 1024,
            range_budget: 10,
            feed_interval_ms: 10,
            feed_duration_ms: 100,
            allow_non_loopback: false,
        };
        let config = serve_config_from_args(args, Path::new("/srv/gate")).expect("config");
        assert_eq!(config.store_path, PathBuf::from("/srv/gate/data.db"));
        assert_eq!(config.root, PathBuf::from("/srv/gate"));
    }

    #[test]
    fn invalid_bind_is_usage_error() {
        let args = ServeArgs {
            bind: "localhost".to_string(),
            store: None,
            chunk_bytes: 1024,
            range_budget: 10,
            feed_interval_ms: 10,
            feed_duration_ms: 100,
            allow_non_loopback: false,
        };
        let err = serve_config_from_args(args, Path::new(".")).expect_err("bind");
        assert_eq!(err.kind(), streamgate::core::error::ErrorKind::Usage);
    }
}
