//! Purpose: HTTP gateway composing a streaming pipeline per request.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum server mapping routes to sources, stages, and sinks under one root directory.
//! Invariants: Every streamed body is fed through a capacity-1 channel; the client sets the pace.
//! Invariants: Error envelopes carry stable kinds; statuses key off `ErrorKind` only.
//! Invariants: Loopback-only unless explicitly allowed.
//! Notes: `/csv` ingestion is detached; its outcome is only logged.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use streamgate::core::error::{Error, ErrorKind};
use streamgate::core::ingest::{IngestConfig, IngestSink};
use streamgate::core::pipeline::{Pipeline, PipelineReport};
use streamgate::core::range::{self, RangeSpec};
use streamgate::core::sink::{ChannelSink, FileSink, Sink};
use streamgate::core::source::{BodySource, BytesSource, FileSource, Source};
use streamgate::core::stage::GzipCompress;
use streamgate::core::store::SqliteStore;
use streamgate::core::ticker::TickerSource;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub root: PathBuf,
    pub store_path: PathBuf,
    pub chunk_bytes: usize,
    pub range_budget: u64,
    pub feed_interval_ms: u64,
    pub feed_duration_ms: u64,
    pub allow_non_loopback: bool,
}

/// Files the routes read and write, all under the configured root.
#[derive(Clone, Debug)]
struct Layout {
    video: PathBuf,
    large: PathBuf,
    large_gz: PathBuf,
    upload: PathBuf,
    sample_csv: PathBuf,
    pipeline_gz: PathBuf,
    temp: PathBuf,
    public: PathBuf,
}

impl Layout {
    fn new(root: &Path) -> Self {
        let data = root.join("data");
        Self {
            video: root.join("videos").join("sample.mp4"),
            large: data.join("large.txt"),
            large_gz: data.join("large.txt.gz"),
            upload: root.join("uploads").join("uploaded.txt"),
            sample_csv: data.join("sample.csv"),
            pipeline_gz: data.join("pipeline.gz"),
            temp: data.join("temp.txt"),
            public: root.join("public"),
        }
    }
}

#[derive(Debug, Default)]
struct GatewayStats {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_moved: AtomicU64,
}

impl GatewayStats {
    fn telemetry_line(&self, now: &str, tick: u64) -> String {
        format!(
            "{now} tick={tick} active_pipelines={} completed={} failed={} bytes_moved={}\n",
            self.active.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_moved.load(Ordering::Relaxed),
        )
    }
}

struct ActivePipeline<'a>(&'a GatewayStats);

impl<'a> ActivePipeline<'a> {
    fn enter(stats: &'a GatewayStats) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActivePipeline<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct AppState {
    layout: Layout,
    store: SqliteStore,
    chunk_bytes: usize,
    range_budget: u64,
    feed_interval: Duration,
    feed_duration: Duration,
    stats: Arc<GatewayStats>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let store = SqliteStore::open(&config.store_path)?;
    let state = Arc::new(AppState {
        layout: Layout::new(&config.root),
        store,
        chunk_bytes: config.chunk_bytes,
        range_budget: config.range_budget,
        feed_interval: Duration::from_millis(config.feed_interval_ms),
        feed_duration: Duration::from_millis(config.feed_duration_ms),
        stats: Arc::new(GatewayStats::default()),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        root = %config.root.display(),
        store = %config.store_path.display(),
        "gateway listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested; draining connections");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    let public = ServeDir::new(&state.layout.public);
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/video", get(stream_video))
        .route("/file/download", get(download_file))
        .route("/file/upload", post(upload_file))
        .route("/file/transform", get(transform_file))
        .route("/csv", get(ingest_csv))
        .route("/stats", get(stream_stats))
        .route("/pipeline", get(pipeline_demo))
        .route("/buffered", get(buffered_vs_streamed))
        .fallback_service(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.chunk_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--chunk-bytes must be greater than zero")
            .with_hint("Use a positive value like 65536."));
    }

    if config.range_budget == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--range-budget must be greater than zero")
            .with_hint("Use a positive value like 1000000."));
    }

    if config.feed_interval_ms == 0 || config.feed_duration_ms == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("feed interval and duration must be greater than zero")
            .with_hint("Use values like --feed-interval-ms 250 --feed-duration-ms 2000."));
    }

    if config.feed_interval_ms > config.feed_duration_ms {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--feed-interval-ms must not exceed --feed-duration-ms"));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Runs `pipeline`, keeping the gateway counters and the log in step with its outcome.
async fn tracked<S: Source, K: Sink>(
    stats: &GatewayStats,
    route: &'static str,
    pipeline: Pipeline<S, K>,
) -> Result<(PipelineReport, K), Error> {
    let result = {
        let _active = ActivePipeline::enter(stats);
        pipeline.run().await
    };
    match &result {
        Ok((report, _)) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_moved
                .fetch_add(report.bytes_out, Ordering::Relaxed);
            tracing::info!(
                route,
                chunks_in = report.chunks_in,
                bytes_in = report.bytes_in,
                chunks_out = report.chunks_out,
                bytes_out = report.bytes_out,
                "pipeline complete"
            );
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            if err.kind() == ErrorKind::Cancelled {
                tracing::warn!(route, error = %err, "pipeline cancelled");
            } else {
                tracing::error!(route, error = %err, "pipeline failed");
            }
        }
    }
    result
}

/// Spawns `source` into a channel-fed body; the pipeline lives as long as the client reads.
fn spawn_streamed<S>(state: &AppState, route: &'static str, source: S) -> Body
where
    S: Source + 'static,
{
    let (sink, rx) = ChannelSink::channel();
    let stats = Arc::clone(&state.stats);
    tokio::spawn(async move {
        let _ = tracked(&stats, route, Pipeline::new(source, sink)).await;
    });
    Body::from_stream(ReceiverStream::new(rx))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn file_size(path: &Path) -> Result<u64, Error> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|err| Error::from_io(err, "resource not available").with_path(path))?;
    if !meta.is_file() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("resource is not a file")
            .with_path(path));
    }
    Ok(meta.len())
}

fn range_header(headers: &HeaderMap) -> Result<Option<&str>, Error> {
    headers
        .get(header::RANGE)
        .map(|value| {
            value.to_str().map_err(|_| {
                Error::new(ErrorKind::MalformedRange).with_message("range header is not ASCII")
            })
        })
        .transpose()
}

async fn stream_video(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let path = &state.layout.video;
    let total_size = match file_size(path).await {
        Ok(size) => size,
        Err(err) => return error_response(err),
    };
    let spec = match range_header(&headers)
        .and_then(|header| range::negotiate(header, total_size, state.range_budget))
    {
        Ok(spec) => spec,
        Err(err) if err.kind() == ErrorKind::RangeNotSatisfiable => {
            return unsatisfiable_response(err, total_size);
        }
        Err(err) => return error_response(err),
    };
    let source = match FileSource::open_window(path, spec.start, spec.end, state.chunk_bytes).await
    {
        Ok(source) => source,
        Err(err) => return error_response(err),
    };
    tracing::debug!(start = spec.start, end = spec.end, total = spec.total_size, "range window");
    let body = spawn_streamed(&state, "video", source);
    partial_response(&spec, body)
}

fn partial_response(spec: &RangeSpec, body: Body) -> Response {
    (
        StatusCode::PARTIAL_CONTENT,
        spec.response_headers(),
        [(header::CONTENT_TYPE, "video/mp4")],
        body,
    )
        .into_response()
}

async fn download_file(State(state): State<Arc<AppState>>) -> Response {
    let path = &state.layout.large;
    let size = match file_size(path).await {
        Ok(size) => size,
        Err(err) => return error_response(err),
    };
    let source = match FileSource::open(path, state.chunk_bytes).await {
        Ok(source) => source,
        Err(err) => return error_response(err),
    };
    let body = spawn_streamed(&state, "download", source);
    (
        [
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=large.txt".to_string(),
            ),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        body,
    )
        .into_response()
}

async fn upload_file(State(state): State<Arc<AppState>>, body: Body) -> Response {
    let sink = match FileSink::create(&state.layout.upload).await {
        Ok(sink) => sink,
        Err(err) => return error_response(err),
    };
    let source = BodySource::new(body.into_data_stream());
    match tracked(&state.stats, "upload", Pipeline::new(source, sink)).await {
        Ok((report, _sink)) => Json(json!({
            "message": "file uploaded",
            "bytes": report.bytes_out,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn transform_file(State(state): State<Arc<AppState>>) -> Response {
    let source = match FileSource::open(&state.layout.large, state.chunk_bytes).await {
        Ok(source) => source,
        Err(err) => return error_response(err),
    };
    let sink = match FileSink::create(&state.layout.large_gz).await {
        Ok(sink) => sink,
        Err(err) => return error_response(err),
    };
    let pipeline = Pipeline::new(source, sink).stage(GzipCompress::new());
    match tracked(&state.stats, "transform", pipeline).await {
        Ok((report, _sink)) => Json(json!({
            "message": "file compressed",
            "report": report,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn ingest_csv(State(state): State<Arc<AppState>>) -> Response {
    let source = match FileSource::open(&state.layout.sample_csv, state.chunk_bytes).await {
        Ok(source) => source,
        Err(err) => return error_response(err),
    };
    let sink = IngestSink::new(state.store.clone(), IngestConfig::default());
    let stats = Arc::clone(&state.stats);
    tokio::spawn(async move {
        if let Ok((_report, sink)) = tracked(&stats, "csv", Pipeline::new(source, sink)).await {
            let outcome = sink.into_outcome();
            tracing::info!(
                rows = outcome.rows,
                inserted = outcome.inserted,
                ignored = outcome.ignored,
                rejected = outcome.rejected,
                failed = outcome.failed,
                "ingestion complete"
            );
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "ingestion started" })),
    )
        .into_response()
}

fn now_rfc3339() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string())
}

async fn stream_stats(State(state): State<Arc<AppState>>) -> Response {
    let stats = Arc::clone(&state.stats);
    let source = TickerSource::new(state.feed_interval, state.feed_duration, move |tick| {
        Bytes::from(stats.telemetry_line(&now_rfc3339(), tick))
    });
    let body = spawn_streamed(&state, "stats", source);
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn pipeline_demo(State(state): State<Arc<AppState>>) -> Response {
    let source = BytesSource::new(["Stream ", "Pipeline ", "Demo ", "Works!"]);
    let sink = match FileSink::create(&state.layout.pipeline_gz).await {
        Ok(sink) => sink,
        Err(err) => return error_response(err),
    };
    let pipeline = Pipeline::new(source, sink).stage(GzipCompress::new());
    match tracked(&state.stats, "pipeline", pipeline).await {
        Ok((report, _sink)) => Json(json!({
            "message": "pipeline completed",
            "report": report,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn buffered_vs_streamed(State(state): State<Arc<AppState>>) -> Response {
    let path = &state.layout.large;
    let started = Instant::now();
    let buffered = match tokio::fs::read(path).await {
        Ok(buffered) => buffered,
        Err(err) => return error_response(Error::from_io(err, "failed to read file").with_path(path)),
    };
    let buffered_ms = started.elapsed().as_secs_f64() * 1000.0;
    let buffered_bytes = buffered.len() as u64;
    drop(buffered);

    let started = Instant::now();
    let source = match FileSource::open(path, state.chunk_bytes).await {
        Ok(source) => source,
        Err(err) => return error_response(err),
    };
    let sink = match FileSink::create(&state.layout.temp).await {
        Ok(sink) => sink,
        Err(err) => return error_response(err),
    };
    match tracked(&state.stats, "buffered", Pipeline::new(source, sink)).await {
        Ok((report, _sink)) => {
            let streamed_ms = started.elapsed().as_secs_f64() * 1000.0;
            tracing::info!(buffered_ms, streamed_ms, "buffered vs streamed");
            Json(json!({
                "buffered_ms": buffered_ms,
                "streamed_ms": streamed_ms,
                "buffered_bytes": buffered_bytes,
                "streamed_bytes": report.bytes_out,
            }))
            .into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage | ErrorKind::RangeRequired | ErrorKind::MalformedRange => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
        ErrorKind::Pipeline
        | ErrorKind::Cancelled
        | ErrorKind::RowRejected
        | ErrorKind::Corrupt
        | ErrorKind::Store
        | ErrorKind::Io
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            offset: err.offset(),
        },
    };
    (status, Json(body)).into_response()
}

fn unsatisfiable_response(err: Error, total_size: u64) -> Response {
    let mut response = error_response(err);
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total_size}")) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><title>streamgate</title></head>
  <body>
    <h1>streamgate</h1>
    <ul>
      <li><a href="/csv">/csv</a> ingest data/sample.csv into the users table</li>
      <li>/video ranged playback of videos/sample.mp4 (send a Range header)</li>
      <li><a href="/file/download">/file/download</a> download data/large.txt</li>
      <li>POST /file/upload stream a request body into uploads/uploaded.txt</li>
      <li><a href="/file/transform">/file/transform</a> gzip data/large.txt</li>
      <li><a href="/pipeline">/pipeline</a> gzip a fixed chunk sequence</li>
      <li><a href="/stats">/stats</a> live gateway telemetry feed</li>
      <li><a href="/buffered">/buffered</a> buffered vs streamed read timings</li>
    </ul>
  </body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::{
        ErrorKind, GatewayStats, Layout, ServeConfig, StatusCode, serve, status_for,
        validate_config,
    };
    use std::path::{Path, PathBuf};
    use std::sync::atomic::Ordering;

    fn config(root: &Path) -> ServeConfig {
        ServeConfig {
            bind: "127.0.0.1:0".parse().expect("bind"),
            root: root.to_path_buf(),
            store_path: root.join("data.db"),
            chunk_bytes: 64 * 1024,
            range_budget: 1_000_000,
            feed_interval_ms: 250,
            feed_duration_ms: 2_000,
            allow_non_loopback: false,
        }
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ServeConfig {
            bind: "0.0.0.0:0".parse().expect("bind"),
            ..config(temp.path())
        };
        let err = serve(config).await.expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_is_allowed_with_opt_in() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ServeConfig {
            bind: "0.0.0.0:0".parse().expect("bind"),
            allow_non_loopback: true,
            ..config(temp.path())
        };
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn limits_require_positive_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = config(temp.path());
        for config in [
            ServeConfig {
                chunk_bytes: 0,
                ..base.clone()
            },
            ServeConfig {
                range_budget: 0,
                ..base.clone()
            },
            ServeConfig {
                feed_interval_ms: 0,
                ..base.clone()
            },
            ServeConfig {
                feed_interval_ms: 5_000,
                ..base.clone()
            },
        ] {
            let err = validate_config(&config).expect_err("expected usage error");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::RangeRequired), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::MalformedRange), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorKind::RangeNotSatisfiable),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            status_for(ErrorKind::Pipeline),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn layout_is_rooted() {
        let layout = Layout::new(Path::new("/srv/gate"));
        assert_eq!(layout.video, PathBuf::from("/srv/gate/videos/sample.mp4"));
        assert_eq!(layout.upload, PathBuf::from("/srv/gate/uploads/uploaded.txt"));
        assert_eq!(layout.large_gz, PathBuf::from("/srv/gate/data/large.txt.gz"));
    }

    #[test]
    fn telemetry_line_reports_counters() {
        let stats = GatewayStats::default();
        stats.active.store(2, Ordering::Relaxed);
        stats.bytes_moved.store(42, Ordering::Relaxed);
        let line = stats.telemetry_line("2026-01-01T00:00:00Z", 3);
        assert_eq!(
            line,
            "2026-01-01T00:00:00Z tick=3 active_pipelines=2 completed=0 failed=0 bytes_moved=42\n"
        );
    }
}
