//! Purpose: Shared core library crate used by the `streamgate` CLI and tests.
//! Exports: `core` (sources, stages, sinks, pipeline, ranges, ingestion, errors).
//! Role: Streaming engine backing the binary; the HTTP gateway composes it per request.
//! Invariants: Every pipeline is created per request and owns its source, stages, and sink.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;
