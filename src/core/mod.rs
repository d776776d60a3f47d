// Core modules: streaming primitives, range negotiation, ingestion, and errors.
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod range;
pub mod sink;
pub mod source;
pub mod stage;
pub mod store;
pub mod ticker;
