//! ChatGuard Worker
//!
//! Runtime for the moderation pipeline: configuration loading, the
//! ingestion API, and construction of stage, arbiter and enforcement
//! workers on top of a memory or Redis backend.

pub mod config;
pub mod ingest;
pub mod routes;
pub mod runtime;

pub use config::{AppConfig, BackendKind, Overrides};
pub use ingest::{IngestOutcome, IngestRequest, Ingestor};
pub use routes::{create_router, AppState};
pub use runtime::Services;
