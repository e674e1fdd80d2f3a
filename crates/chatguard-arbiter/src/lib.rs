//! ChatGuard Arbiter
//!
//! Reconciles stage verdicts into one decision per message and turns
//! violation decisions into moderator reports.
//!
//! - [`Arbiter`]: the pure combination policy
//! - [`ArbiterWorker`]: verdict consumer committing decisions exactly once
//! - [`EnforcementWorker`]: decision consumer reporting each link at most once
//! - [`EnforcementSink`]: where reports go ([`LogSink`], [`WebhookSink`])

pub mod enforcement;
pub mod policy;
pub mod sink;
pub mod worker;

pub use enforcement::{EnforcementOutcome, EnforcementWorker};
pub use policy::{Arbiter, ArbiterConfig, FallbackPolicy, Outcome, Ruling};
pub use sink::{build_sink, EnforcementSink, LogSink, SinkConfig, WebhookSink};
pub use worker::{ArbiterContext, ArbiterWorker};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::enforcement::EnforcementWorker;
    pub use crate::policy::{Arbiter, ArbiterConfig, FallbackPolicy, Ruling};
    pub use crate::sink::EnforcementSink;
    pub use crate::worker::{ArbiterContext, ArbiterWorker};
}
