//! ChatGuard Core
//!
//! Core types, traits, and utilities shared across ChatGuard components.
//!
//! This crate provides:
//! - The pipeline data model: messages, verdicts, decisions, negative findings
//! - Queue envelopes carried between stages
//! - The error taxonomy shared by every worker
//! - Bounded exponential backoff used around every external hop

pub mod error;
pub mod retry;
pub mod types;

pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use types::{
    Classification, Decision, DecisionResolution, FinalClassification, Message, NegativeFinding,
    StageEnvelope, Verdict, VerdictSet,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::retry::RetryPolicy;
    pub use crate::types::{
        Classification, Decision, FinalClassification, Message, NegativeFinding, StageEnvelope,
        Verdict, VerdictSet,
    };
}
