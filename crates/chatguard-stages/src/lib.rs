//! ChatGuard Stages
//!
//! Analysis stages for the moderation pipeline.
//!
//! A stage is a worker that pops messages from its input topic, asks an
//! [`Analyzer`] for an assessment, and publishes a [`Verdict`] for the
//! arbiter. Analyzers are opaque capabilities:
//! - [`HeuristicAnalyzer`]: link and phrase rules, no network
//! - [`ModelAnalyzer`]: OpenAI-compatible chat completion endpoints
//!   (primary and secondary reviewers)
//! - [`MediaAnalyzer`]: remote media classifier
//!
//! Failures of the capability never block the pipeline: after the retry
//! budget the stage reports `uncertain` and lets arbitration proceed.
//!
//! [`Verdict`]: chatguard_core::Verdict

pub mod analyzer;
pub mod config;
pub mod heuristic;
pub mod media;
pub mod model;
pub mod registry;
pub mod stage;

pub use analyzer::{Analyzer, AnalyzerKind, Assessment};
pub use config::{HeuristicConfig, MediaConfig, ModelConfig, StageSpec};
pub use heuristic::HeuristicAnalyzer;
pub use media::MediaAnalyzer;
pub use model::{parse_model_reply, ModelAnalyzer};
pub use registry::{build_analyzer, build_analyzers};
pub use stage::{AnalysisStage, StageOutcome, StageSettings};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::analyzer::{Analyzer, AnalyzerKind, Assessment};
    pub use crate::heuristic::HeuristicAnalyzer;
    pub use crate::media::MediaAnalyzer;
    pub use crate::model::ModelAnalyzer;
    pub use crate::stage::{AnalysisStage, StageSettings};
}
