//! Verdict combination policy
//!
//! [`Arbiter::evaluate`] is a pure function of the verdicts present and the
//! time since the first one arrived. It never looks at arrival order, so
//! redelivered or reordered verdicts cannot change its answer.
//!
//! Rules, in order:
//! 1. Nothing is decided until every expected stage has reported or the
//!    arbitration window has elapsed.
//! 2. Any qualifying violation (confidence at or above the threshold, or no
//!    confidence) decides `violation`.
//! 3. If every expected stage said `clean`, the decision is `clean`.
//! 4. Otherwise the message waits for the window, after which the fallback
//!    policy decides.

use chatguard_core::{
    Classification, Decision, DecisionResolution, FinalClassification, Verdict, VerdictSet,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// What to decide when the window elapses without a clear answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Assume innocent
    #[default]
    FailOpen,

    /// Assume guilty until a moderator looks
    FailClosed,
}

/// Arbiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Minimum confidence for a violation vote to count. Inclusive: a vote
    /// at exactly the threshold qualifies.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Arbitration window measured from the first verdict (milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Stages that must all report before deciding early. Empty means
    /// "every configured stage" and is filled in at start-up.
    #[serde(default)]
    pub expected_stages: Vec<String>,

    #[serde(default)]
    pub fallback: FallbackPolicy,

    /// How often pending messages are checked for an elapsed window
    /// (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_ms: default_window_ms(),
            expected_stages: Vec::new(),
            fallback: FallbackPolicy::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_threshold() -> f32 {
    0.5
}

fn default_window_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl ArbiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Result of evaluating a verdict set
#[derive(Debug, Clone, PartialEq)]
pub enum Ruling {
    /// Not enough information yet
    Pending,

    /// Commit this outcome
    Decide(Outcome),
}

impl Ruling {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A decision not yet bound to a message id and time
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub final_classification: FinalClassification,
    pub combined_reason: String,
    pub contributing_stages: BTreeSet<String>,
    pub resolution: DecisionResolution,
}

impl Outcome {
    pub fn into_decision(self, message_id: impl Into<String>, decided_at: DateTime<Utc>) -> Decision {
        Decision {
            message_id: message_id.into(),
            final_classification: self.final_classification,
            combined_reason: self.combined_reason,
            contributing_stages: self.contributing_stages,
            resolution: self.resolution,
            decided_at,
        }
    }
}

/// The combination policy
#[derive(Debug, Clone)]
pub struct Arbiter {
    config: ArbiterConfig,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Stages expected but not yet reported
    pub fn missing_stages<'a>(&'a self, verdicts: &VerdictSet) -> Vec<&'a str> {
        self.config
            .expected_stages
            .iter()
            .map(String::as_str)
            .filter(|stage| verdicts.get(stage).is_none())
            .collect()
    }

    /// Decide, or not yet, for one message
    pub fn evaluate(&self, verdicts: &VerdictSet, elapsed: Duration) -> Ruling {
        let missing = self.missing_stages(verdicts);
        let complete = missing.is_empty();
        let window_elapsed = elapsed >= self.config.window();

        if !window_elapsed && (!complete || verdicts.is_empty()) {
            return Ruling::Pending;
        }

        let resolution = if complete {
            DecisionResolution::Complete
        } else {
            DecisionResolution::WindowElapsed
        };
        let contributing_stages: BTreeSet<String> = verdicts.stages().map(str::to_string).collect();

        let qualifying: Vec<&Verdict> = verdicts
            .iter()
            .filter(|v| v.is_qualifying_violation(self.config.threshold))
            .collect();

        if !qualifying.is_empty() {
            return Ruling::Decide(Outcome {
                final_classification: FinalClassification::Violation,
                combined_reason: join_reasons(&qualifying),
                contributing_stages,
                resolution,
            });
        }

        let all_clean = complete
            && verdicts
                .iter()
                .all(|v| v.classification == Classification::Clean);
        if all_clean {
            let clean: Vec<&Verdict> = verdicts.iter().collect();
            return Ruling::Decide(Outcome {
                final_classification: FinalClassification::Clean,
                combined_reason: join_reasons(&clean),
                contributing_stages,
                resolution,
            });
        }

        if !window_elapsed {
            return Ruling::Pending;
        }

        Ruling::Decide(self.fallback(verdicts, &missing, contributing_stages))
    }

    fn fallback(
        &self,
        verdicts: &VerdictSet,
        missing: &[&str],
        contributing_stages: BTreeSet<String>,
    ) -> Outcome {
        let unsettled: Vec<&str> = verdicts
            .iter()
            .filter(|v| v.classification != Classification::Clean)
            .map(|v| v.stage_name.as_str())
            .collect();

        let mut gaps = Vec::new();
        if !missing.is_empty() {
            gaps.push(format!("missing: {}", missing.join(", ")));
        }
        if !unsettled.is_empty() {
            gaps.push(format!("inconclusive: {}", unsettled.join(", ")));
        }
        let gaps = gaps.join("; ");

        let (final_classification, combined_reason) = match self.config.fallback {
            FallbackPolicy::FailOpen => (
                FinalClassification::Clean,
                format!("arbitration incomplete ({}), defaulting to clean", gaps),
            ),
            FallbackPolicy::FailClosed => (
                FinalClassification::Violation,
                format!("pending moderator review ({})", gaps),
            ),
        };

        Outcome {
            final_classification,
            combined_reason,
            contributing_stages,
            resolution: DecisionResolution::WindowElapsed,
        }
    }
}

/// `stage: reason` pairs in stage-name order
fn join_reasons(verdicts: &[&Verdict]) -> String {
    verdicts
        .iter()
        .map(|v| format!("{}: {}", v.stage_name, v.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
