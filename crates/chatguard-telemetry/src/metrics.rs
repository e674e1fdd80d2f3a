//! Metrics collection and reporting

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prometheus metric names
pub mod names {
    pub const MESSAGES_INGESTED: &str = "chatguard_messages_ingested_total";
    pub const VERDICTS: &str = "chatguard_verdicts_total";
    pub const STAGE_LATENCY_US: &str = "chatguard_stage_latency_us";
    pub const STAGE_FAILURES: &str = "chatguard_stage_failures_total";
    pub const RETRIES: &str = "chatguard_retries_total";
    pub const DECISIONS: &str = "chatguard_decisions_total";
    pub const DUPLICATES: &str = "chatguard_duplicates_total";
    pub const ARBITRATION_TIMEOUTS: &str = "chatguard_arbitration_timeouts_total";
    pub const ENFORCEMENTS: &str = "chatguard_enforcements_total";
}

/// Register descriptions with whatever recorder is installed
pub fn describe_metrics() {
    metrics::describe_counter!(names::MESSAGES_INGESTED, "Messages accepted for moderation");
    metrics::describe_counter!(names::VERDICTS, "Verdicts published by stage and classification");
    metrics::describe_histogram!(
        names::STAGE_LATENCY_US,
        metrics::Unit::Microseconds,
        "Analysis capability latency in microseconds by stage"
    );
    metrics::describe_counter!(names::STAGE_FAILURES, "Stage evaluations that degraded to uncertain");
    metrics::describe_counter!(names::RETRIES, "Retried external calls by operation");
    metrics::describe_counter!(names::DECISIONS, "Committed decisions by classification");
    metrics::describe_counter!(names::DUPLICATES, "Dropped duplicate decisions and reports by kind");
    metrics::describe_counter!(
        names::ARBITRATION_TIMEOUTS,
        "Decisions committed after the arbitration window elapsed"
    );
    metrics::describe_counter!(names::ENFORCEMENTS, "Enforcement callbacks by outcome");
    tracing::debug!("Metric descriptions registered");
}

/// Pipeline counters shared by every worker in a process
#[derive(Clone)]
pub struct PipelineMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    messages_ingested: AtomicU64,
    verdicts_published: AtomicU64,
    stage_failures: AtomicU64,
    decisions_clean: AtomicU64,
    decisions_violation: AtomicU64,
    duplicate_decisions: AtomicU64,
    duplicate_reports: AtomicU64,
    arbitration_timeouts: AtomicU64,
    enforcements: AtomicU64,
    enforcement_failures: AtomicU64,
    stage_latency_us: AtomicU64,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_ingested(&self) {
        self.inner.messages_ingested.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::MESSAGES_INGESTED).increment(1);
    }

    /// Record a published verdict and the capability latency behind it
    pub fn record_verdict(&self, stage: &str, classification: &str, latency_us: u64) {
        self.inner.verdicts_published.fetch_add(1, Ordering::Relaxed);
        self.inner
            .stage_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        metrics::counter!(names::VERDICTS, "stage" => stage.to_string(), "classification" => classification.to_string())
            .increment(1);
        metrics::histogram!(names::STAGE_LATENCY_US, "stage" => stage.to_string())
            .record(latency_us as f64);
    }

    pub fn record_stage_failure(&self, stage: &str) {
        self.inner.stage_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::STAGE_FAILURES, "stage" => stage.to_string()).increment(1);
    }

    pub fn record_decision(&self, violation: bool) {
        let (counter, label) = if violation {
            (&self.inner.decisions_violation, "violation")
        } else {
            (&self.inner.decisions_clean, "clean")
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::DECISIONS, "classification" => label).increment(1);
    }

    pub fn record_duplicate_decision(&self) {
        self.inner.duplicate_decisions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::DUPLICATES, "kind" => "decision").increment(1);
    }

    pub fn record_duplicate_report(&self) {
        self.inner.duplicate_reports.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::DUPLICATES, "kind" => "report").increment(1);
    }

    pub fn record_arbitration_timeout(&self) {
        self.inner.arbitration_timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::ARBITRATION_TIMEOUTS).increment(1);
    }

    pub fn record_enforcement(&self, success: bool) {
        let outcome = if success {
            self.inner.enforcements.fetch_add(1, Ordering::Relaxed);
            "ok"
        } else {
            self.inner.enforcement_failures.fetch_add(1, Ordering::Relaxed);
            "failed"
        };
        metrics::counter!(names::ENFORCEMENTS, "outcome" => outcome).increment(1);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_ingested: load(&self.inner.messages_ingested),
            verdicts_published: load(&self.inner.verdicts_published),
            stage_failures: load(&self.inner.stage_failures),
            decisions_clean: load(&self.inner.decisions_clean),
            decisions_violation: load(&self.inner.decisions_violation),
            duplicate_decisions: load(&self.inner.duplicate_decisions),
            duplicate_reports: load(&self.inner.duplicate_reports),
            arbitration_timeouts: load(&self.inner.arbitration_timeouts),
            enforcements: load(&self.inner.enforcements),
            enforcement_failures: load(&self.inner.enforcement_failures),
            stage_latency_us: load(&self.inner.stage_latency_us),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_ingested: u64,
    pub verdicts_published: u64,
    pub stage_failures: u64,
    pub decisions_clean: u64,
    pub decisions_violation: u64,
    pub duplicate_decisions: u64,
    pub duplicate_reports: u64,
    pub arbitration_timeouts: u64,
    pub enforcements: u64,
    pub enforcement_failures: u64,
    pub stage_latency_us: u64,
}

impl MetricsSnapshot {
    pub fn decisions(&self) -> u64 {
        self.decisions_clean + self.decisions_violation
    }

    /// Average capability latency per published verdict
    pub fn avg_stage_latency_us(&self) -> u64 {
        if self.verdicts_published == 0 {
            0
        } else {
            self.stage_latency_us / self.verdicts_published
        }
    }

    /// Share of decisions that were violations
    pub fn violation_rate(&self) -> f64 {
        let total = self.decisions();
        if total == 0 {
            0.0
        } else {
            self.decisions_violation as f64 / total as f64
        }
    }
}
