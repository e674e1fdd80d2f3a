//! Shared services and worker construction

use anyhow::{Context, Result};
use chatguard_arbiter::{build_sink, Arbiter, ArbiterContext, ArbiterWorker, EnforcementWorker};
use chatguard_broker::{
    Broker, DedupStore, MemoryBroker, MemoryDedupStore, MemoryRecordStore, MemoryVerdictStore,
    RecordStore, Topics, VerdictStore,
};
use chatguard_stages::{build_analyzers, AnalysisStage};
use chatguard_telemetry::PipelineMetrics;
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, BackendKind};
use crate::ingest::Ingestor;

enum Transport {
    Memory(MemoryBroker),
    #[cfg(feature = "redis-backend")]
    Redis(chatguard_broker::RedisBackend),
}

/// Handles every role in this process coordinates through
pub struct Services {
    transport: Transport,
    pub dedup: Arc<dyn DedupStore>,
    pub verdicts: Arc<dyn VerdictStore>,
    pub records: Arc<dyn RecordStore>,
    pub topics: Topics,
    pub metrics: PipelineMetrics,
    pub http_client: reqwest::Client,
}

impl Services {
    /// Connect to the configured backend
    pub async fn connect(config: &AppConfig, metrics: PipelineMetrics) -> Result<Self> {
        match config.broker.backend {
            BackendKind::Memory => Ok(Self::in_memory(config, metrics)),
            BackendKind::Redis => Self::redis(config, metrics).await,
        }
    }

    /// Single-process services backed by in-memory queues and stores
    pub fn in_memory(config: &AppConfig, metrics: PipelineMetrics) -> Self {
        info!(prefix = %config.broker.prefix, "Using in-memory backend");
        Self {
            transport: Transport::Memory(MemoryBroker::new()),
            dedup: Arc::new(MemoryDedupStore::new()),
            verdicts: Arc::new(MemoryVerdictStore::new()),
            records: Arc::new(MemoryRecordStore::new()),
            topics: Topics::new(config.broker.prefix.clone()),
            metrics,
            http_client: reqwest::Client::new(),
        }
    }

    #[cfg(feature = "redis-backend")]
    async fn redis(config: &AppConfig, metrics: PipelineMetrics) -> Result<Self> {
        let backend =
            chatguard_broker::RedisBackend::connect(&config.broker.redis_url, config.broker.prefix.clone())
                .await
                .with_context(|| format!("connecting to {}", config.broker.redis_url))?;

        Ok(Self {
            dedup: Arc::new(backend.dedup(config.broker.decided_ttl())),
            verdicts: Arc::new(backend.verdicts()),
            records: Arc::new(backend.records()),
            transport: Transport::Redis(backend),
            topics: Topics::new(config.broker.prefix.clone()),
            metrics,
            http_client: reqwest::Client::new(),
        })
    }

    #[cfg(not(feature = "redis-backend"))]
    async fn redis(_config: &AppConfig, _metrics: PipelineMetrics) -> Result<Self> {
        anyhow::bail!("built without the redis-backend feature; use the memory backend")
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.transport {
            Transport::Memory(_) => "memory",
            #[cfg(feature = "redis-backend")]
            Transport::Redis(_) => "redis",
        }
    }

    /// Broker handle for one consumer
    pub fn broker(&self, consumer_id: &str) -> Arc<dyn Broker> {
        match &self.transport {
            Transport::Memory(broker) => broker.for_consumer(consumer_id),
            #[cfg(feature = "redis-backend")]
            Transport::Redis(backend) => Arc::new(backend.broker(consumer_id)),
        }
    }

    /// Build `replicas` workers for every configured stage, or only for
    /// the stage named by `only`
    pub fn stage_workers(
        &self,
        config: &AppConfig,
        only: Option<&str>,
        replicas: usize,
    ) -> Result<Vec<AnalysisStage>> {
        let specs: Vec<_> = config
            .stages
            .iter()
            .filter(|spec| only.map_or(true, |name| spec.name() == name))
            .cloned()
            .collect();
        if specs.is_empty() {
            anyhow::bail!("no stage named '{}' is configured", only.unwrap_or_default());
        }

        let analyzers = build_analyzers(&specs, &self.http_client)?;
        let settings = config.stage_settings();

        let mut workers = Vec::with_capacity(analyzers.len() * replicas.max(1));
        for analyzer in analyzers {
            for replica in 0..replicas.max(1) {
                let consumer = consumer_id(analyzer.name(), replica);
                workers.push(
                    AnalysisStage::new(
                        Arc::clone(&analyzer),
                        self.broker(&consumer),
                        Arc::clone(&self.dedup),
                        self.topics.clone(),
                        settings.clone(),
                    )
                    .with_metrics(self.metrics.clone()),
                );
            }
        }
        Ok(workers)
    }

    pub fn arbiter_worker(&self, config: &AppConfig, replica: usize) -> ArbiterWorker {
        let id = consumer_id("arbiter", replica);
        let ctx = ArbiterContext {
            broker: self.broker(&id),
            dedup: Arc::clone(&self.dedup),
            verdicts: Arc::clone(&self.verdicts),
            records: Arc::clone(&self.records),
            topics: self.topics.clone(),
            retry: config.retry.clone(),
            metrics: self.metrics.clone(),
        };
        ArbiterWorker::new(id, Arbiter::new(config.arbiter.clone()), ctx)
            .with_poll_wait(config.broker.poll_wait())
    }

    pub fn enforcement_worker(&self, config: &AppConfig, replica: usize) -> EnforcementWorker {
        let id = consumer_id("enforcer", replica);
        EnforcementWorker::new(
            id.clone(),
            self.broker(&id),
            Arc::clone(&self.dedup),
            Arc::clone(&self.records),
            build_sink(&config.enforcement.sink, &self.http_client),
            self.topics.clone(),
            config.retry.clone(),
            self.metrics.clone(),
        )
        .with_poll_wait(config.broker.poll_wait())
    }

    pub fn ingestor(&self, config: &AppConfig) -> Ingestor {
        Ingestor::new(
            self.broker("ingest"),
            Arc::clone(&self.dedup),
            Arc::clone(&self.records),
            self.topics.clone(),
            config.stage_names(),
            config.ingest.default_rules.clone(),
            config.retry.clone(),
            self.metrics.clone(),
        )
    }
}

/// Consumer ids must be stable across restarts so a restarted worker
/// recovers its own in-flight deliveries.
fn consumer_id(role: &str, replica: usize) -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => format!("{}-{}-{}", role, host, replica),
        _ => format!("{}-{}", role, replica),
    }
}
