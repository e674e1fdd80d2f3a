//! Worker configuration
//!
//! Layering, lowest precedence first:
//! 1. built-in defaults
//! 2. the YAML file (optional)
//! 3. environment variables `CHATGUARD__<SECTION>__<KEY>`
//! 4. command-line overrides

use chatguard_arbiter::{ArbiterConfig, SinkConfig};
use chatguard_core::RetryPolicy;
use chatguard_stages::{HeuristicConfig, MediaConfig, StageSettings, StageSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Analysis stages, one topic each
    #[serde(default = "default_stages")]
    pub stages: Vec<StageSpec>,

    /// Backoff shared by every external hop
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-stage worker tuning
    #[serde(default)]
    pub stage_worker: StageWorkerConfig,

    #[serde(default)]
    pub arbiter: ArbiterConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            stages: default_stages(),
            retry: RetryPolicy::default(),
            stage_worker: StageWorkerConfig::default(),
            arbiter: ArbiterConfig::default(),
            enforcement: EnforcementConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<BackendKind>,
    pub redis_url: Option<String>,
    pub listen: Option<String>,
    pub port: Option<u16>,
}

impl AppConfig {
    /// Load configuration from file, environment and CLI overrides
    pub fn load(config_path: &str, overrides: &Overrides) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::new(config_path, config::FileFormat::Yaml));
        } else {
            tracing::warn!(path = config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("CHATGUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;
        config.apply(overrides);
        config.finalize()?;
        Ok(config)
    }

    /// Parse a YAML document without the environment layer
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(content)?;
        config.finalize()?;
        Ok(config)
    }

    fn apply(&mut self, overrides: &Overrides) {
        if let Some(backend) = overrides.backend {
            self.broker.backend = backend;
        }
        if let Some(url) = &overrides.redis_url {
            self.broker.redis_url = url.clone();
        }
        if let Some(listen) = &overrides.listen {
            self.server.listen = listen.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }

    /// Validate and fill derived values
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("at least one stage must be configured");
        }

        let mut seen = HashSet::new();
        for spec in &self.stages {
            if !seen.insert(spec.name()) {
                anyhow::bail!("duplicate stage name: {}", spec.name());
            }
        }

        if self.arbiter.expected_stages.is_empty() {
            self.arbiter.expected_stages = self.stage_names();
        } else if let Some(unknown) = self
            .arbiter
            .expected_stages
            .iter()
            .find(|name| !seen.contains(name.as_str()))
        {
            anyhow::bail!("expected stage '{}' is not configured", unknown);
        }

        if !(0.0..=1.0).contains(&self.arbiter.threshold) {
            anyhow::bail!("arbiter threshold must be within [0, 1]");
        }

        Ok(())
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn stage_settings(&self) -> StageSettings {
        StageSettings {
            retry: self.retry.clone(),
            call_timeout: Duration::from_millis(self.stage_worker.call_timeout_ms),
            poll_wait: self.broker.poll_wait(),
            max_deliveries: self.stage_worker.max_deliveries,
        }
    }
}

/// Which backend carries queues and shared state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process queues, single process only
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every topic and key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Bounded wait of each blocking pop (milliseconds)
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,

    /// Expiry of `decided` markers in seconds; unset keeps them forever
    #[serde(default)]
    pub decided_ttl_secs: Option<u64>,
}

impl BrokerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn decided_ttl(&self) -> Option<Duration> {
        self.decided_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: default_redis_url(),
            prefix: default_prefix(),
            poll_wait_ms: default_poll_wait_ms(),
            decided_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageWorkerConfig {
    /// Deadline for one analyzer call (milliseconds)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Deliveries before an envelope is answered with `uncertain`
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Workers per stage in `serve` mode
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

impl Default for StageWorkerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            max_deliveries: default_max_deliveries(),
            replicas: default_replicas(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Rules used when a submission carries none
    #[serde(default)]
    pub default_rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// In-flight request limit for the ingestion API
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::Heuristic {
            name: "heuristic".to_string(),
            settings: HeuristicConfig::default(),
        },
        StageSpec::MediaModel {
            name: "media".to_string(),
            settings: MediaConfig::default(),
        },
    ]
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_prefix() -> String {
    "chatguard".to_string()
}

fn default_poll_wait_ms() -> u64 {
    1_000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_replicas() -> usize {
    1
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_concurrent_requests() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatguard_arbiter::FallbackPolicy;
    use std::io::Write;

    const SAMPLE: &str = r#"
broker:
  backend: memory
  prefix: cg-test
  poll_wait_ms: 250
stages:
  - kind: heuristic
    name: heuristic
    settings:
      allowed_domains: [example.org]
  - kind: primary_model
    name: llm
    settings:
      endpoint: http://localhost:11434/v1
      model: llama3
arbiter:
  threshold: 0.6
  window_ms: 15000
  fallback: fail_closed
enforcement:
  sink:
    type: webhook
    url: http://mods.internal/report
server:
  port: 9090
"#;

    #[test]
    fn test_yaml_sections() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.broker.backend, BackendKind::Memory);
        assert_eq!(config.broker.prefix, "cg-test");
        assert_eq!(config.broker.poll_wait(), Duration::from_millis(250));
        assert_eq!(config.stage_names(), vec!["heuristic", "llm"]);
        assert_eq!(config.arbiter.fallback, FallbackPolicy::FailClosed);
        assert_eq!(config.arbiter.window_ms, 15_000);
        assert_eq!(config.server.port, 9090);
        assert!(matches!(config.enforcement.sink, SinkConfig::Webhook { .. }));
    }

    #[test]
    fn test_expected_stages_default_to_configured() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.arbiter.expected_stages, vec!["heuristic", "llm"]);
    }

    #[test]
    fn test_defaults() {
        let mut config = AppConfig::default();
        config.finalize().unwrap();

        assert_eq!(config.broker.backend, BackendKind::Redis);
        assert_eq!(config.stage_names(), vec!["heuristic", "media"]);
        assert_eq!(config.arbiter.window_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(matches!(config.enforcement.sink, SinkConfig::Log));
    }

    #[test]
    fn test_rejects_unknown_expected_stage() {
        let yaml = r#"
stages:
  - kind: heuristic
    name: heuristic
arbiter:
  expected_stages: [heuristic, vision]
"#;
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("vision"));
    }

    #[test]
    fn test_rejects_duplicate_stage_names() {
        let yaml = r#"
stages:
  - kind: heuristic
    name: rules
  - kind: heuristic
    name: rules
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_empty_stage_list() {
        assert!(AppConfig::from_yaml("stages: []").is_err());
    }

    #[test]
    fn test_load_file_with_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let overrides = Overrides {
            backend: Some(BackendKind::Redis),
            redis_url: Some("redis://cache:6380".to_string()),
            port: Some(7070),
            ..Overrides::default()
        };
        let config = AppConfig::load(file.path().to_str().unwrap(), &overrides).unwrap();

        assert_eq!(config.broker.backend, BackendKind::Redis);
        assert_eq!(config.broker.redis_url, "redis://cache:6380");
        assert_eq!(config.broker.prefix, "cg-test");
        assert_eq!(config.server.port, 7070);
        assert_eq!(config.stage_names(), vec!["heuristic", "llm"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load("/nonexistent/chatguard.yaml", &Overrides::default()).unwrap();
        assert_eq!(config.stage_names(), vec!["heuristic", "media"]);
    }

    #[test]
    fn test_example_config_parses() {
        let config = AppConfig::from_yaml(include_str!("../../../chatguard.example.yaml")).unwrap();
        assert_eq!(config.stage_names(), vec!["heuristic", "llm", "media"]);
        assert_eq!(config.arbiter.expected_stages.len(), 3);
        assert_eq!(config.ingest.default_rules.len(), 2);
    }

    #[test]
    fn test_stage_settings_follow_config() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let settings = config.stage_settings();

        assert_eq!(settings.poll_wait, Duration::from_millis(250));
        assert_eq!(settings.call_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_deliveries, 5);
    }
}
