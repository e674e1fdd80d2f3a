//! Building analyzers from configuration

use crate::analyzer::Analyzer;
use crate::config::StageSpec;
use crate::heuristic::HeuristicAnalyzer;
use crate::media::MediaAnalyzer;
use crate::model::ModelAnalyzer;
use chatguard_core::{Error, Result};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Instantiate the analyzer for one stage.
///
/// Remote analyzers share the given HTTP client (connection pool) but keep
/// their own endpoint and credentials.
pub fn build_analyzer(spec: &StageSpec, client: &Client) -> Result<Arc<dyn Analyzer>> {
    let analyzer: Arc<dyn Analyzer> = match spec {
        StageSpec::Heuristic { name, settings } => Arc::new(HeuristicAnalyzer::new(name, settings)?),
        StageSpec::PrimaryModel { name, settings } | StageSpec::SecondaryModel { name, settings } => {
            Arc::new(ModelAnalyzer::new(name, spec.kind(), settings, client.clone())?)
        }
        StageSpec::MediaModel { name, settings } => {
            Arc::new(MediaAnalyzer::new(name, settings, client.clone())?)
        }
    };
    Ok(analyzer)
}

/// Instantiate every configured stage, rejecting empty or duplicate names
pub fn build_analyzers(specs: &[StageSpec], client: &Client) -> Result<Vec<Arc<dyn Analyzer>>> {
    if specs.is_empty() {
        return Err(Error::config("at least one stage must be configured"));
    }

    let mut seen = HashSet::new();
    for spec in specs {
        let name = spec.name();
        if name.trim().is_empty() {
            return Err(Error::config("stage name must not be empty"));
        }
        if !seen.insert(name) {
            return Err(Error::config(format!("duplicate stage name: {}", name)));
        }
    }

    let analyzers = specs
        .iter()
        .map(|spec| build_analyzer(spec, client))
        .collect::<Result<Vec<_>>>()?;

    info!(
        stages = ?analyzers.iter().map(|a| a.name()).collect::<Vec<_>>(),
        "Initialized {} analyzers",
        analyzers.len()
    );
    Ok(analyzers)
}
