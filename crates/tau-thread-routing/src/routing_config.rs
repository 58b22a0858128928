//! TOML configuration for the routing engine.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::decision_log::{DEFAULT_DECISION_QUERY_LIMIT, MAX_DECISION_QUERY_LIMIT};
use crate::identity_cache::{DEFAULT_IDENTITY_CACHE_MAX_ENTRIES, DEFAULT_IDENTITY_CACHE_TTL_SECONDS};
use crate::retry_sweeper::{
    RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_SECONDS,
    DEFAULT_SWEEP_INTERVAL_SECONDS,
};
use crate::strategies::text_signals::DEFAULT_MAX_KEYWORDS;
use crate::strategies::{
    DEFAULT_CANDIDATE_THREAD_LIMIT, DEFAULT_CONTEXT_MIN_SCORE, DEFAULT_METADATA_MIN_SCORE,
};

/// Upper bound for every duration setting: thirty days.
pub const MAX_DURATION_SETTING_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingEngineConfig {
    pub identity_cache_ttl_seconds: i64,
    pub identity_cache_max_entries: usize,
    pub candidate_thread_limit: usize,
    pub metadata_min_score: u32,
    pub context_min_score: u32,
    pub max_keywords: usize,
    pub max_retries: u32,
    pub retry_base_delay_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub create_thread_on_miss: bool,
    pub decision_query_default_limit: usize,
    pub decision_query_max_limit: usize,
}

impl Default for RoutingEngineConfig {
    fn default() -> Self {
        Self {
            identity_cache_ttl_seconds: DEFAULT_IDENTITY_CACHE_TTL_SECONDS,
            identity_cache_max_entries: DEFAULT_IDENTITY_CACHE_MAX_ENTRIES,
            candidate_thread_limit: DEFAULT_CANDIDATE_THREAD_LIMIT,
            metadata_min_score: DEFAULT_METADATA_MIN_SCORE,
            context_min_score: DEFAULT_CONTEXT_MIN_SCORE,
            max_keywords: DEFAULT_MAX_KEYWORDS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_seconds: DEFAULT_RETRY_BASE_DELAY_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            create_thread_on_miss: true,
            decision_query_default_limit: DEFAULT_DECISION_QUERY_LIMIT,
            decision_query_max_limit: MAX_DECISION_QUERY_LIMIT,
        }
    }
}

impl RoutingEngineConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("identity_cache_ttl_seconds", self.identity_cache_ttl_seconds),
            ("retry_base_delay_seconds", self.retry_base_delay_seconds),
            (
                "sweep_interval_seconds",
                i64::try_from(self.sweep_interval_seconds).unwrap_or(i64::MAX),
            ),
        ] {
            if !(1..=MAX_DURATION_SETTING_SECONDS).contains(&value) {
                bail!("{field} must be between 1 and {MAX_DURATION_SETTING_SECONDS}, got {value}");
            }
        }
        for (field, value) in [
            (
                "identity_cache_max_entries",
                self.identity_cache_max_entries as u64,
            ),
            ("candidate_thread_limit", self.candidate_thread_limit as u64),
            ("metadata_min_score", u64::from(self.metadata_min_score)),
            ("context_min_score", u64::from(self.context_min_score)),
            ("max_keywords", self.max_keywords as u64),
            ("max_retries", u64::from(self.max_retries)),
            (
                "decision_query_default_limit",
                self.decision_query_default_limit as u64,
            ),
            ("decision_query_max_limit", self.decision_query_max_limit as u64),
        ] {
            if value == 0 {
                bail!("{field} must be greater than 0");
            }
        }
        if self.decision_query_default_limit > self.decision_query_max_limit {
            bail!(
                "decision_query_default_limit ({}) exceeds decision_query_max_limit ({})",
                self.decision_query_default_limit,
                self.decision_query_max_limit
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: bounded_seconds(self.retry_base_delay_seconds),
        }
    }

    pub fn identity_cache_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.identity_cache_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.sweep_interval_seconds
                .clamp(1, MAX_DURATION_SETTING_SECONDS.unsigned_abs()),
        )
    }
}

/// Values that skipped [`RoutingEngineConfig::validate`] are clamped into range.
fn bounded_seconds(seconds: i64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.clamp(1, MAX_DURATION_SETTING_SECONDS))
}

pub fn parse_routing_engine_config(raw: &str) -> Result<RoutingEngineConfig> {
    let config =
        toml::from_str::<RoutingEngineConfig>(raw).context("failed to parse routing config")?;
    config.validate()?;
    Ok(config)
}

/// Loads `path`, falling back to defaults when the file does not exist.
pub fn load_routing_engine_config(path: &Path) -> Result<RoutingEngineConfig> {
    if !path.exists() {
        return Ok(RoutingEngineConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read routing config {}", path.display()))?;
    parse_routing_engine_config(&raw)
        .with_context(|| format!("invalid routing config {}", path.display()))
}
