//! Environment-style settings consumed by the worker loops.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

/// Runtime knobs for the pipeline workers. Every knob has a default and an
/// environment override; malformed values fall back to the default with a
/// warning rather than aborting startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Master switch for the incremental analysis worker.
    pub incremental_enabled: bool,
    /// A Completed warehouse becomes eligible for re-analysis once its
    /// document has not been refreshed for this many days.
    pub staleness_days: u64,
    /// Idle sleep of the ingestion and analysis poll loops.
    pub poll_interval: Duration,
    /// Extra sleep after a warehouse-level failure, so one bad repository
    /// cannot spin the loop.
    pub error_cooldown: Duration,
    /// Idle sleep of the knowledge-map poll loop.
    pub minimap_idle: Duration,
    /// Upper bound on a single streamed LLM completion.
    pub llm_timeout: Duration,
    /// Retry policy around the LLM call + parse step.
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            incremental_enabled: true,
            staleness_days: 5,
            poll_interval: Duration::from_secs(5),
            error_cooldown: Duration::from_secs(10),
            minimap_idle: Duration::from_secs(10),
            llm_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Unparsable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}

impl Settings {
    /// Load settings from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let settings = Settings {
            incremental_enabled: env_parse(
                "REPO_WIKI_INCREMENTAL_ENABLED",
                defaults.incremental_enabled,
            ),
            staleness_days: env_parse("REPO_WIKI_STALENESS_DAYS", defaults.staleness_days),
            poll_interval: Duration::from_secs(env_parse(
                "REPO_WIKI_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            error_cooldown: Duration::from_secs(env_parse(
                "REPO_WIKI_ERROR_COOLDOWN_SECS",
                defaults.error_cooldown.as_secs(),
            )),
            minimap_idle: Duration::from_secs(env_parse(
                "REPO_WIKI_MINIMAP_IDLE_SECS",
                defaults.minimap_idle.as_secs(),
            )),
            llm_timeout: Duration::from_secs(env_parse(
                "REPO_WIKI_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )),
            retry: defaults.retry,
        };
        settings.trace_loaded();
        settings
    }

    pub fn trace_loaded(&self) {
        info!(
            incremental_enabled = self.incremental_enabled,
            staleness_days = self.staleness_days,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Loaded Settings"
        );
        debug!(?self, "Settings loaded (full debug)");
    }

    /// When a document counts as stale for the incremental check.
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days as i64)
    }
}
