//! Configuration for the controller.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use flotilla_reconcile::{
    BackoffPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RETRY_WINDOW,
};

use crate::scheduling::ProposalOrdering;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Quiet period that closes a provisioning batch.
    pub batch_idle: Duration,

    /// Longest a provisioning batch stays open.
    pub batch_max: Duration,

    /// Interval between consolidation evaluations.
    pub consolidation_interval: Duration,

    /// How long a consolidation decision must hold before it is executed.
    pub consolidation_validation: Duration,

    /// Interval between catalog refreshes.
    pub catalog_refresh: Duration,

    /// How long stale offerings remain usable for simulation.
    pub catalog_stale_grace: Duration,

    /// How long an offering that failed to launch is skipped.
    pub unavailable_offering_ttl: Duration,

    /// Launch attempts per proposal before giving up.
    pub launch_max_attempts: u32,

    /// How long a launched node may take to register.
    pub registration_ttl: Duration,

    /// Interval between termination passes.
    pub termination_interval: Duration,

    /// How long deleted objects are remembered to reject replayed events.
    pub tombstone_ttl: Duration,

    /// Tie-break between node count and price.
    pub proposal_ordering: ProposalOrdering,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_idle: Duration::from_millis(1000),
            batch_max: Duration::from_millis(10_000),
            consolidation_interval: DEFAULT_RECONCILE_INTERVAL,
            consolidation_validation: Duration::from_secs(15),
            catalog_refresh: Duration::from_secs(300),
            catalog_stale_grace: Duration::from_secs(900),
            unavailable_offering_ttl: Duration::from_secs(180),
            launch_max_attempts: 3,
            registration_ttl: Duration::from_secs(900),
            termination_interval: Duration::from_secs(5),
            tombstone_ttl: Duration::from_secs(600),
            proposal_ordering: ProposalOrdering::CountThenPrice,
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let proposal_ordering = match std::env::var("FLOTILLA_PROPOSAL_ORDERING") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("invalid FLOTILLA_PROPOSAL_ORDERING: {value}"))?,
            Err(_) => defaults.proposal_ordering,
        };

        let launch_max_attempts = env_or("FLOTILLA_LAUNCH_MAX_ATTEMPTS", defaults.launch_max_attempts);
        if launch_max_attempts == 0 {
            anyhow::bail!("FLOTILLA_LAUNCH_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            batch_idle: Duration::from_millis(env_or("FLOTILLA_BATCH_IDLE_MS", 1000)),
            batch_max: Duration::from_millis(env_or("FLOTILLA_BATCH_MAX_MS", 10_000)),
            consolidation_interval: Duration::from_secs(env_or(
                "FLOTILLA_CONSOLIDATION_INTERVAL_SECS",
                defaults.consolidation_interval.as_secs(),
            )),
            consolidation_validation: Duration::from_secs(env_or(
                "FLOTILLA_CONSOLIDATION_VALIDATION_SECS",
                15,
            )),
            catalog_refresh: Duration::from_secs(env_or("FLOTILLA_CATALOG_REFRESH_SECS", 300)),
            catalog_stale_grace: Duration::from_secs(env_or(
                "FLOTILLA_CATALOG_STALE_GRACE_SECS",
                900,
            )),
            unavailable_offering_ttl: Duration::from_secs(env_or(
                "FLOTILLA_UNAVAILABLE_OFFERING_TTL_SECS",
                180,
            )),
            launch_max_attempts,
            registration_ttl: Duration::from_secs(env_or("FLOTILLA_REGISTRATION_TTL_SECS", 900)),
            termination_interval: Duration::from_secs(env_or(
                "FLOTILLA_TERMINATION_INTERVAL_SECS",
                5,
            )),
            tombstone_ttl: Duration::from_secs(env_or("FLOTILLA_TOMBSTONE_TTL_SECS", 600)),
            proposal_ordering,
            log_level: std::env::var("FLOTILLA_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            idle: self.batch_idle,
            max: self.batch_max,
        }
    }

    pub fn provisioner(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            ordering: self.proposal_ordering,
            launch_max_attempts: self.launch_max_attempts,
            ..Default::default()
        }
    }

    pub fn consolidation(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            interval: self.consolidation_interval,
            validation_period: self.consolidation_validation,
            ordering: self.proposal_ordering,
            ..Default::default()
        }
    }

    pub fn termination(&self) -> TerminationConfig {
        TerminationConfig {
            interval: self.termination_interval,
            registration_ttl: self.registration_ttl,
            tombstone_ttl: self.tombstone_ttl,
            ..Default::default()
        }
    }

    pub fn catalog(&self) -> CatalogConfig {
        CatalogConfig {
            refresh_interval: self.catalog_refresh,
            stale_grace: self.catalog_stale_grace,
            unavailable_ttl: self.unavailable_offering_ttl,
        }
    }
}

/// Provisioning batch windows.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub idle: Duration,
    pub max: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

/// Provisioning loop configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub ordering: ProposalOrdering,

    /// Launch attempts per proposal.
    pub launch_max_attempts: u32,

    /// Delay between launch attempts.
    pub launch_backoff: BackoffPolicy,

    /// How long a node that pods are expected to land on is protected
    /// from consolidation.
    pub nomination_ttl: Duration,

    /// Interval at which pending pods are re-evaluated without a trigger.
    pub resync_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            ordering: ProposalOrdering::CountThenPrice,
            launch_max_attempts: 3,
            launch_backoff: BackoffPolicy::default(),
            nomination_ttl: Duration::from_secs(20),
            resync_interval: Duration::from_secs(30),
        }
    }
}

/// Consolidation engine configuration.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    pub interval: Duration,
    pub validation_period: Duration,
    pub ordering: ProposalOrdering,

    /// Upper bound on nodes considered together.
    pub max_multi_node_candidates: usize,

    /// How long a replacement node is protected from consolidation.
    pub nomination_ttl: Duration,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONCILE_INTERVAL,
            validation_period: Duration::from_secs(15),
            ordering: ProposalOrdering::CountThenPrice,
            max_multi_node_candidates: 100,
            nomination_ttl: Duration::from_secs(60),
        }
    }
}

/// Termination worker configuration.
#[derive(Debug, Clone)]
pub struct TerminationConfig {
    pub interval: Duration,

    /// Provisional nodes older than this are rolled back.
    pub registration_ttl: Duration,

    /// Failed drain or terminate attempts before a node is released.
    pub max_retries: u32,
    pub retry_window: Duration,

    /// Deletions older than this are forgotten by the tracker.
    pub tombstone_ttl: Duration,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            registration_ttl: Duration::from_secs(900),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
            tombstone_ttl: Duration::from_secs(600),
        }
    }
}

/// Capacity catalog configuration.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub refresh_interval: Duration,
    pub stale_grace: Duration,
    pub unavailable_ttl: Duration,
}

impl CatalogConfig {
    /// Offerings older than this missed a refresh and are stale.
    pub fn stale_after(&self) -> Duration {
        self.refresh_interval * 2
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            stale_grace: Duration::from_secs(900),
            unavailable_ttl: Duration::from_secs(180),
        }
    }
}
