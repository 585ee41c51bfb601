//! Capacity catalog.
//!
//! Holds the most recent listing of purchasable offerings. Each refresh
//! publishes a new immutable [`CatalogSnapshot`]; the generation only moves
//! when the content (shapes, zones, prices) actually changes, so pods that
//! fit no offering are not re-simulated until something new is on sale.
//!
//! Offerings that just failed to launch are parked in
//! [`UnavailableOfferings`] for a TTL.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use flotilla_reconcile::Fingerprint;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cloudprovider::{CloudProvider, CloudProviderError};
use crate::config::CatalogConfig;
use crate::constraints::{labels, Labels, Requirements};
use crate::resources::Resources;

/// Purchase option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    OnDemand,
    Spot,
}

impl CapacityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityType::OnDemand => "on-demand",
            CapacityType::Spot => "spot",
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies an offering independent of price and freshness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OfferingKey {
    pub shape: String,
    pub zone: String,
    pub capacity_type: CapacityType,
}

impl fmt::Display for OfferingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.shape, self.zone, self.capacity_type)
    }
}

/// A purchasable shape in one zone under one purchase option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    pub shape: String,
    pub capacity: Resources,
    /// Capacity left for pods after system overhead.
    pub allocatable: Resources,
    pub zone: String,
    pub capacity_type: CapacityType,
    /// Price per hour.
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

impl Offering {
    pub fn key(&self) -> OfferingKey {
        OfferingKey {
            shape: self.shape.clone(),
            zone: self.zone.clone(),
            capacity_type: self.capacity_type,
        }
    }

    /// Labels a node launched from this offering will carry.
    pub fn labels(&self) -> Labels {
        Labels::from([
            (labels::ZONE.to_string(), self.zone.clone()),
            (labels::INSTANCE_SHAPE.to_string(), self.shape.clone()),
            (
                labels::CAPACITY_TYPE.to_string(),
                self.capacity_type.to_string(),
            ),
        ])
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.observed_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Deterministic price order: price, then key.
    pub fn cheaper_than(&self, other: &Offering) -> std::cmp::Ordering {
        self.price
            .total_cmp(&other.price)
            .then_with(|| self.key().cmp(&other.key()))
    }
}

/// Content of an offering that drives the catalog generation.
#[derive(Serialize)]
struct OfferingContent<'a> {
    key: OfferingKey,
    allocatable: &'a Resources,
    price: f64,
}

/// Immutable view of the catalog at one refresh.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    offerings: Vec<Offering>,
}

impl CatalogSnapshot {
    /// Offerings are kept in key order.
    pub fn new(generation: u64, mut offerings: Vec<Offering>) -> Self {
        offerings.sort_by_key(Offering::key);
        Self {
            generation,
            offerings,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn offerings(&self) -> &[Offering] {
        &self.offerings
    }

    pub fn is_empty(&self) -> bool {
        self.offerings.is_empty()
    }

    pub fn zones(&self) -> BTreeSet<String> {
        self.offerings.iter().map(|o| o.zone.clone()).collect()
    }

    pub fn find(&self, key: &OfferingKey) -> Option<&Offering> {
        self.offerings
            .binary_search_by(|o| o.key().cmp(key))
            .ok()
            .map(|i| &self.offerings[i])
    }

    /// Same generation, subset of offerings.
    pub fn filtered(&self, keep: impl Fn(&Offering) -> bool) -> Self {
        Self {
            generation: self.generation,
            offerings: self.offerings.iter().filter(|o| keep(o)).cloned().collect(),
        }
    }

    fn content_fingerprint(&self) -> Option<Fingerprint> {
        let content: Vec<_> = self
            .offerings
            .iter()
            .map(|o| OfferingContent {
                key: o.key(),
                allocatable: &o.allocatable,
                price: o.price,
            })
            .collect();
        Fingerprint::of(&content).ok()
    }
}

/// Offerings that recently failed to launch.
#[derive(Debug)]
pub struct UnavailableOfferings {
    ttl: Duration,
    entries: Mutex<BTreeMap<OfferingKey, Instant>>,
}

impl UnavailableOfferings {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mark(&self, key: OfferingKey) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        info!(offering = %key, ttl_secs = self.ttl.as_secs(), "Marking offering unavailable");
        entries.insert(key, Instant::now() + self.ttl);
    }

    pub fn is_unavailable(&self, key: &OfferingKey) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).is_some_and(|until| *until > Instant::now())
    }

    /// Currently unavailable offerings; expired entries are dropped.
    pub fn active(&self) -> BTreeSet<OfferingKey> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, until| *until > now);
        entries.keys().cloned().collect()
    }
}

/// The capacity catalog.
pub struct CapacityCatalog {
    provider: Arc<dyn CloudProvider>,
    config: CatalogConfig,
    current: ArcSwap<CatalogSnapshot>,
    content: Mutex<Option<Fingerprint>>,
    unavailable: UnavailableOfferings,
}

impl CapacityCatalog {
    pub fn new(provider: Arc<dyn CloudProvider>, config: CatalogConfig) -> Self {
        Self {
            unavailable: UnavailableOfferings::new(config.unavailable_ttl),
            provider,
            config,
            current: ArcSwap::from_pointee(CatalogSnapshot::default()),
            content: Mutex::new(None),
        }
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    /// Offerings still usable for simulation: within the stale grace window.
    pub fn usable(&self, now: DateTime<Utc>) -> CatalogSnapshot {
        let max_age = self.config.stale_after() + self.config.stale_grace;
        self.snapshot().filtered(|o| o.age(now) <= max_age)
    }

    /// Offerings fresh enough to base cost decisions on.
    pub fn fresh(&self, now: DateTime<Utc>) -> CatalogSnapshot {
        let max_age = self.config.stale_after();
        self.snapshot().filtered(|o| o.age(now) <= max_age)
    }

    pub fn unavailable(&self) -> &UnavailableOfferings {
        &self.unavailable
    }

    /// List offerings and publish a new snapshot. Returns the generation.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<u64, CloudProviderError> {
        let offerings = self.provider.list_offerings(&Requirements::default()).await?;
        let previous = self.snapshot();

        let candidate = CatalogSnapshot::new(previous.generation(), offerings);
        let fingerprint = candidate.content_fingerprint();

        let mut content = self.content.lock().unwrap_or_else(|e| e.into_inner());
        let changed = fingerprint.is_none() || *content != fingerprint;
        let generation = if changed {
            previous.generation() + 1
        } else {
            previous.generation()
        };
        *content = fingerprint;

        let count = candidate.offerings.len();
        self.current
            .store(Arc::new(CatalogSnapshot::new(generation, candidate.offerings)));

        if changed {
            info!(generation, offerings = count, "Catalog changed");
        } else {
            debug!(generation, offerings = count, "Catalog refreshed");
        }

        Ok(generation)
    }

    /// Refresh on an interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            refresh_interval_secs = self.config.refresh_interval.as_secs(),
            "Starting catalog refresher"
        );

        let mut interval = tokio::time::interval(self.config.refresh_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Catalog refresh failed, keeping previous offerings");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Catalog refresher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
