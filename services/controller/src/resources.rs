//! Resource vectors.
//!
//! Every quantity the scheduler packs against lives in [`Resources`]: CPU in
//! millicores, memory and ephemeral storage in bytes, whole GPUs and pod
//! slots. Arithmetic saturates so remaining capacity can never go negative.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// A closed vector of schedulable resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in millicores.
    pub cpu_millis: u64,

    /// Memory in bytes.
    pub memory_bytes: u64,

    /// Whole GPUs.
    #[serde(default)]
    pub gpus: u64,

    /// Ephemeral storage in bytes.
    #[serde(default)]
    pub ephemeral_bytes: u64,

    /// Pod slots.
    #[serde(default)]
    pub pods: u64,
}

impl Resources {
    /// The empty vector.
    pub const ZERO: Self = Self {
        cpu_millis: 0,
        memory_bytes: 0,
        gpus: 0,
        ephemeral_bytes: 0,
        pods: 0,
    };

    /// CPU and memory only.
    pub const fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            gpus: 0,
            ephemeral_bytes: 0,
            pods: 0,
        }
    }

    /// Whole cores and GiB of memory.
    pub const fn cores_gib(cores: u64, memory_gib: u64) -> Self {
        Self::new(cores * 1000, memory_gib * GIB)
    }

    pub const fn with_gpus(mut self, gpus: u64) -> Self {
        self.gpus = gpus;
        self
    }

    pub const fn with_ephemeral(mut self, bytes: u64) -> Self {
        self.ephemeral_bytes = bytes;
        self
    }

    pub const fn with_pods(mut self, pods: u64) -> Self {
        self.pods = pods;
        self
    }

    fn dimensions(&self) -> [u64; 5] {
        [
            self.cpu_millis,
            self.memory_bytes,
            self.gpus,
            self.ephemeral_bytes,
            self.pods,
        ]
    }

    fn zip_with(&self, other: &Self, f: impl Fn(u64, u64) -> u64) -> Self {
        Self {
            cpu_millis: f(self.cpu_millis, other.cpu_millis),
            memory_bytes: f(self.memory_bytes, other.memory_bytes),
            gpus: f(self.gpus, other.gpus),
            ephemeral_bytes: f(self.ephemeral_bytes, other.ephemeral_bytes),
            pods: f(self.pods, other.pods),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.dimensions().iter().all(|v| *v == 0)
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        self.zip_with(other, u64::saturating_add)
    }

    /// Subtraction clamped at zero in every dimension.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        self.zip_with(other, u64::saturating_sub)
    }

    /// Per-dimension maximum.
    pub fn max(&self, other: &Self) -> Self {
        self.zip_with(other, u64::max)
    }

    /// Returns true if every dimension of `self` is within `capacity`.
    pub fn fits(&self, capacity: &Self) -> bool {
        self.dimensions()
            .iter()
            .zip(capacity.dimensions())
            .all(|(need, have)| *need <= have)
    }

    /// Returns true if `self` stays within every dimension `limits` bounds.
    ///
    /// Zero dimensions of `limits` are unbounded.
    pub fn within(&self, limits: &Self) -> bool {
        self.dimensions()
            .iter()
            .zip(limits.dimensions())
            .all(|(used, limit)| limit == 0 || *used <= limit)
    }

    /// Names of the dimensions where `self` exceeds `capacity`.
    pub fn exceeded(&self, capacity: &Self) -> Vec<&'static str> {
        const NAMES: [&str; 5] = ["cpu", "memory", "gpu", "ephemeral-storage", "pods"];
        self.dimensions()
            .iter()
            .zip(capacity.dimensions())
            .zip(NAMES)
            .filter(|((need, have), _)| **need > *have)
            .map(|(_, name)| name)
            .collect()
    }

    /// Normalized leftover after placing `request` into `self`.
    ///
    /// Sum over dimensions of `(self - request) / self`; dimensions with no
    /// capacity are skipped. Lower means tighter packing.
    pub fn waste_after(&self, request: &Self) -> f64 {
        self.dimensions()
            .iter()
            .zip(request.dimensions())
            .filter(|(have, _)| **have > 0)
            .map(|(have, need)| have.saturating_sub(need) as f64 / *have as f64)
            .sum()
    }

    /// How many copies of `demand` fit into `self`, as a fraction.
    ///
    /// Minimum over the dimensions that `demand` actually requests. Returns
    /// `f64::INFINITY` for an empty demand.
    pub fn coverage_of(&self, demand: &Self) -> f64 {
        self.dimensions()
            .iter()
            .zip(demand.dimensions())
            .filter(|(_, need)| *need > 0)
            .map(|(have, need)| *have as f64 / need as f64)
            .fold(f64::INFINITY, f64::min)
    }

    /// Size of `self` relative to `reference`, summed across dimensions.
    ///
    /// Used to order pods largest first.
    pub fn footprint(&self, reference: &Self) -> f64 {
        self.dimensions()
            .iter()
            .zip(reference.dimensions())
            .filter(|(_, r)| *r > 0)
            .map(|(v, r)| *v as f64 / r as f64)
            .sum()
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(&rhs)
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(&rhs)
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Resources::ZERO, |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Self {
        iter.fold(Resources::ZERO, |acc, r| acc + *r)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m memory={}Mi",
            self.cpu_millis,
            self.memory_bytes / MIB
        )?;
        if self.gpus > 0 {
            write!(f, " gpu={}", self.gpus)?;
        }
        if self.ephemeral_bytes > 0 {
            write!(f, " ephemeral={}Mi", self.ephemeral_bytes / MIB)?;
        }
        if self.pods > 0 {
            write!(f, " pods={}", self.pods)?;
        }
        Ok(())
    }
}
