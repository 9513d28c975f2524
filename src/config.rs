//! Executable pool configuration.
//!
//! Every knob is read once, when the pool is created. [`PoolConfig`] can be
//! deserialized from an embedder's own configuration file, and
//! [`PoolConfig::from_env`] applies `JITPOOL_*` environment overrides on top of
//! the defaults.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::admission::{
    AdmissionConfig, FailEveryNth, FuzzPolicy, NoFuzz, RandomFailure, DEFAULT_RESERVATION_FRACTION,
};
use crate::pages::Protection;

/// Default usable size of the pool.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_POOL_SIZE: usize = 128 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024 * 1024;

/// Complete pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// When false no memory is reserved and every allocation reports unavailable.
    pub enabled: bool,

    /// Usable bytes, rounded up to whole pages.
    pub size: usize,

    /// Bracket the pool with inaccessible pages.
    pub guard_pages: bool,

    /// Fraction of the pool only must-succeed requests may use.
    pub reservation_fraction: f64,

    /// Log a backtrace for every must-succeed request.
    pub report_must_succeed: bool,

    /// Fail every n-th can-fail request.
    pub fuzz_every: Option<u64>,

    /// Fail can-fail requests with this probability, seeded by `fuzz_seed`.
    /// Ignored when `fuzz_every` is set.
    pub fuzz_probability: Option<f64>,

    pub fuzz_seed: u64,

    pub protection: Protection,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            enabled: true,
            size: DEFAULT_POOL_SIZE,
            guard_pages: true,
            reservation_fraction: DEFAULT_RESERVATION_FRACTION,
            report_must_succeed: false,
            fuzz_every: None,
            fuzz_probability: None,
            fuzz_seed: 0,
            protection: Protection::ReadWriteExecute,
        }
    }
}

impl PoolConfig {
    /// Defaults with `JITPOOL_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        override_from(&lookup, "JITPOOL_ENABLED", &mut self.enabled);
        override_from(&lookup, "JITPOOL_SIZE", &mut self.size);
        override_from(&lookup, "JITPOOL_GUARD_PAGES", &mut self.guard_pages);
        override_from(&lookup, "JITPOOL_RESERVATION_FRACTION", &mut self.reservation_fraction);
        override_from(&lookup, "JITPOOL_REPORT_MUST_SUCCEED", &mut self.report_must_succeed);

        let mut every = 0u64;
        if override_from(&lookup, "JITPOOL_FUZZ_EVERY", &mut every) {
            self.fuzz_every = (every > 0).then_some(every);
        }
        let mut probability = 0.0f64;
        if override_from(&lookup, "JITPOOL_FUZZ_PROBABILITY", &mut probability) {
            self.fuzz_probability = Some(probability);
        }
        override_from(&lookup, "JITPOOL_FUZZ_SEED", &mut self.fuzz_seed);

        self.validated()
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_guard_pages(mut self, guard_pages: bool) -> Self {
        self.guard_pages = guard_pages;
        self
    }

    pub fn with_reservation_fraction(mut self, fraction: f64) -> Self {
        self.reservation_fraction = fraction;
        self.validated()
    }

    pub fn with_fuzz_every(mut self, n: u64) -> Self {
        self.fuzz_every = (n > 0).then_some(n);
        self
    }

    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            reservation_fraction: self.reservation_fraction,
            report_must_succeed: self.report_must_succeed,
        }
    }

    pub fn fuzz_policy(&self) -> Box<dyn FuzzPolicy> {
        match (self.fuzz_every, self.fuzz_probability) {
            (Some(n), _) if n > 0 => Box::new(FailEveryNth::new(n)),
            (None, Some(p)) if p > 0.0 => Box::new(RandomFailure::new(p, self.fuzz_seed)),
            _ => Box::new(NoFuzz),
        }
    }

    /// Replaces settings the admission controller can't work with. Applied on
    /// every path into a pool, including configs built through serde.
    pub fn validated(mut self) -> Self {
        let fraction = self.reservation_fraction;
        if !(0.0..1.0).contains(&fraction) {
            warn!(fraction, "Reservation fraction out of [0, 1), using the default.");
            self.reservation_fraction = DEFAULT_RESERVATION_FRACTION;
        }
        if self.fuzz_every == Some(0) {
            warn!("Fuzz period of 0, fuzzing disabled.");
            self.fuzz_every = None;
        }
        if let Some(p) = self.fuzz_probability {
            if !(0.0..=1.0).contains(&p) {
                warn!(probability = p, "Fuzz probability out of [0, 1], fuzzing disabled.");
                self.fuzz_probability = None;
            }
        }
        self
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.trim().parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => {
            warn!(key, %raw, "Ignoring unparsable pool setting.");
            false
        }
    }
}
