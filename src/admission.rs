//! Admission control and memory pressure.
//!
//! Callers declare how they cope with failure through [`Effort`]:
//! - [`Effort::CanFail`] requests may be refused up front, either by a
//!   [`FuzzPolicy`] (to exercise fallback paths in testing) or because they
//!   would push the pool past its ceiling. The ceiling keeps
//!   `reservation_fraction` of the pool in reserve for requests that can't fail.
//! - [`Effort::MustSucceed`] requests skip both checks. If the pool can't
//!   satisfy one, the process is aborted: there is no safe state to return to
//!   in the middle of code generation.

use std::backtrace::Backtrace;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use static_assertions::const_assert;
use tracing::{debug, error, info};

use crate::allocators::free_space::{OwnerTag, Statistics};
use crate::error::AllocError;

/// Fraction of the pool held back from [`Effort::CanFail`] requests.
pub const DEFAULT_RESERVATION_FRACTION: f64 = 0.25;

const_assert!(DEFAULT_RESERVATION_FRACTION >= 0.0 && DEFAULT_RESERVATION_FRACTION < 1.0);

/// How the caller copes with a failed allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Effort {
    /// The caller has a fallback, e.g. staying in the interpreter.
    CanFail,
    /// The caller has no fallback. Failure aborts the process.
    MustSucceed,
}

/// Decides whether a [`Effort::CanFail`] allocation should pretend to fail.
pub trait FuzzPolicy: Send + Sync + Debug {
    fn should_fail(&self, size: usize) -> bool;
}

/// Never fails anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFuzz;

impl FuzzPolicy for NoFuzz {
    #[inline]
    fn should_fail(&self, _size: usize) -> bool {
        false
    }
}

/// Fails every `n`-th consulted request, starting with the `n`-th.
#[derive(Debug)]
pub struct FailEveryNth {
    n: u64,
    seen: AtomicU64,
}

impl FailEveryNth {
    /// # Panics
    /// Panics if `n` is 0.
    pub fn new(n: u64) -> Self {
        assert!(n > 0, "FailEveryNth needs a nonzero period.");
        FailEveryNth { n, seen: AtomicU64::new(0) }
    }
}

impl FuzzPolicy for FailEveryNth {
    fn should_fail(&self, _size: usize) -> bool {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        seen % self.n == 0
    }
}

/// Fails each consulted request with a fixed probability, reproducibly for a given seed.
#[derive(Debug)]
pub struct RandomFailure {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomFailure {
    pub fn new(probability: f64, seed: u64) -> Self {
        RandomFailure {
            probability: probability.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl FuzzPolicy for RandomFailure {
    fn should_fail(&self, _size: usize) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_bool(self.probability)
    }
}

/// Settings fixed when the allocator is created.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdmissionConfig {
    pub reservation_fraction: f64,
    /// Log a backtrace for every [`Effort::MustSucceed`] request.
    pub report_must_succeed: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            reservation_fraction: DEFAULT_RESERVATION_FRACTION,
            report_must_succeed: false,
        }
    }
}

/// Counters reduced to what callers throttling JIT work want to know.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PressureState {
    pub under_pressure: bool,
    /// [`Statistics::pressure_multiplier`] with nothing added.
    pub multiplier: f64,
    /// Bytes [`Effort::CanFail`] requests may still take.
    pub headroom: usize,
}

impl Statistics {
    /// Whether more than half of the pool is in use.
    #[inline]
    pub fn under_memory_pressure(&self) -> bool {
        self.bytes_allocated > self.bytes_reserved / 2
    }

    /// Most bytes [`Effort::CanFail`] requests may bring the pool to.
    #[inline]
    pub fn ceiling(&self, reservation_fraction: f64) -> usize {
        (self.bytes_reserved as f64 * (1.0 - reservation_fraction)) as usize
    }

    /// `ceiling / (ceiling - projected)` where `projected` is the allocated
    /// byte count after `added` more bytes, clamped to the ceiling.
    ///
    /// The result is at least 1.0 and grows with `added`. At the ceiling the
    /// divisor is taken as one byte, the largest value the ratio can reach.
    pub fn pressure_multiplier(&self, added: usize, reservation_fraction: f64) -> f64 {
        let ceiling = self.ceiling(reservation_fraction);
        if ceiling == 0 {
            return 1.0;
        }
        let projected = self.bytes_allocated.saturating_add(added).min(ceiling);
        let divisor = (ceiling - projected).max(1);
        (ceiling as f64 / divisor as f64).max(1.0)
    }

    pub fn pressure(&self, reservation_fraction: f64) -> PressureState {
        PressureState {
            under_pressure: self.under_memory_pressure(),
            multiplier: self.pressure_multiplier(0, reservation_fraction),
            headroom: self.ceiling(reservation_fraction).saturating_sub(self.bytes_allocated),
        }
    }
}

/// Applies the [`Effort`] rules in front of the free-space allocator.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    fuzz: Box<dyn FuzzPolicy>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, fuzz: Box<dyn FuzzPolicy>) -> Self {
        debug_assert!(
            (0.0..1.0).contains(&config.reservation_fraction),
            "Reservation fraction should be in [0, 1)."
        );
        AdmissionController { config, fuzz }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    #[inline]
    pub fn reservation_fraction(&self) -> f64 {
        self.config.reservation_fraction
    }

    /// The checks that don't need the ledger: reporting and fuzzing.
    pub fn screen(&self, size: usize, owner: OwnerTag, effort: Effort) -> Result<(), AllocError> {
        match effort {
            Effort::MustSucceed => {
                if self.config.report_must_succeed {
                    info!(size, %owner, backtrace = %Backtrace::force_capture(), "Must-succeed executable allocation.");
                }
                Ok(())
            }
            Effort::CanFail => {
                if self.fuzz.should_fail(size) {
                    debug!(size, %owner, "Fuzz policy failed allocation.");
                    return Err(AllocError::FuzzDenied { requested: size });
                }
                Ok(())
            }
        }
    }

    /// Refuses [`Effort::CanFail`] requests whose requested size would take the
    /// pool past its ceiling. Must be called under the same lock as the
    /// allocation that follows it.
    pub fn check_ceiling(&self, requested: usize, stats: &Statistics, effort: Effort) -> Result<(), AllocError> {
        if effort == Effort::MustSucceed {
            return Ok(());
        }
        let projected = stats.bytes_allocated.saturating_add(requested);
        let ceiling = stats.ceiling(self.config.reservation_fraction);
        if projected > ceiling {
            debug!(requested, projected, ceiling, "Allocation denied by admission control.");
            return Err(AllocError::AdmissionDenied { requested, projected, ceiling });
        }
        Ok(())
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        AdmissionController::new(AdmissionConfig::default(), Box::new(NoFuzz))
    }
}

/// Ends the process after a [`Effort::MustSucceed`] allocation found no space.
#[cold]
pub(crate) fn executable_memory_exhausted(
    requested: usize,
    owner: OwnerTag,
    stats: &Statistics,
    breakdown: &[(OwnerTag, usize)],
    cause: &AllocError,
) -> ! {
    error!(
        requested,
        %owner,
        %cause,
        ?stats,
        ?breakdown,
        "Executable memory exhausted, aborting."
    );
    eprintln!(
        "fatal: executable memory exhausted: {requested} bytes for {owner} ({cause}); \
         allocated {} of {} bytes in {} allocations",
        stats.bytes_allocated, stats.bytes_reserved, stats.live_allocations
    );
    std::process::abort()
}
