//! The per-runtime owner of the executable pool.
//!
//! A runtime creates one [`ExecutableMemory`] during startup, initializes it
//! once, and passes references to it to whatever generates code. Independent
//! runtimes in the same process each own their own pool.

use tracing::{info, instrument, Level};

use crate::admission::{AdmissionController, Effort, PressureState};
use crate::allocators::free_space::{OwnerTag, Statistics};
use crate::allocators::{ExecutableAllocator, ExecutableMemoryHandle};
use crate::config::PoolConfig;
use crate::error::{AllocError, InitError};
use crate::pages::{MmapPages, PageCapabilities, PageProvider};
use crate::pool::{MemoryPool, PoolDescriptor};

/// True in builds where executable JIT memory is categorically forbidden.
pub const JIT_RESTRICTED: bool = cfg!(feature = "restricted");

enum State<P: PageProvider> {
    Uninitialized,
    /// JIT is off, by configuration or by build.
    Disabled,
    Ready(ExecutableAllocator<P>),
    ShutDown,
}

/// Lifecycle wrapper around the runtime's [`ExecutableAllocator`].
///
/// Until [`initialize`](ExecutableMemory::initialize) succeeds, and forever when
/// JIT is disabled, every allocation reports [`AllocError::Unavailable`] and the
/// pressure queries report an idle pool.
pub struct ExecutableMemory<P: PageProvider = MmapPages> {
    state: State<P>,
    reservation_fraction: f64,
}

impl<P: PageProvider> Default for ExecutableMemory<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableMemory<MmapPages> {
    /// Reserves the pool with the native `mmap` provider.
    pub fn initialize(&mut self, config: &PoolConfig) -> Result<(), InitError> {
        let provider = MmapPages::new(PageCapabilities::native(), config.protection);
        self.initialize_with(config, provider)
    }
}

impl<P: PageProvider> ExecutableMemory<P> {
    pub const fn new() -> Self {
        ExecutableMemory {
            state: State::Uninitialized,
            reservation_fraction: 0.0,
        }
    }

    /// Reserves the pool from `provider` and sets up the allocator.
    ///
    /// # Panics
    /// Panics in debug builds when called more than once.
    #[instrument(level = "info", skip(self, provider), err(Debug, level = Level::ERROR))]
    pub fn initialize_with(&mut self, config: &PoolConfig, provider: P) -> Result<(), InitError> {
        debug_assert!(
            matches!(self.state, State::Uninitialized),
            "Executable memory should be initialized only once."
        );
        if !matches!(self.state, State::Uninitialized) {
            return Err(InitError::AlreadyInitialized);
        }

        let config = config.clone().validated();
        self.reservation_fraction = config.reservation_fraction;

        if JIT_RESTRICTED || !config.enabled {
            info!(restricted = JIT_RESTRICTED, "JIT disabled, skipping executable pool reservation.");
            self.state = State::Disabled;
            return Ok(());
        }

        let pool = MemoryPool::create(config.size, provider, config.guard_pages)?;
        let admission = AdmissionController::new(config.admission(), config.fuzz_policy());
        self.state = State::Ready(ExecutableAllocator::new(pool, admission));
        Ok(())
    }

    /// Whether a pool is reserved and accepting allocations.
    pub fn is_valid(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    pub fn is_jit_disabled(&self) -> bool {
        matches!(self.state, State::Disabled)
    }

    pub fn allocator(&self) -> Option<&ExecutableAllocator<P>> {
        match &self.state {
            State::Ready(allocator) => Some(allocator),
            _ => None,
        }
    }

    /// See [`ExecutableAllocator::allocate`]. Without a pool even
    /// [`Effort::MustSucceed`] requests report [`AllocError::Unavailable`].
    pub fn allocate(
        &self,
        size: usize,
        owner: OwnerTag,
        effort: Effort,
    ) -> Result<ExecutableMemoryHandle<P>, AllocError> {
        match &self.state {
            State::Ready(allocator) => allocator.allocate(size, owner, effort),
            _ => Err(AllocError::Unavailable),
        }
    }

    pub fn statistics(&self) -> Statistics {
        self.allocator().map(ExecutableAllocator::statistics).unwrap_or_default()
    }

    pub fn under_memory_pressure(&self) -> bool {
        self.statistics().under_memory_pressure()
    }

    pub fn pressure_multiplier(&self, added: usize) -> f64 {
        match self.allocator() {
            Some(allocator) => allocator.pressure_multiplier(added),
            None => 1.0,
        }
    }

    pub fn pressure(&self) -> PressureState {
        self.statistics().pressure(self.reservation_fraction)
    }

    /// Descriptor for handing the pool to a second process.
    pub fn descriptor(&self) -> Option<PoolDescriptor> {
        self.allocator().map(ExecutableAllocator::descriptor)
    }

    /// Whether `addr` lies within the pool.
    pub fn contains(&self, addr: usize) -> bool {
        self.allocator().is_some_and(|a| a.contains(addr))
    }

    /// Tears the subsystem down. The reservation is released once the last
    /// outstanding handle is dropped.
    #[instrument(level = "info", skip(self))]
    pub fn shutdown(&mut self) {
        if let State::Ready(allocator) = std::mem::replace(&mut self.state, State::ShutDown) {
            info!(statistics = ?allocator.statistics(), "Shutting down executable memory.");
        }
    }
}

impl<P: PageProvider> Drop for ExecutableMemory<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
