//! A fixed-size executable memory pool for JIT compilers.
//!
//! The crate manages the memory JIT-compiled code lives in. It never generates
//! code itself, it hands out spans of a pool reserved once at startup and keeps
//! track of which physical pages those spans need.
//!
//! # Usage
//! A runtime owns one [`ExecutableMemory`], initializes it during startup and
//! passes references to it to its compiler threads.
//! ```no_run
//! use rusty_jitpool::{Effort, ExecutableMemory, OwnerTag, PoolConfig};
//!
//! struct Vm {
//!     executable_memory: ExecutableMemory,
//! }
//!
//! let mut vm = Vm { executable_memory: ExecutableMemory::new() };
//! vm.executable_memory
//!     .initialize(&PoolConfig::from_env())
//!     .expect("executable memory is required in this build");
//!
//! match vm.executable_memory.allocate(512, OwnerTag::new("baseline"), Effort::CanFail) {
//!     Ok(handle) => println!("emit code at {:p}", handle.start()),
//!     Err(e) => println!("staying in the interpreter: {e}"),
//! }
//! ```
//!
//! # Mode of operation
//! Below is a list of the layers an allocation passes through, top to bottom:
//!
//! ## Admission
//! Every request declares an [`Effort`]. [`Effort::CanFail`] requests can be
//! refused before the allocator is even consulted, either by a fuzz policy that
//! exercises the caller's fallback path, or because they would bring the pool
//! past its ceiling: a fixed fraction of the pool is held back for
//! [`Effort::MustSucceed`] requests. A must-succeed request the pool can't
//! satisfy aborts the process.
//!
//! ## Free space
//! The [`FreeSpaceAllocator`] rounds every request up to a 32 byte granule and
//! takes the first free span large enough for it. Freed spans are merged with
//! their neighbours immediately. Unlike a general purpose heap it keeps no
//! metadata inside the pool, so pages can be decommitted freely. The pool is
//! closed: when no span fits, allocation fails rather than growing the reservation.
//!
//! ## Pages
//! Each page of the pool knows how many live spans touch it. The first span
//! to touch a page commits it and the last one to leave releases its backing
//! to the OS while the address stays reserved.
//!
//! ## Reservation
//! The [`MemoryPool`] is a single reservation that never moves or grows.
//! Optional guard pages on both sides fault on any access. All operating system
//! calls go through a [`PageProvider`] whose [`PageCapabilities`] say whether
//! pages are committed explicitly or on first touch, and released by advice or
//! by explicit decommit.
//!
//! # Concurrency
//! The [`ExecutableAllocator`] serializes all ledger updates behind one mutex.
//! The admission ceiling is checked under the same lock as the allocation it
//! guards. Handles can be sent to and dropped on any thread.
//!
//! # Split-process JIT
//! [`MemoryPool::descriptor`] yields a serializable [`PoolDescriptor`]; a
//! second process wraps it in a [`PoolView`] to address the pool without ever
//! reserving or releasing it.
//!
//! [`ExecutableAllocator`]: allocators::ExecutableAllocator
//! [`FreeSpaceAllocator`]: allocators::FreeSpaceAllocator
//! [`PageProvider`]: pages::PageProvider
//! [`PageCapabilities`]: pages::PageCapabilities

pub use crate::admission::{AdmissionConfig, AdmissionController, Effort, FuzzPolicy, PressureState};
pub use crate::allocators::free_space::{OwnerTag, Span, Statistics, ALLOCATION_GRANULE};
pub use crate::allocators::{ExecutableAllocator, ExecutableMemoryHandle, FreeSpaceAllocator};
pub use crate::config::PoolConfig;
pub use crate::context::ExecutableMemory;
pub use crate::error::{AllocError, InitError, PageError, ReservationError};
pub use crate::pool::{MemoryPool, PoolDescriptor, PoolView};

pub mod admission;
pub mod allocators;
pub mod config;
pub mod context;
pub mod error;
mod freelist;
pub mod pages;
pub mod pool;
mod util;
