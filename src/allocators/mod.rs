//! The [`FreeSpaceAllocator`] and [`ExecutableAllocator`] allocators.

pub mod executable;
pub mod free_space;

pub use executable::{ExecutableAllocator, ExecutableMemoryHandle};
pub use free_space::FreeSpaceAllocator;
