//! Concurrency primitives shared by the preset and migration services.
//!
//! - [`ResourceRegistry`]: named, reference-counted async locks keyed by string
//! - [`CriticalSection`]: reentrant lock with double-checked init and test-and-set
//! - [`ExclusiveValue`]: a single-owner value slot with explicit states
//! - [`DedupQueue`]: FIFO queue collapsing pending work per key

pub mod dedup_queue;
pub mod kernel;
pub mod resources;

pub use dedup_queue::DedupQueue;
pub use kernel::{CriticalSection, ExclusiveState, ExclusiveValue};
pub use resources::{HolderId, ResourceLease, ResourceRegistry};
