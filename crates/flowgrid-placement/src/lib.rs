//! flowgrid allocator — matches pending tasks against resource offers.
//!
//! This crate owns no tasks and talks to no cluster. It keeps the pool of
//! currently held offers and decides, for one allocation pass, which
//! pending task goes to which node and which concrete resources it gets.
//!
//! # Components
//!
//! - **`pool`** — `OfferPool` arena with acquire / release / decline
//! - **`scorer`** — best-fit node ranking (least leftover capacity)
//! - **`allocator`** — the allocation pass: ordering, co-location classes, anti-affinity

pub mod allocator;
pub mod pool;
pub mod scorer;

pub use allocator::{AllocationOutcome, Assignment, PendingTask, allocate, plan};
pub use pool::OfferPool;
pub use scorer::{NodeScore, leftover_fraction, rank_nodes};
