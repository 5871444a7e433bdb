//! Volume Scheduler
//!
//! - [`placement`] - pure pool ranking and selection
//! - [`locks`] - per-volume serialization and create cancellation
//! - [`engine`] - CreateVolume, DeleteVolume, Publish/Unpublish and pool
//!   administration against node agents

pub mod engine;
pub mod locks;
pub mod placement;

mod proptest;

pub use engine::{Scheduler, SchedulerConfig};
pub use locks::{CreateTicket, VolumeGuard, VolumeLocks};
pub use placement::{rank_pools, select_pools, Placement, PlacementRequest};
