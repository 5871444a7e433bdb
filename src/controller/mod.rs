//! Controller module
//!
//! Assembles the control plane and runs the volume reconciliation loop.

mod context;
pub mod reconciler;

pub use context::{ControlPlane, ControlPlaneConfig};
pub use reconciler::{Outcome, PassSummary, Reconciler, ReconcilerConfig};
