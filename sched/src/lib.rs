//! MAC Scheduler Core Library
//!
//! This crate implements the per-slot MAC scheduler of the DU: slot-indexed
//! resource rings, HARQ entities, the UE context store, the multi-criteria
//! allocation policy and the feedback (UCI/CRC) decoding path, orchestrated
//! once per slot per cell.

pub mod allocator;
pub mod cell;
pub mod cell_scheduler;
pub mod config;
pub mod mcs;
pub mod messages;
pub mod metrics;
pub mod policy;
pub mod result;
mod scheduler;
pub mod uci;
pub mod ue;

use common::types::{DuCellIndex, DuUeIndex, Rnti};
use thiserror::Error;

pub use metrics::{SchedulerCellMetrics, SchedulerMetricsNotifier};
pub use result::SchedResult;
pub use scheduler::Scheduler;

/// Scheduler errors.
///
/// Capacity conditions (HARQ exhausted, PDCCH candidates exhausted) are not
/// represented here: they are absorbed inside the slot run as counters and
/// the affected UE simply skips the slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("UE index {0:?} already in use")]
    DuplicateUe(DuUeIndex),

    #[error("UE index {0:?} not found")]
    UeNotFound(DuUeIndex),

    #[error("RNTI {0:?} not found")]
    RntiNotFound(Rnti),

    #[error("cell index {0:?} not found")]
    CellNotFound(DuCellIndex),
}

/// Outbound notifier for per-slot scheduling results
pub trait SchedResultNotifier: Send + Sync {
    /// Deliver the result computed for `slot` on the given cell
    fn on_sched_result(&self, result: &SchedResult);
}
