//! Cell-Level Scheduler State
//!
//! Slot-indexed rings of committed resources for one cell.

pub mod pdcch;
pub mod resource_grid;
pub mod ring_grid;

pub use resource_grid::{BitMask, CellResourceGrid, SlotResources};
pub use ring_grid::{ring_size_gt_min, RingGrid};
