//! Slot Point Arithmetic
//!
//! Monotone slot counting with wrap-around at the hyper-frame boundary
//! (1024 system frames). All scheduler time is expressed in slot points.

use crate::types::SubcarrierSpacing;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use thiserror::Error;

/// Number of system frames before the SFN wraps
pub const NOF_SFNS: u32 = 1024;

/// Number of subframes per system frame
pub const NOF_SUBFRAMES_PER_FRAME: u32 = 10;

/// Largest k0 value (DL grant to PDSCH delay) the scheduler uses
pub const SCHEDULER_MAX_K0: u32 = 15;

/// Largest k1 value (PDSCH to HARQ-ACK delay) the scheduler uses
pub const SCHEDULER_MAX_K1: u32 = 15;

/// Largest k2 value (UL grant to PUSCH delay) the scheduler uses
pub const SCHEDULER_MAX_K2: u32 = 15;

/// Largest additional delay applicable to a Msg3 PUSCH
pub const MAX_MSG3_DELTA: u32 = 6;

/// Slot arithmetic errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot distance outside the valid +/- half-cycle window")]
    InvalidSlotDistance,

    #[error("slot points with different numerologies are not comparable")]
    NumerologyMismatch,
}

/// How far in advance the scheduler may commit resources in the ring grids.
pub fn max_slot_alloc_delay(koffset: u32) -> u32 {
    SCHEDULER_MAX_K0 + SCHEDULER_MAX_K1.max(SCHEDULER_MAX_K2 + MAX_MSG3_DELTA) + koffset
}

/// A point in slot time for a given numerology.
///
/// The internal counter runs modulo one hyper-frame (`10240 << mu` slots) and
/// wraps. Differences are only meaningful inside a window of half a cycle;
/// the scheduler never produces larger distances (see `max_slot_alloc_delay`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotPoint {
    numerology: u8,
    count: u32,
}

impl SlotPoint {
    /// Create a slot point from system frame number and slot index
    pub fn new(scs: SubcarrierSpacing, sfn: u32, slot_index: u32) -> Self {
        let spf = scs.slots_per_frame();
        debug_assert!(sfn < NOF_SFNS, "invalid SFN {}", sfn);
        debug_assert!(slot_index < spf, "invalid slot index {}", slot_index);
        Self {
            numerology: scs.mu(),
            count: sfn * spf + slot_index,
        }
    }

    /// Create a slot point from a raw slot count
    pub fn from_count(scs: SubcarrierSpacing, count: u32) -> Self {
        let period = NOF_SFNS * scs.slots_per_frame();
        Self {
            numerology: scs.mu(),
            count: count % period,
        }
    }

    /// Numerology index mu
    pub fn numerology(&self) -> u8 {
        self.numerology
    }

    /// Subcarrier spacing of this slot point
    pub fn scs(&self) -> SubcarrierSpacing {
        SubcarrierSpacing::from_mu(self.numerology).unwrap()
    }

    /// Raw counter value in [0, nof_slots_per_hyper_frame)
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of slots per 10ms frame for this numerology
    pub fn slots_per_frame(&self) -> u32 {
        10 << self.numerology
    }

    /// Total number of slots in one hyper-frame for this numerology
    pub fn nof_slots_per_hyper_frame(&self) -> u32 {
        NOF_SFNS * self.slots_per_frame()
    }

    /// System frame number in [0, 1024)
    pub fn sfn(&self) -> u32 {
        self.count / self.slots_per_frame()
    }

    /// Slot index within the frame
    pub fn slot_index(&self) -> u32 {
        self.count % self.slots_per_frame()
    }

    /// Subframe index within the frame, in [0, 10)
    pub fn subframe_index(&self) -> u32 {
        self.slot_index() / (1 << self.numerology)
    }

    /// Signed distance to another slot point, checked against the
    /// half-cycle window. A distance of exactly half a cycle has an
    /// ambiguous sign and is rejected; the scheduler never produces it.
    pub fn checked_distance(&self, rhs: SlotPoint) -> Result<i32, SlotError> {
        if self.numerology != rhs.numerology {
            return Err(SlotError::NumerologyMismatch);
        }
        let period = self.nof_slots_per_hyper_frame();
        let diff = (self.count + period - rhs.count) % period;
        if diff == period / 2 {
            return Err(SlotError::InvalidSlotDistance);
        }
        // Map onto (-period/2, period/2).
        let signed = if diff > period / 2 {
            diff as i64 - period as i64
        } else {
            diff as i64
        };
        Ok(signed as i32)
    }
}

impl Add<i32> for SlotPoint {
    type Output = SlotPoint;

    fn add(self, rhs: i32) -> SlotPoint {
        let period = self.nof_slots_per_hyper_frame() as i64;
        let v = (self.count as i64 + rhs as i64).rem_euclid(period);
        SlotPoint {
            numerology: self.numerology,
            count: v as u32,
        }
    }
}

impl AddAssign<i32> for SlotPoint {
    fn add_assign(&mut self, rhs: i32) {
        *self = *self + rhs;
    }
}

impl Sub<i32> for SlotPoint {
    type Output = SlotPoint;

    fn sub(self, rhs: i32) -> SlotPoint {
        self + (-rhs)
    }
}

impl SubAssign<i32> for SlotPoint {
    fn sub_assign(&mut self, rhs: i32) {
        *self = *self - rhs;
    }
}

impl Sub<SlotPoint> for SlotPoint {
    type Output = i32;

    /// Signed slot distance. Both operands must share a numerology and the
    /// distance must lie inside the half-cycle window; the scheduler only
    /// manipulates distances up to `max_slot_alloc_delay`.
    fn sub(self, rhs: SlotPoint) -> i32 {
        self.checked_distance(rhs)
            .expect("slot distance outside the comparable window")
    }
}

impl PartialOrd for SlotPoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.numerology != other.numerology {
            return None;
        }
        self.checked_distance(*other).ok().map(|d| d.cmp(&0))
    }
}

impl fmt::Display for SlotPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sfn(), self.slot_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_point_basics() {
        let sl = SlotPoint::new(SubcarrierSpacing::Scs30, 1, 3);
        assert_eq!(sl.count(), 23);
        assert_eq!(sl.sfn(), 1);
        assert_eq!(sl.slot_index(), 3);
        assert_eq!(sl.subframe_index(), 1);
        assert_eq!(sl.nof_slots_per_hyper_frame(), 1024 * 20);
    }

    #[test]
    fn test_slot_point_wraps_at_hyper_frame() {
        let scs = SubcarrierSpacing::Scs15;
        let last = SlotPoint::new(scs, 1023, 9);
        let next = last + 1;
        assert_eq!(next.count(), 0);
        assert_eq!(next - last, 1);
        assert_eq!(last - next, -1);
    }

    #[test]
    fn test_slot_point_negative_offsets() {
        let scs = SubcarrierSpacing::Scs15;
        let first = SlotPoint::new(scs, 0, 0);
        let prev = first - 1;
        assert_eq!(prev.sfn(), 1023);
        assert_eq!(prev.slot_index(), 9);
    }

    #[test]
    fn test_slot_point_ordering_across_wrap() {
        let scs = SubcarrierSpacing::Scs15;
        let a = SlotPoint::new(scs, 1023, 8);
        let b = a + 5;
        assert!(a < b);
        assert!(b > a);
        assert_eq!(b - a, 5);
    }

    #[test]
    fn test_checked_distance_numerology_mismatch() {
        let a = SlotPoint::new(SubcarrierSpacing::Scs15, 0, 0);
        let b = SlotPoint::new(SubcarrierSpacing::Scs30, 0, 0);
        assert_eq!(a.checked_distance(b), Err(SlotError::NumerologyMismatch));
    }

    #[test]
    fn test_half_cycle_distance_rejected() {
        let scs = SubcarrierSpacing::Scs15;
        let a = SlotPoint::new(scs, 0, 0);
        let half = (a.nof_slots_per_hyper_frame() / 2) as i32;
        let b = a + half;
        assert_eq!(a.checked_distance(b), Err(SlotError::InvalidSlotDistance));
        // One past the half cycle wraps to a positive distance.
        assert_eq!(a.checked_distance(b + 1), Ok(half - 1));
    }

    #[test]
    fn test_max_alloc_delay_within_half_cycle() {
        // The lookahead bound must stay far below half a hyper-frame.
        assert!(max_slot_alloc_delay(0) < 1024 * 10 / 2);
        assert_eq!(max_slot_alloc_delay(0), 15 + 15 + 6);
    }
}
