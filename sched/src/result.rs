//! Scheduler Result Structures
//!
//! The per-slot output of the scheduler for one cell, published to the PHY
//! adaptor once per slot.

use crate::ue::harq::HarqId;
use common::types::{AggregationLevel, DuCellIndex, DuUeIndex, Rnti};
use common::SlotPoint;
use std::fmt;
use std::time::Duration;

/// Half-open PRB interval [start, stop)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrbInterval {
    /// First PRB of the allocation
    pub start: u16,
    /// One past the last PRB
    pub stop: u16,
}

impl PrbInterval {
    /// Create an interval
    pub fn new(start: u16, stop: u16) -> Self {
        debug_assert!(start <= stop);
        Self { start, stop }
    }

    /// Number of PRBs
    pub fn len(&self) -> u16 {
        self.stop - self.start
    }

    /// Whether the interval is empty
    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Whether two intervals share any PRB
    pub fn overlaps(&self, other: &PrbInterval) -> bool {
        self.start < other.stop && other.start < self.stop
    }
}

impl fmt::Display for PrbInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.stop)
    }
}

/// PDCCH CCEs assigned to a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CceAllocation {
    /// First CCE index
    pub first_cce: u8,
    /// Aggregation level
    pub level: AggregationLevel,
}

/// One DL grant (PDCCH + PDSCH)
#[derive(Debug, Clone)]
pub struct DlGrant {
    /// Target UE
    pub ue_index: DuUeIndex,
    /// Target RNTI
    pub rnti: Rnti,
    /// HARQ process carrying the transport block
    pub harq_id: HarqId,
    /// New-data indicator
    pub ndi: bool,
    /// Redundancy version
    pub rv: u8,
    /// Modulation and coding scheme index
    pub mcs: u8,
    /// PDSCH PRBs
    pub prbs: PrbInterval,
    /// Transport block size in bytes
    pub tbs_bytes: u32,
    /// PDCCH CCEs
    pub cces: CceAllocation,
    /// Bitmap of OFDM symbols carrying DM-RS
    pub dmrs_symbol_mask: u16,
    /// Slot where the HARQ-ACK is expected on PUCCH
    pub ack_slot: SlotPoint,
}

/// One UL grant (PDCCH + PUSCH)
#[derive(Debug, Clone)]
pub struct UlGrant {
    /// Target UE
    pub ue_index: DuUeIndex,
    /// Target RNTI
    pub rnti: Rnti,
    /// HARQ process carrying the transport block
    pub harq_id: HarqId,
    /// New-data indicator
    pub ndi: bool,
    /// Redundancy version
    pub rv: u8,
    /// Modulation and coding scheme index
    pub mcs: u8,
    /// PUSCH PRBs
    pub prbs: PrbInterval,
    /// Transport block size in bytes
    pub tbs_bytes: u32,
    /// PDCCH CCEs
    pub cces: CceAllocation,
    /// Bitmap of OFDM symbols carrying DM-RS
    pub dmrs_symbol_mask: u16,
    /// Slot the PUSCH is transmitted in
    pub pusch_slot: SlotPoint,
}

/// One PUCCH opportunity scheduled for HARQ feedback and/or SR
#[derive(Debug, Clone, Copy)]
pub struct PucchGrant {
    /// Transmitting UE
    pub rnti: Rnti,
    /// Number of HARQ-ACK bits expected
    pub expected_harq_bits: u8,
    /// Whether a CSI report is expected on this occasion
    pub csi_expected: bool,
}

/// DL part of a slot result
#[derive(Debug, Clone, Default)]
pub struct DlSchedResult {
    /// UE data grants
    pub ue_grants: Vec<DlGrant>,
}

/// UL part of a slot result
#[derive(Debug, Clone, Default)]
pub struct UlSchedResult {
    /// PUSCH grants signalled this slot
    pub pusch_grants: Vec<UlGrant>,
    /// PUCCH occasions expected this slot
    pub pucchs: Vec<PucchGrant>,
}

/// Complete scheduling decision for one cell and slot
#[derive(Debug, Clone)]
pub struct SchedResult {
    /// Cell the result belongs to
    pub cell_index: DuCellIndex,
    /// Slot the decision applies to
    pub slot: SlotPoint,
    /// DL decisions
    pub dl: DlSchedResult,
    /// UL decisions
    pub ul: UlSchedResult,
    /// Wall-clock time the decision took
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prb_interval_overlap() {
        let a = PrbInterval::new(0, 10);
        let b = PrbInterval::new(10, 20);
        let c = PrbInterval::new(5, 15);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert_eq!(a.len(), 10);
        assert!(!a.is_empty());
        assert!(PrbInterval::new(3, 3).is_empty());
    }
}
