//! Cell Resource Grid
//!
//! Per-slot record of committed PRBs, CCEs and grants, held in a ring
//! covering the scheduler's allocation lookahead.

use crate::cell::ring_grid::RingGrid;
use crate::config::CellConfig;
use crate::result::{DlGrant, PrbInterval, PucchGrant, UlGrant};
use common::slot::max_slot_alloc_delay;
use common::SlotPoint;

/// Fixed-capacity bitmask used for PRB and CCE occupancy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {
    words: Vec<u64>,
    len: u16,
}

impl BitMask {
    /// All-clear mask of the given length
    pub fn new(len: u16) -> Self {
        Self {
            words: vec![0; (len as usize + 63) / 64],
            len,
        }
    }

    /// Number of positions
    pub fn len(&self) -> u16 {
        self.len
    }

    /// Whether the mask has zero positions
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Test one position
    pub fn test(&self, pos: u16) -> bool {
        debug_assert!(pos < self.len);
        self.words[pos as usize / 64] & (1u64 << (pos % 64)) != 0
    }

    /// Set one position
    pub fn set(&mut self, pos: u16) {
        debug_assert!(pos < self.len);
        self.words[pos as usize / 64] |= 1u64 << (pos % 64);
    }

    /// Set every position in [start, stop)
    pub fn set_range(&mut self, range: PrbInterval) {
        for pos in range.start..range.stop {
            self.set(pos);
        }
    }

    /// Whether every position in [start, stop) is clear
    pub fn range_is_clear(&self, range: PrbInterval) -> bool {
        (range.start..range.stop).all(|pos| !self.test(pos))
    }

    /// Number of set positions
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Clear all positions
    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// OR another mask of the same length into this one
    pub fn union_with(&mut self, other: &BitMask) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
    }

    /// Largest run of clear positions; ties resolve to the lowest start.
    pub fn largest_free_interval(&self) -> Option<PrbInterval> {
        let mut best: Option<PrbInterval> = None;
        let mut run_start: Option<u16> = None;
        for pos in 0..=self.len {
            let occupied = pos == self.len || self.test(pos);
            match (run_start, occupied) {
                (None, false) => run_start = Some(pos),
                (Some(start), true) => {
                    let candidate = PrbInterval::new(start, pos);
                    if best.map_or(true, |b| candidate.len() > b.len()) {
                        best = Some(candidate);
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        best.filter(|b| !b.is_empty())
    }

}

/// Resources committed for one slot of one cell
#[derive(Debug, Clone)]
pub struct SlotResources {
    /// Occupied DL PRBs, reserved signals included
    pub dl_prbs: BitMask,
    /// Occupied UL PRBs
    pub ul_prbs: BitMask,
    /// Occupied PDCCH CCEs
    pub cces: BitMask,
    /// Committed DL grants
    pub dl_grants: Vec<DlGrant>,
    /// Committed UL grants with PUSCH in this slot
    pub ul_grants: Vec<UlGrant>,
    /// PUCCH occasions expected in this slot
    pub pucchs: Vec<PucchGrant>,
}

impl SlotResources {
    fn new(nof_prbs: u16, nof_cces: u8) -> Self {
        Self {
            dl_prbs: BitMask::new(nof_prbs),
            ul_prbs: BitMask::new(nof_prbs),
            cces: BitMask::new(nof_cces as u16),
            dl_grants: Vec::new(),
            ul_grants: Vec::new(),
            pucchs: Vec::new(),
        }
    }

    /// Clear the slot for reuse, keeping allocations' capacity
    pub fn reset(&mut self) {
        self.dl_prbs.reset();
        self.ul_prbs.reset();
        self.cces.reset();
        self.dl_grants.clear();
        self.ul_grants.clear();
        self.pucchs.clear();
    }
}

/// Ring of per-slot resource commitments for one cell
pub struct CellResourceGrid {
    ring: RingGrid<SlotResources>,
    /// DL PRBs statically reserved for SSB / CORESET#0 / CSI-RS
    reserved_dl: BitMask,
}

impl CellResourceGrid {
    /// Build the grid for a cell
    pub fn new(cfg: &CellConfig) -> Self {
        let lookahead = max_slot_alloc_delay(0) + cfg.expert.max_processing_delay_slots;
        let ring = RingGrid::new_with(lookahead, cfg.scs, || {
            SlotResources::new(cfg.nof_prbs, cfg.coreset.nof_cces)
        });
        let mut reserved_dl = BitMask::new(cfg.nof_prbs);
        if cfg.nof_reserved_dl_prbs > 0 {
            reserved_dl.set_range(PrbInterval::new(0, cfg.nof_reserved_dl_prbs));
        }
        Self { ring, reserved_dl }
    }

    /// Ring length in slots
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring is empty (never after construction)
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Committed resources of a slot
    pub fn slot(&self, slot: SlotPoint) -> &SlotResources {
        self.ring.get(slot)
    }

    /// Mutable committed resources of a slot
    pub fn slot_mut(&mut self, slot: SlotPoint) -> &mut SlotResources {
        self.ring.get_mut(slot)
    }

    /// Recycle the entry of a slot that has passed
    pub fn reset_slot(&mut self, slot: SlotPoint) {
        self.ring.get_mut(slot).reset();
    }

    /// DL occupancy including static reservations, for allocation decisions
    pub fn dl_used_mask(&self, slot: SlotPoint) -> BitMask {
        let mut mask = self.ring.get(slot).dl_prbs.clone();
        mask.union_with(&self.reserved_dl);
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_util::test_cell_config;
    use common::types::SubcarrierSpacing;

    #[test]
    fn test_bitmask_ranges() {
        let mut mask = BitMask::new(100);
        assert!(mask.range_is_clear(PrbInterval::new(0, 100)));
        mask.set_range(PrbInterval::new(10, 20));
        assert!(mask.test(10));
        assert!(mask.test(19));
        assert!(!mask.test(20));
        assert_eq!(mask.count_ones(), 10);
        assert!(!mask.range_is_clear(PrbInterval::new(5, 15)));
        assert!(mask.range_is_clear(PrbInterval::new(20, 100)));
    }

    #[test]
    fn test_largest_free_interval_prefers_lowest_start() {
        let mut mask = BitMask::new(30);
        // Two free runs of equal length 10: [0,10) and [20,30).
        mask.set_range(PrbInterval::new(10, 20));
        assert_eq!(mask.largest_free_interval(), Some(PrbInterval::new(0, 10)));

        // Make the upper run larger; it should win.
        let mut mask = BitMask::new(30);
        mask.set_range(PrbInterval::new(8, 15));
        assert_eq!(mask.largest_free_interval(), Some(PrbInterval::new(15, 30)));

        let mut full = BitMask::new(4);
        full.set_range(PrbInterval::new(0, 4));
        assert_eq!(full.largest_free_interval(), None);
    }

    #[test]
    fn test_grid_reserves_dl_prbs() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let grid = CellResourceGrid::new(&cfg);
        let slot = SlotPoint::new(cfg.scs, 0, 0);

        let used = grid.dl_used_mask(slot);
        for prb in 0..cfg.nof_reserved_dl_prbs {
            assert!(used.test(prb));
        }
        assert!(used.range_is_clear(PrbInterval::new(cfg.nof_reserved_dl_prbs, cfg.nof_prbs)));
    }

    #[test]
    fn test_grid_slot_reset() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut grid = CellResourceGrid::new(&cfg);
        let slot = SlotPoint::new(cfg.scs, 0, 0);

        grid.slot_mut(slot).dl_prbs.set_range(PrbInterval::new(5, 10));
        assert!(!grid.slot(slot).dl_prbs.range_is_clear(PrbInterval::new(5, 10)));
        grid.reset_slot(slot);
        assert!(grid.slot(slot).dl_prbs.range_is_clear(PrbInterval::new(5, 10)));
    }
}
