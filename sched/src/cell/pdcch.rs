//! PDCCH Candidate Search
//!
//! Maps a (RNTI, slot, aggregation level, candidate) tuple onto CCE
//! positions inside the CORESET and picks the first candidate whose CCEs do
//! not collide with CCEs already committed in the same PDCCH slot.

use crate::cell::resource_grid::BitMask;
use crate::config::{CoresetConfig, SearchSpaceConfig};
use crate::result::CceAllocation;
use common::types::{AggregationLevel, Rnti};
use common::SlotPoint;

/// UE-specific search-space hash, varying per RNTI and slot
fn search_space_seed(rnti: Rnti, slot: SlotPoint) -> u32 {
    // Multiplicative hash in the spirit of the TS 38.213 Y_p recursion.
    let y = (rnti.0 as u32).wrapping_mul(39_827).wrapping_add(slot.slot_index().wrapping_mul(39_829));
    y % 65_537
}

/// First CCE of candidate `m` at the given aggregation level
fn candidate_first_cce(
    seed: u32,
    level: AggregationLevel,
    candidate: u8,
    nof_candidates: u8,
    nof_cces: u8,
) -> Option<u8> {
    let cce_len = level.nof_cces() as u32;
    let total = nof_cces as u32;
    if cce_len > total || nof_candidates == 0 {
        return None;
    }
    let nof_positions = total / cce_len;
    let span = (total / (cce_len * nof_candidates as u32)).max(1);
    let first = ((seed + candidate as u32 * span) % nof_positions) * cce_len;
    Some(first as u8)
}

/// Order in which aggregation levels are scanned: preference first, then
/// more robust (higher) levels, then the remaining lower ones.
fn scan_order(preferred: AggregationLevel) -> Vec<AggregationLevel> {
    let mut order = vec![preferred];
    for level in AggregationLevel::ALL {
        if level > preferred {
            order.push(level);
        }
    }
    for level in AggregationLevel::ALL.iter().rev() {
        if *level < preferred {
            order.push(*level);
        }
    }
    order
}

/// Find a collision-free PDCCH candidate and commit its CCEs.
///
/// Returns `None` when every candidate of every level collides; the caller
/// skips the UE for this slot and bumps `pdcch_alloc_failures`.
pub fn allocate_pdcch(
    coreset: &CoresetConfig,
    search_space: &SearchSpaceConfig,
    used_cces: &mut BitMask,
    rnti: Rnti,
    slot: SlotPoint,
    preferred: AggregationLevel,
) -> Option<CceAllocation> {
    let seed = search_space_seed(rnti, slot);
    for level in scan_order(preferred) {
        let al_index = AggregationLevel::ALL.iter().position(|l| *l == level).unwrap();
        let nof_candidates = search_space.nof_candidates[al_index];
        for m in 0..nof_candidates {
            let first = match candidate_first_cce(seed, level, m, nof_candidates, coreset.nof_cces) {
                Some(first) => first,
                None => break,
            };
            let cces = first..first + level.nof_cces();
            if cces.clone().all(|cce| !used_cces.test(cce as u16)) {
                for cce in cces {
                    used_cces.set(cce as u16);
                }
                return Some(CceAllocation { first_cce: first, level });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::SubcarrierSpacing;

    fn setup() -> (CoresetConfig, SearchSpaceConfig, BitMask, SlotPoint) {
        let coreset = CoresetConfig { nof_cces: 24 };
        let ss = SearchSpaceConfig::default();
        let used = BitMask::new(coreset.nof_cces as u16);
        let slot = SlotPoint::new(SubcarrierSpacing::Scs30, 0, 0);
        (coreset, ss, used, slot)
    }

    #[test]
    fn test_candidates_fit_coreset() {
        let (coreset, ss, mut used, slot) = setup();
        let alloc = allocate_pdcch(&coreset, &ss, &mut used, Rnti(0x4601), slot, AggregationLevel::Al4)
            .expect("empty CORESET must yield a candidate");
        assert!(alloc.first_cce + alloc.level.nof_cces() <= coreset.nof_cces);
        assert_eq!(used.count_ones(), alloc.level.nof_cces() as u32);
    }

    #[test]
    fn test_allocations_never_overlap() {
        let (coreset, ss, mut used, slot) = setup();
        let mut total = 0u32;
        for i in 0..8u16 {
            if let Some(alloc) =
                allocate_pdcch(&coreset, &ss, &mut used, Rnti(0x4601 + i), slot, AggregationLevel::Al2)
            {
                total += alloc.level.nof_cces() as u32;
            }
        }
        // Committed CCEs must exactly match what the mask recorded: no
        // candidate was double-booked.
        assert_eq!(used.count_ones(), total);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let (coreset, ss, mut used, slot) = setup();
        for cce in 0..coreset.nof_cces as u16 {
            used.set(cce);
        }
        assert!(allocate_pdcch(&coreset, &ss, &mut used, Rnti(0x4601), slot, AggregationLevel::Al1).is_none());
    }

    #[test]
    fn test_preferred_level_tried_first() {
        let (coreset, ss, mut used, slot) = setup();
        let alloc = allocate_pdcch(&coreset, &ss, &mut used, Rnti(0x4601), slot, AggregationLevel::Al8)
            .expect("allocation");
        assert_eq!(alloc.level, AggregationLevel::Al8);
    }
}
