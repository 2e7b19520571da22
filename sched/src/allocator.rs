//! Resource Allocator
//!
//! Turns the policy's ranked candidate list into committed grants: PRB
//! placement (largest remaining region first, lowest start on ties), PDCCH
//! candidate search, DMRS symbol placement and HARQ bookkeeping. Pending
//! retransmissions are served before new data and keep their original PRBs
//! and MCS.

use crate::cell::pdcch::allocate_pdcch;
use crate::cell::resource_grid::CellResourceGrid;
use crate::config::CellConfig;
use crate::mcs::{cqi_to_mcs, estimate_tbs_bytes, McsTable};
use crate::result::{DlGrant, PrbInterval, PucchGrant, UlGrant};
use crate::ue::logical_channel::MIN_TBS_BYTES;
use crate::ue::UeTable;
use common::types::DuUeIndex;
use common::SlotPoint;
use tracing::{debug, trace};

/// PDSCH/PUSCH symbols usable for data: 14 minus PDCCH and DM-RS overhead
const NOF_DATA_SYMBOLS: u8 = 12;

/// DM-RS on symbols 2 and 11 (type A, position 2, one additional position),
/// CDM groups without data
const DMRS_SYMBOL_MASK: u16 = (1 << 2) | (1 << 11);

/// How far past the nominal k1/k2 target the allocator searches for an
/// UL-capable slot under TDD
const UL_SLOT_SEARCH_WINDOW: u32 = 20;

/// Failure counters of one allocation pass
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocCounters {
    /// PDCCH candidate search exhausted
    pub pdcch_alloc_failures: u32,
    /// No empty HARQ process available
    pub harq_exhausted: u32,
}

/// Outcome of the DL allocation pass for one slot
#[derive(Debug, Default)]
pub struct DlAllocOutcome {
    /// Committed grants
    pub grants: Vec<DlGrant>,
    /// PUCCH occasions created, keyed by their UL slot
    pub pucchs: Vec<(SlotPoint, PucchGrant)>,
    /// Failure counters
    pub counters: AllocCounters,
}

/// Outcome of the UL allocation pass for one slot
#[derive(Debug, Default)]
pub struct UlAllocOutcome {
    /// Committed grants (PUSCH lies k2+ slots ahead)
    pub grants: Vec<UlGrant>,
    /// Failure counters
    pub counters: AllocCounters,
}

/// First UL-capable slot at or after `from`
fn next_ul_slot(cfg: &CellConfig, from: SlotPoint) -> Option<SlotPoint> {
    (0..UL_SLOT_SEARCH_WINDOW)
        .map(|delta| from + delta as i32)
        .find(|slot| cfg.is_ul_slot(*slot))
}

/// PRBs needed to carry `pending_bytes` at the given spectral efficiency
fn required_prbs(pending_bytes: u64, bytes_per_prb: u32, max_prbs: u16) -> u16 {
    if bytes_per_prb == 0 {
        return max_prbs;
    }
    let needed = (pending_bytes + bytes_per_prb as u64 - 1) / bytes_per_prb as u64;
    needed.min(max_prbs as u64) as u16
}

/// Allocate DL grants for `slot_tx`. The caller guarantees `slot_tx` is a
/// DL-capable slot and the ranked list only holds backlogged UEs.
pub fn allocate_dl_slot(
    cfg: &CellConfig,
    grid: &mut CellResourceGrid,
    ues: &mut UeTable,
    ranked: &[DuUeIndex],
    slot_tx: SlotPoint,
) -> DlAllocOutcome {
    let mut outcome = DlAllocOutcome::default();
    let ack_slot = match next_ul_slot(cfg, slot_tx + cfg.k1 as i32) {
        Some(slot) => slot,
        None => {
            debug!("no UL slot for HARQ feedback within the search window, skipping DL");
            return outcome;
        }
    };

    for &ue_index in ranked {
        let ue = match ues.get_mut(ue_index) {
            Some(ue) => ue,
            None => continue,
        };
        let rnti = ue.crnti;
        let preferred_al = ue.preferred_al;

        // One feedback occasion per slot per entity: if a process already
        // waits on this ack slot, the UE sits this slot out.
        if ue.pcell().dl_harqs.has_waiting_ack_at(ack_slot) {
            continue;
        }

        // Retransmission first: same PRBs, same MCS, next redundancy
        // version, NDI untouched.
        let retx = ue
            .pcell_mut()
            .dl_harqs
            .find_pending_retx()
            .map(|p| (p.id, p.prbs, p.mcs, p.tbs_bytes, p.ndi()));
        if let Some((harq_id, prbs, mcs, tbs_bytes, ndi)) = retx {
            if !grid.dl_used_mask(slot_tx).range_is_clear(prbs) {
                // Original PRBs are taken this slot; the retx stays pending.
                trace!("retx PRBs {} busy at {}, deferring UE {:?}", prbs, slot_tx, ue_index);
                continue;
            }
            let cces = match allocate_pdcch(
                &cfg.coreset,
                &cfg.search_space,
                &mut grid.slot_mut(slot_tx).cces,
                rnti,
                slot_tx,
                preferred_al,
            ) {
                Some(cces) => cces,
                None => {
                    outcome.counters.pdcch_alloc_failures += 1;
                    continue;
                }
            };
            let process = ue.pcell_mut().dl_harqs.process_mut(harq_id).unwrap();
            process.new_retx(slot_tx, ack_slot);
            let rv = process.rv();
            commit_dl_grant(
                grid,
                &mut outcome,
                DlGrant {
                    ue_index,
                    rnti,
                    harq_id,
                    ndi,
                    rv,
                    mcs,
                    prbs,
                    tbs_bytes,
                    cces,
                    dmrs_symbol_mask: DMRS_SYMBOL_MASK,
                    ack_slot,
                },
                slot_tx,
            );
            continue;
        }

        // New transmission.
        let pending = ue.pending_dl_bytes();
        if pending == 0 {
            continue;
        }
        if ue.pcell_mut().dl_harqs.find_empty().is_none() {
            outcome.counters.harq_exhausted += 1;
            continue;
        }
        let (table, mcs) = {
            let pcell = ue.pcell();
            let table = pcell.applied_cfg.pdsch_mcs_table;
            let base = match cqi_to_mcs(pcell.channel_state.cqi, table) {
                Some(mcs) => mcs,
                None => continue,
            };
            (table, pcell.channel_state.dl_olla.adjust_mcs(base, table))
        };
        let entry = table.entry(mcs);
        let bytes_per_prb = estimate_tbs_bytes(1, NOF_DATA_SYMBOLS, entry, 1);

        let used = grid.dl_used_mask(slot_tx);
        let region = match used.largest_free_interval() {
            Some(region) => region,
            None => continue,
        };
        let take = required_prbs(pending, bytes_per_prb, region.len());
        let mut prbs = PrbInterval::new(region.start, region.start + take);
        let mut tbs_bytes = estimate_tbs_bytes(prbs.len(), NOF_DATA_SYMBOLS, entry, 1);
        if tbs_bytes < MIN_TBS_BYTES {
            // Grant too small to carry the minimum payload; retry once with
            // the whole region before giving up on this UE.
            prbs = region;
            tbs_bytes = estimate_tbs_bytes(prbs.len(), NOF_DATA_SYMBOLS, entry, 1);
            if tbs_bytes < MIN_TBS_BYTES {
                continue;
            }
        }

        let cces = match allocate_pdcch(
            &cfg.coreset,
            &cfg.search_space,
            &mut grid.slot_mut(slot_tx).cces,
            rnti,
            slot_tx,
            preferred_al,
        ) {
            Some(cces) => cces,
            None => {
                outcome.counters.pdcch_alloc_failures += 1;
                continue;
            }
        };

        let process = ue.pcell_mut().dl_harqs.find_empty().unwrap();
        process.new_tx(slot_tx, ack_slot, mcs, tbs_bytes, prbs);
        let harq_id = process.id;
        let ndi = process.ndi();
        let rv = process.rv();
        ue.dl_lc.allocate(tbs_bytes);

        commit_dl_grant(
            grid,
            &mut outcome,
            DlGrant {
                ue_index,
                rnti,
                harq_id,
                ndi,
                rv,
                mcs,
                prbs,
                tbs_bytes,
                cces,
                dmrs_symbol_mask: DMRS_SYMBOL_MASK,
                ack_slot,
            },
            slot_tx,
        );
    }
    outcome
}

fn commit_dl_grant(grid: &mut CellResourceGrid, outcome: &mut DlAllocOutcome, grant: DlGrant, slot_tx: SlotPoint) {
    let slot = grid.slot_mut(slot_tx);
    slot.dl_prbs.set_range(grant.prbs);
    slot.dl_grants.push(grant.clone());

    let pucch = PucchGrant {
        rnti: grant.rnti,
        expected_harq_bits: 1,
        csi_expected: false,
    };
    grid.slot_mut(grant.ack_slot).pucchs.push(pucch);
    outcome.pucchs.push((grant.ack_slot, pucch));
    outcome.grants.push(grant);
}

/// Allocate UL grants signalled in `slot_tx` for a PUSCH k2+ slots later.
pub fn allocate_ul_slot(
    cfg: &CellConfig,
    grid: &mut CellResourceGrid,
    ues: &mut UeTable,
    ranked: &[DuUeIndex],
    slot_tx: SlotPoint,
) -> UlAllocOutcome {
    let mut outcome = UlAllocOutcome::default();
    let pusch_slot = match next_ul_slot(cfg, slot_tx + cfg.k2 as i32) {
        Some(slot) => slot,
        None => return outcome,
    };
    // Feedback for a PUSCH is its CRC, which the PHY raises after decoding.
    let crc_slot = pusch_slot + cfg.expert.max_processing_delay_slots as i32;

    for &ue_index in ranked {
        let ue = match ues.get_mut(ue_index) {
            Some(ue) => ue,
            None => continue,
        };
        let rnti = ue.crnti;
        let preferred_al = ue.preferred_al;

        // A UE transmits at most one PUSCH per slot, and only one process
        // may wait on the matching CRC occasion.
        if ue.pcell().ul_harqs.has_waiting_ack_at(crc_slot) {
            continue;
        }

        let retx = ue
            .pcell_mut()
            .ul_harqs
            .find_pending_retx()
            .map(|p| (p.id, p.prbs, p.mcs, p.tbs_bytes, p.ndi()));
        if let Some((harq_id, prbs, mcs, tbs_bytes, ndi)) = retx {
            if !grid.slot(pusch_slot).ul_prbs.range_is_clear(prbs) {
                continue;
            }
            let cces = match allocate_pdcch(
                &cfg.coreset,
                &cfg.search_space,
                &mut grid.slot_mut(slot_tx).cces,
                rnti,
                slot_tx,
                preferred_al,
            ) {
                Some(cces) => cces,
                None => {
                    outcome.counters.pdcch_alloc_failures += 1;
                    continue;
                }
            };
            let process = ue.pcell_mut().ul_harqs.process_mut(harq_id).unwrap();
            process.new_retx(pusch_slot, crc_slot);
            let rv = process.rv();
            commit_ul_grant(
                grid,
                &mut outcome,
                UlGrant {
                    ue_index,
                    rnti,
                    harq_id,
                    ndi,
                    rv,
                    mcs,
                    prbs,
                    tbs_bytes,
                    cces,
                    dmrs_symbol_mask: DMRS_SYMBOL_MASK,
                    pusch_slot,
                },
            );
            continue;
        }

        let pending = ue.pending_ul_newtx_bytes();
        if pending == 0 {
            continue;
        }
        if ue.pcell_mut().ul_harqs.find_empty().is_none() {
            outcome.counters.harq_exhausted += 1;
            continue;
        }
        let (table, mcs, layers) = {
            let pcell = ue.pcell();
            let table = pcell.applied_cfg.pusch_mcs_table;
            let base = match cqi_to_mcs(pcell.channel_state.cqi, table) {
                Some(mcs) => mcs,
                None => continue,
            };
            (
                table,
                pcell.channel_state.ul_olla.adjust_mcs(base, table),
                pcell.applied_cfg.pusch_max_rank,
            )
        };
        let entry = table.entry(mcs);
        let bytes_per_prb = estimate_tbs_bytes(1, NOF_DATA_SYMBOLS, entry, layers);

        let region = match grid.slot(pusch_slot).ul_prbs.largest_free_interval() {
            Some(region) => region,
            None => continue,
        };
        let take = required_prbs(pending, bytes_per_prb, region.len());
        let mut prbs = PrbInterval::new(region.start, region.start + take);
        let mut tbs_bytes = estimate_tbs_bytes(prbs.len(), NOF_DATA_SYMBOLS, entry, layers);
        if tbs_bytes < MIN_TBS_BYTES {
            prbs = region;
            tbs_bytes = estimate_tbs_bytes(prbs.len(), NOF_DATA_SYMBOLS, entry, layers);
            if tbs_bytes < MIN_TBS_BYTES {
                continue;
            }
        }

        let cces = match allocate_pdcch(
            &cfg.coreset,
            &cfg.search_space,
            &mut grid.slot_mut(slot_tx).cces,
            rnti,
            slot_tx,
            preferred_al,
        ) {
            Some(cces) => cces,
            None => {
                outcome.counters.pdcch_alloc_failures += 1;
                continue;
            }
        };

        let process = ue.pcell_mut().ul_harqs.find_empty().unwrap();
        process.new_tx(pusch_slot, crc_slot, mcs, tbs_bytes, prbs);
        let harq_id = process.id;
        let ndi = process.ndi();
        let rv = process.rv();
        ue.ul_lc.on_ul_grant(tbs_bytes);

        commit_ul_grant(
            grid,
            &mut outcome,
            UlGrant {
                ue_index,
                rnti,
                harq_id,
                ndi,
                rv,
                mcs,
                prbs,
                tbs_bytes,
                cces,
                dmrs_symbol_mask: DMRS_SYMBOL_MASK,
                pusch_slot,
            },
        );
    }
    outcome
}

fn commit_ul_grant(grid: &mut CellResourceGrid, outcome: &mut UlAllocOutcome, grant: UlGrant) {
    let slot = grid.slot_mut(grant.pusch_slot);
    slot.ul_prbs.set_range(grant.prbs);
    slot.ul_grants.push(grant.clone());
    outcome.grants.push(grant);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_util::test_cell_config;
    use crate::config::{LogicalChannelConfig, TddPattern, UeCreationRequest};
    use crate::ue::Ue;
    use common::types::{AggregationLevel, DuCellIndex, Lcid, LcgId, Rnti, SubcarrierSpacing};

    fn setup(nof_ues: u16) -> (crate::config::CellConfig, CellResourceGrid, UeTable) {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let grid = CellResourceGrid::new(&cfg);
        let mut ues = UeTable::new();
        for i in 0..nof_ues {
            let req = UeCreationRequest {
                ue_index: DuUeIndex(i),
                crnti: Rnti(0x4601 + i),
                pcell_index: DuCellIndex(0),
                lc_configs: vec![LogicalChannelConfig::srb1(), LogicalChannelConfig::drb(Lcid::MIN_DRB)],
                sched_request_configs: vec![],
                preferred_aggregation_level: AggregationLevel::Al2,
            };
            ues.insert(Box::new(Ue::new(&req, &cfg))).unwrap();
        }
        (cfg, grid, ues)
    }

    fn slot0(cfg: &crate::config::CellConfig) -> SlotPoint {
        SlotPoint::new(cfg.scs, 0, 0)
    }

    #[test]
    fn test_dl_grants_have_disjoint_prbs() {
        let (cfg, mut grid, mut ues) = setup(4);
        for ue in ues.iter_mut() {
            ue.dl_lc.handle_dl_buffer_state(Lcid::MIN_DRB, 300);
        }
        let ranked: Vec<_> = (0..4).map(DuUeIndex).collect();
        let outcome = allocate_dl_slot(&cfg, &mut grid, &mut ues, &ranked, slot0(&cfg));

        assert!(!outcome.grants.is_empty());
        for (i, a) in outcome.grants.iter().enumerate() {
            for b in outcome.grants.iter().skip(i + 1) {
                assert!(!a.prbs.overlaps(&b.prbs), "grants {} and {} overlap", a.prbs, b.prbs);
            }
        }
        // Every grant created a PUCCH expectation at its ack slot.
        assert_eq!(outcome.pucchs.len(), outcome.grants.len());
        for grant in &outcome.grants {
            assert_eq!(grant.ack_slot, slot0(&cfg) + cfg.k1 as i32);
        }
    }

    #[test]
    fn test_small_buffer_gets_small_grant() {
        let (cfg, mut grid, mut ues) = setup(1);
        ues.get_mut(DuUeIndex(0))
            .unwrap()
            .dl_lc
            .handle_dl_buffer_state(Lcid::MIN_DRB, 100);
        let outcome = allocate_dl_slot(&cfg, &mut grid, &mut ues, &[DuUeIndex(0)], slot0(&cfg));

        assert_eq!(outcome.grants.len(), 1);
        let grant = &outcome.grants[0];
        assert!(grant.tbs_bytes >= 100);
        assert!(grant.prbs.len() < cfg.nof_prbs / 2, "tiny buffer must not take the whole band");
        // Buffer drained.
        assert_eq!(ues.get(DuUeIndex(0)).unwrap().pending_dl_bytes(), 0);
    }

    #[test]
    fn test_harq_exhaustion_skips_ue() {
        let (cfg, mut grid, mut ues) = setup(1);
        {
            let ue = ues.get_mut(DuUeIndex(0)).unwrap();
            ue.dl_lc.handle_dl_buffer_state(Lcid::MIN_DRB, 1_000_000);
            // Occupy every HARQ process.
            let now = SlotPoint::new(cfg.scs, 0, 0);
            for i in 0..cfg.nof_harqs {
                let p = ue.pcell_mut().dl_harqs.find_empty().unwrap();
                p.new_tx(now, now + 4, 5, 100, PrbInterval::new(i as u16, i as u16 + 1));
            }
        }
        let outcome = allocate_dl_slot(&cfg, &mut grid, &mut ues, &[DuUeIndex(0)], slot0(&cfg) + 1);
        assert!(outcome.grants.is_empty());
        assert_eq!(outcome.counters.harq_exhausted, 1);
    }

    #[test]
    fn test_ul_grant_lands_on_ul_slot() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, Some(TddPattern::dddsu()));
        let mut grid = CellResourceGrid::new(&cfg);
        let mut ues = UeTable::new();
        let req = UeCreationRequest {
            ue_index: DuUeIndex(0),
            crnti: Rnti(0x4601),
            pcell_index: DuCellIndex(0),
            lc_configs: vec![LogicalChannelConfig::srb1()],
            sched_request_configs: vec![],
            preferred_aggregation_level: AggregationLevel::Al2,
        };
        ues.insert(Box::new(Ue::new(&req, &cfg))).unwrap();
        ues.get_mut(DuUeIndex(0)).unwrap().ul_lc.handle_bsr(LcgId(0), 5000);

        let slot = SlotPoint::new(cfg.scs, 0, 0);
        let outcome = allocate_ul_slot(&cfg, &mut grid, &mut ues, &[DuUeIndex(0)], slot);
        assert_eq!(outcome.grants.len(), 1);
        let grant = &outcome.grants[0];
        assert!(cfg.is_ul_slot(grant.pusch_slot));
        assert!(grant.pusch_slot - slot >= cfg.k2 as i32);
        // The BSR estimate was decremented.
        assert!(ues.get(DuUeIndex(0)).unwrap().pending_ul_newtx_bytes() < 5000);
    }
}
