//! Scheduling Policy
//!
//! Ranks candidate UEs for each slot with a composite of time-domain
//! proportional fairness, GBR deficit and slice headroom. The ordering is
//! class-strict: UEs with an unmet GBR outrank everything and slices below
//! their minimum PRB share outrank normal traffic; everyone else orders by
//! the composite score, where a slice above its maximum merely zeroes the
//! slice term. Ties resolve by score, then by lower UE index.
//!
//! The policy is deliberately independent of the fabric's round-robin
//! UE-to-strand dispatch: strand placement balances transport work, this
//! ranking balances radio grants. Slot processing happens on the cell
//! strand, so the two never interleave.

use crate::config::CellConfig;
use crate::mcs::cqi_to_mcs;
use crate::ue::{Ue, UeTable};
use common::types::{DuUeIndex, SliceId};
use std::collections::HashMap;
use tracing::trace;

/// Relative weight of the PF term
const ALPHA_PF: f64 = 1.0;
/// Relative weight of the GBR deficit term
const BETA_GBR: f64 = 4.0;
/// Relative weight of the slice headroom term
const GAMMA_SLICE: f64 = 1.0;

/// Floor for the smoothed rate, avoiding division blowups at startup
const MIN_EWMA_RATE_BPS: f64 = 1e3;

/// Scheduling direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Downlink
    Dl,
    /// Uplink
    Ul,
}

/// Priority class; lower is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RankClass {
    GbrDeficit = 0,
    SliceBelowMin = 1,
    Normal = 2,
}

#[derive(Debug, Clone, Copy)]
struct UeRates {
    /// PF-smoothed achieved rate
    ewma_bps: f64,
    /// GBR-window achieved rate
    achieved_bps: f64,
    /// Configured GBR target, 0 when the UE has no GBR channel
    gbr_target_bps: f64,
}

impl Default for UeRates {
    fn default() -> Self {
        Self {
            ewma_bps: MIN_EWMA_RATE_BPS,
            achieved_bps: 0.0,
            gbr_target_bps: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PolicyUeState {
    dl: UeRates,
    ul: UeRates,
    slice_id: SliceId,
}

#[derive(Debug, Clone, Copy)]
struct SliceState {
    min_prb_ratio: f64,
    max_prb_ratio: f64,
    /// Smoothed fraction of cell PRBs the slice consumed
    ewma_prb_ratio: f64,
    nof_ues: u32,
}

/// Bytes and PRBs granted to one UE in one slot
#[derive(Debug, Clone, Copy)]
pub struct GrantSummary {
    /// Target UE
    pub ue_index: DuUeIndex,
    /// Transport block bytes
    pub bytes: u32,
    /// PRBs consumed
    pub nof_prbs: u16,
}

/// Time-domain PF policy with GBR and slice awareness
pub struct TimePfPolicy {
    /// EWMA coefficient of the PF average (1 / T_pf)
    alpha_pf: f64,
    /// EWMA coefficient of the GBR window (~1 s)
    alpha_gbr: f64,
    /// Slots per second for rate conversion
    slots_per_sec: f64,
    nof_prbs: u16,
    ues: HashMap<DuUeIndex, PolicyUeState>,
    slices: HashMap<SliceId, SliceState>,
}

impl TimePfPolicy {
    /// Build the policy for a cell
    pub fn new(cfg: &CellConfig) -> Self {
        let slots_per_sec = 1000.0 * cfg.scs.slots_per_subframe() as f64;
        Self {
            alpha_pf: 1.0 / cfg.expert.pf_time_constant as f64,
            alpha_gbr: 1.0 / slots_per_sec,
            slots_per_sec,
            nof_prbs: cfg.nof_prbs,
            ues: HashMap::new(),
            slices: HashMap::new(),
        }
    }

    /// Register a UE and its slice membership
    pub fn add_ue(&mut self, ue: &Ue) {
        let mut state = PolicyUeState {
            dl: UeRates::default(),
            ul: UeRates::default(),
            slice_id: SliceId(0),
        };
        for lc in &ue.lc_configs {
            state.slice_id = lc.rrm_policy.slice_id;
            if let Some(gbr) = lc.qos.as_ref().and_then(|qos| qos.gbr) {
                // At most one GBR channel per UE per slice; the targets add
                // up if several are configured anyway.
                state.dl.gbr_target_bps += gbr.gbr_dl_bps as f64;
                state.ul.gbr_target_bps += gbr.gbr_ul_bps as f64;
            }
            let slice = self.slices.entry(lc.rrm_policy.slice_id).or_insert(SliceState {
                min_prb_ratio: lc.rrm_policy.min_prb_ratio as f64,
                max_prb_ratio: lc.rrm_policy.max_prb_ratio as f64,
                ewma_prb_ratio: 0.0,
                nof_ues: 0,
            });
            slice.min_prb_ratio = slice.min_prb_ratio.max(lc.rrm_policy.min_prb_ratio as f64);
            slice.max_prb_ratio = slice.max_prb_ratio.min(lc.rrm_policy.max_prb_ratio as f64);
        }
        if let Some(slice) = self.slices.get_mut(&state.slice_id) {
            slice.nof_ues += 1;
        }
        self.ues.insert(ue.ue_index, state);
    }

    /// Deregister a UE
    pub fn remove_ue(&mut self, ue_index: DuUeIndex) {
        if let Some(state) = self.ues.remove(&ue_index) {
            if let Some(slice) = self.slices.get_mut(&state.slice_id) {
                slice.nof_ues = slice.nof_ues.saturating_sub(1);
            }
        }
    }

    fn rank_class(&self, rates: &UeRates, slice: Option<&SliceState>) -> RankClass {
        if rates.gbr_target_bps > 0.0 && rates.achieved_bps < rates.gbr_target_bps {
            return RankClass::GbrDeficit;
        }
        if let Some(slice) = slice {
            if slice.ewma_prb_ratio < slice.min_prb_ratio {
                return RankClass::SliceBelowMin;
            }
        }
        RankClass::Normal
    }

    /// Instantaneous achievable rate estimate from the last CQI
    fn instantaneous_rate_bps(&self, ue: &Ue) -> f64 {
        let pcell = ue.pcell();
        let table = pcell.applied_cfg.pdsch_mcs_table;
        let mcs = match cqi_to_mcs(pcell.channel_state.cqi, table) {
            Some(mcs) => mcs,
            None => return 0.0,
        };
        let entry = table.entry(mcs);
        let bits_per_re = entry.modulation_order as f64 * entry.code_rate_x1024 as f64 / 1024.0;
        // 12 subcarriers x 12 data symbols per PRB and slot.
        bits_per_re * 144.0 * self.nof_prbs as f64 * self.slots_per_sec
    }

    fn score(&self, ue: &Ue, rates: &UeRates, slice: Option<&SliceState>) -> f64 {
        let inst = self.instantaneous_rate_bps(ue);
        let pf = inst / rates.ewma_bps.max(MIN_EWMA_RATE_BPS);
        let gbr = if rates.gbr_target_bps > 0.0 {
            ((rates.gbr_target_bps - rates.achieved_bps) / rates.gbr_target_bps).max(0.0)
        } else {
            0.0
        };
        let slice_headroom = slice
            .map(|s| (s.max_prb_ratio - s.ewma_prb_ratio).max(0.0))
            .unwrap_or(0.0);
        ALPHA_PF * pf + BETA_GBR * gbr + GAMMA_SLICE * slice_headroom
    }

    /// Rank the backlogged UEs for one direction.
    ///
    /// Ordering: GBR deficit, then slice below minimum, then PF score,
    /// then lower UE index.
    pub fn rank(&self, ues: &UeTable, direction: Direction) -> Vec<DuUeIndex> {
        let mut candidates: Vec<(RankClass, f64, DuUeIndex)> = Vec::new();
        for ue in ues.iter() {
            let backlogged = match direction {
                Direction::Dl => ue.pending_dl_bytes() > 0 || ue.pcell().dl_harqs.has_inflight(),
                Direction::Ul => ue.pending_ul_newtx_bytes() > 0 || ue.pcell().ul_harqs.has_inflight(),
            };
            if !backlogged {
                continue;
            }
            let state = match self.ues.get(&ue.ue_index) {
                Some(state) => state,
                None => continue,
            };
            let rates = match direction {
                Direction::Dl => &state.dl,
                Direction::Ul => &state.ul,
            };
            let slice = self.slices.get(&state.slice_id);
            let class = self.rank_class(rates, slice);
            let score = self.score(ue, rates, slice);
            candidates.push((class, score, ue.ue_index));
        }
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.2.cmp(&b.2))
        });
        trace!("ranked {} candidate UEs for {:?}", candidates.len(), direction);
        candidates.into_iter().map(|(_, _, idx)| idx).collect()
    }

    /// Fold one slot's grants into the rate averages.
    ///
    /// Every registered UE is updated, scheduled or not, so the PF average
    /// decays for idle UEs and their priority recovers.
    pub fn on_slot_complete(&mut self, direction: Direction, grants: &[GrantSummary]) {
        let mut granted_bytes: HashMap<DuUeIndex, u32> = HashMap::new();
        let mut slice_prbs: HashMap<SliceId, u32> = HashMap::new();
        for grant in grants {
            *granted_bytes.entry(grant.ue_index).or_insert(0) += grant.bytes;
            if let Some(state) = self.ues.get(&grant.ue_index) {
                *slice_prbs.entry(state.slice_id).or_insert(0) += grant.nof_prbs as u32;
            }
        }

        for (ue_index, state) in self.ues.iter_mut() {
            let bytes = granted_bytes.get(ue_index).copied().unwrap_or(0);
            let inst_bps = bytes as f64 * 8.0 * self.slots_per_sec;
            let rates = match direction {
                Direction::Dl => &mut state.dl,
                Direction::Ul => &mut state.ul,
            };
            rates.ewma_bps = (1.0 - self.alpha_pf) * rates.ewma_bps + self.alpha_pf * inst_bps;
            rates.achieved_bps = (1.0 - self.alpha_gbr) * rates.achieved_bps + self.alpha_gbr * inst_bps;
        }

        if direction == Direction::Dl {
            for (slice_id, slice) in self.slices.iter_mut() {
                let used = slice_prbs.get(slice_id).copied().unwrap_or(0);
                let ratio = used as f64 / self.nof_prbs as f64;
                slice.ewma_prb_ratio = (1.0 - self.alpha_pf) * slice.ewma_prb_ratio + self.alpha_pf * ratio;
            }
        }
    }

    /// Smoothed achieved rate of a UE, used by tests and metrics
    pub fn achieved_rate_bps(&self, ue_index: DuUeIndex, direction: Direction) -> f64 {
        self.ues
            .get(&ue_index)
            .map(|state| match direction {
                Direction::Dl => state.dl.achieved_bps,
                Direction::Ul => state.ul.achieved_bps,
            })
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_util::test_cell_config;
    use crate::config::{GbrQosInfo, LogicalChannelConfig, QosConfig, RrmPolicy, UeCreationRequest};
    use crate::ue::Ue;
    use common::types::{AggregationLevel, DuCellIndex, FiveQi, Lcid, Rnti, SubcarrierSpacing};

    fn make_ue(index: u16, gbr_dl_bps: Option<u64>) -> Ue {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut drb = LogicalChannelConfig::drb(Lcid::MIN_DRB);
        if let Some(gbr) = gbr_dl_bps {
            drb.qos = Some(QosConfig {
                five_qi: FiveQi(2),
                gbr: Some(GbrQosInfo {
                    gbr_dl_bps: gbr,
                    gbr_ul_bps: gbr,
                    mbr_dl_bps: 2 * gbr,
                    mbr_ul_bps: 2 * gbr,
                }),
            });
        }
        let req = UeCreationRequest {
            ue_index: common::types::DuUeIndex(index),
            crnti: Rnti(0x4601 + index),
            pcell_index: DuCellIndex(0),
            lc_configs: vec![LogicalChannelConfig::srb1(), drb],
            sched_request_configs: vec![],
            preferred_aggregation_level: AggregationLevel::Al4,
        };
        Ue::new(&req, &cfg)
    }

    fn make_sliced_ue(index: u16, slice_id: SliceId, max_prb_ratio: f32) -> Ue {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut drb = LogicalChannelConfig::drb(Lcid::MIN_DRB);
        drb.rrm_policy = RrmPolicy {
            slice_id,
            min_prb_ratio: 0.0,
            max_prb_ratio,
        };
        let req = UeCreationRequest {
            ue_index: common::types::DuUeIndex(index),
            crnti: Rnti(0x4601 + index),
            pcell_index: DuCellIndex(0),
            lc_configs: vec![drb],
            sched_request_configs: vec![],
            preferred_aggregation_level: AggregationLevel::Al4,
        };
        Ue::new(&req, &cfg)
    }

    fn backlogged_table(ues: Vec<Ue>) -> UeTable {
        let mut table = UeTable::new();
        for mut ue in ues {
            ue.dl_lc.handle_dl_buffer_state(Lcid::MIN_DRB, 10_000_000);
            table.insert(Box::new(ue)).unwrap();
        }
        table
    }

    #[test]
    fn test_gbr_deficit_ranks_first() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut policy = TimePfPolicy::new(&cfg);

        let table = backlogged_table(vec![make_ue(0, None), make_ue(1, Some(10_000_000)), make_ue(2, None)]);
        for ue in table.iter() {
            policy.add_ue(ue);
        }

        let ranked = policy.rank(&table, Direction::Dl);
        assert_eq!(ranked[0], common::types::DuUeIndex(1), "GBR-deficit UE must rank first");
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_pf_recovers_starved_ue() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut policy = TimePfPolicy::new(&cfg);
        let table = backlogged_table(vec![make_ue(0, None), make_ue(1, None)]);
        for ue in table.iter() {
            policy.add_ue(ue);
        }

        // Keep granting UE0 only; its PF ratio must sink below UE1's.
        for _ in 0..50 {
            policy.on_slot_complete(
                Direction::Dl,
                &[GrantSummary {
                    ue_index: common::types::DuUeIndex(0),
                    bytes: 8000,
                    nof_prbs: 40,
                }],
            );
        }
        let ranked = policy.rank(&table, Direction::Dl);
        assert_eq!(ranked[0], common::types::DuUeIndex(1), "starved UE must outrank the served one");
    }

    #[test]
    fn test_gbr_class_clears_once_target_met() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut policy = TimePfPolicy::new(&cfg);
        let table = backlogged_table(vec![make_ue(0, Some(1_000))]);
        for ue in table.iter() {
            policy.add_ue(ue);
        }

        // Saturate the tiny GBR target.
        for _ in 0..5000 {
            policy.on_slot_complete(
                Direction::Dl,
                &[GrantSummary {
                    ue_index: common::types::DuUeIndex(0),
                    bytes: 8000,
                    nof_prbs: 10,
                }],
            );
        }
        assert!(policy.achieved_rate_bps(common::types::DuUeIndex(0), Direction::Dl) > 1_000.0);
    }

    #[test]
    fn test_slice_above_max_still_competes_on_pf() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut policy = TimePfPolicy::new(&cfg);
        let table = backlogged_table(vec![
            make_sliced_ue(0, SliceId(1), 0.01),
            make_ue(1, None),
        ]);
        for ue in table.iter() {
            policy.add_ue(ue);
        }

        // Push slice 1 well above its 1% cap.
        for _ in 0..20 {
            policy.on_slot_complete(
                Direction::Dl,
                &[GrantSummary {
                    ue_index: common::types::DuUeIndex(0),
                    bytes: 8000,
                    nof_prbs: 40,
                }],
            );
        }
        // Then starve UE0 while UE1 is served; slice 1 stays above its cap.
        for _ in 0..200 {
            policy.on_slot_complete(
                Direction::Dl,
                &[GrantSummary {
                    ue_index: common::types::DuUeIndex(1),
                    bytes: 8000,
                    nof_prbs: 40,
                }],
            );
        }

        // The overshooting slice only loses its headroom term; the starved
        // UE still wins on proportional fairness.
        let ranked = policy.rank(&table, Direction::Dl);
        assert_eq!(ranked[0], common::types::DuUeIndex(0));
    }

    #[test]
    fn test_idle_ues_not_ranked() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut policy = TimePfPolicy::new(&cfg);
        let mut table = UeTable::new();
        table.insert(Box::new(make_ue(0, None))).unwrap();
        policy.add_ue(table.get(common::types::DuUeIndex(0)).unwrap());

        assert!(policy.rank(&table, Direction::Dl).is_empty());
        assert!(policy.rank(&table, Direction::Ul).is_empty());
    }
}
