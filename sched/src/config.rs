//! Scheduler Configuration Structures
//!
//! Cell-level and UE-level configuration consumed by the scheduler core.
//! The YAML surface lives in the DU application; these are the decoded
//! structures it hands over.

use crate::mcs::McsTable;
use common::types::{
    AggregationLevel, Bandwidth, DuCellIndex, DuplexMode, FiveQi, Lcid, LcgId, NrBand, Pci,
    SliceId, SubcarrierSpacing,
};
use common::SlotPoint;

/// TDD UL/DL pattern over a repeating window of slots.
///
/// The first `nof_dl_slots` of the period are downlink, the last
/// `nof_ul_slots` uplink; slots in between carry neither shared channel
/// (guard/special slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TddPattern {
    /// Pattern period in slots
    pub period_slots: u32,
    /// Number of leading DL slots
    pub nof_dl_slots: u32,
    /// Number of trailing UL slots
    pub nof_ul_slots: u32,
}

impl TddPattern {
    /// DDDSU-style pattern over 5 slots
    pub fn dddsu() -> Self {
        Self {
            period_slots: 5,
            nof_dl_slots: 3,
            nof_ul_slots: 1,
        }
    }

    fn slot_in_period(&self, slot: SlotPoint) -> u32 {
        slot.count() % self.period_slots
    }

    /// Whether PDSCH can be scheduled in this slot
    pub fn is_dl_slot(&self, slot: SlotPoint) -> bool {
        self.slot_in_period(slot) < self.nof_dl_slots
    }

    /// Whether PUSCH/PUCCH can be scheduled in this slot
    pub fn is_ul_slot(&self, slot: SlotPoint) -> bool {
        self.slot_in_period(slot) >= self.period_slots - self.nof_ul_slots
    }
}

/// CORESET geometry for UE-dedicated PDCCH
#[derive(Debug, Clone, Copy)]
pub struct CoresetConfig {
    /// Total number of CCEs in the CORESET
    pub nof_cces: u8,
}

/// Search space candidate counts, indexed like `AggregationLevel::ALL`
#[derive(Debug, Clone, Copy)]
pub struct SearchSpaceConfig {
    /// Number of PDCCH candidates per aggregation level {1,2,4,8,16}
    pub nof_candidates: [u8; 5],
}

impl Default for SearchSpaceConfig {
    fn default() -> Self {
        Self {
            // TS 38.213 typical USS candidate set
            nof_candidates: [0, 2, 2, 2, 1],
        }
    }
}

/// Expert scheduler knobs
#[derive(Debug, Clone, Copy)]
pub struct SchedulerExpertConfig {
    /// Proportional-fair averaging time constant, in slots
    pub pf_time_constant: u32,
    /// Outer-loop link adaptation step in dB
    pub olla_step_db: f32,
    /// Bound on the OLLA offset in dB
    pub olla_max_offset_db: f32,
    /// L1 pipeline depth: slots between a UL reception and its feedback
    /// reaching the scheduler
    pub max_processing_delay_slots: u32,
    /// PUSCH decoder iteration cap (forwarded to PHY)
    pub pusch_dec_max_iterations: u32,
    /// PUSCH decoder early-stop (forwarded to PHY)
    pub pusch_dec_enable_early_stop: bool,
}

impl Default for SchedulerExpertConfig {
    fn default() -> Self {
        Self {
            pf_time_constant: 100,
            olla_step_db: 0.25,
            olla_max_offset_db: 3.0,
            max_processing_delay_slots: 4,
            pusch_dec_max_iterations: 6,
            pusch_dec_enable_early_stop: true,
        }
    }
}

/// Static configuration of one cell
#[derive(Debug, Clone)]
pub struct CellConfig {
    /// DU-local cell index
    pub cell_index: DuCellIndex,
    /// Physical cell id
    pub pci: Pci,
    /// Subcarrier spacing of the active BWP
    pub scs: SubcarrierSpacing,
    /// Channel bandwidth
    pub bandwidth: Bandwidth,
    /// Number of PRBs in the active BWP
    pub nof_prbs: u16,
    /// NR band the cell operates in
    pub band: NrBand,
    /// Duplex mode
    pub duplex: DuplexMode,
    /// TDD pattern; `None` for FDD
    pub tdd: Option<TddPattern>,
    /// PDSCH-to-HARQ-ACK delay in slots
    pub k1: u32,
    /// UL-grant-to-PUSCH delay in slots
    pub k2: u32,
    /// Number of HARQ processes per UE per direction
    pub nof_harqs: u8,
    /// Maximum retransmissions before a HARQ process is dropped
    pub max_harq_retx: u8,
    /// Slots a process may sit in waiting-ack past its ack slot before it
    /// is dropped
    pub harq_retx_timeout_slots: u32,
    /// CORESET geometry
    pub coreset: CoresetConfig,
    /// Search space candidates
    pub search_space: SearchSpaceConfig,
    /// PDSCH MCS table configured for the cell
    pub pdsch_mcs_table: McsTable,
    /// PUSCH MCS table configured for the cell
    pub pusch_mcs_table: McsTable,
    /// Maximum number of PUSCH layers the cell supports
    pub pusch_max_nof_layers: u8,
    /// PRBs reserved at the bottom of the BWP for SSB/CORESET#0
    pub nof_reserved_dl_prbs: u16,
    /// Metrics report period in milliseconds; zero disables reporting
    pub metrics_report_period_ms: u32,
    /// Expert knobs
    pub expert: SchedulerExpertConfig,
}

impl CellConfig {
    /// Basic validation run at cell creation
    pub fn validate(&self) -> Result<(), String> {
        let prb_bound = self.bandwidth.max_nof_prbs(self.scs);
        if self.nof_prbs == 0 || self.nof_prbs > prb_bound {
            return Err(format!(
                "nof_prbs {} does not fit {}Hz at {:?}",
                self.nof_prbs,
                self.bandwidth.as_hz(),
                self.scs
            ));
        }
        if self.nof_reserved_dl_prbs >= self.nof_prbs {
            return Err("reserved PRBs cover the whole BWP".to_string());
        }
        if self.duplex == DuplexMode::Tdd && self.tdd.is_none() {
            return Err("TDD cell without TDD pattern".to_string());
        }
        if self.nof_harqs == 0 || self.nof_harqs > 16 {
            return Err(format!("invalid number of HARQ processes {}", self.nof_harqs));
        }
        Ok(())
    }

    /// Whether PDSCH can go into this slot
    pub fn is_dl_slot(&self, slot: SlotPoint) -> bool {
        match &self.tdd {
            Some(pattern) => pattern.is_dl_slot(slot),
            None => true,
        }
    }

    /// Whether PUSCH/PUCCH can go into this slot
    pub fn is_ul_slot(&self, slot: SlotPoint) -> bool {
        match &self.tdd {
            Some(pattern) => pattern.is_ul_slot(slot),
            None => true,
        }
    }
}

/// RRM slice policy attached to a logical channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RrmPolicy {
    /// Slice the channel belongs to
    pub slice_id: SliceId,
    /// Minimum fraction of cell PRBs the slice is entitled to
    pub min_prb_ratio: f32,
    /// Maximum fraction of cell PRBs the slice may consume
    pub max_prb_ratio: f32,
}

impl Default for RrmPolicy {
    fn default() -> Self {
        Self {
            slice_id: SliceId(0),
            min_prb_ratio: 0.0,
            max_prb_ratio: 1.0,
        }
    }
}

/// GBR QoS parameters in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GbrQosInfo {
    /// Guaranteed DL bit rate
    pub gbr_dl_bps: u64,
    /// Guaranteed UL bit rate
    pub gbr_ul_bps: u64,
    /// Maximum DL bit rate
    pub mbr_dl_bps: u64,
    /// Maximum UL bit rate
    pub mbr_ul_bps: u64,
}

/// QoS parameters of a logical channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosConfig {
    /// 5G QoS identifier
    pub five_qi: FiveQi,
    /// GBR parameters, absent for non-GBR channels
    pub gbr: Option<GbrQosInfo>,
}

/// Configuration of one logical channel
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalChannelConfig {
    /// Logical channel id
    pub lcid: Lcid,
    /// Priority, lower value served first
    pub priority: u8,
    /// Prioritised bit rate in kbit/s
    pub pbr_kbps: u32,
    /// Bucket size duration in ms
    pub bsd_ms: u32,
    /// Logical channel group for BSR reporting
    pub lcg_id: LcgId,
    /// RRM slice policy
    pub rrm_policy: RrmPolicy,
    /// QoS parameters
    pub qos: Option<QosConfig>,
}

impl LogicalChannelConfig {
    /// A plain SRB1 configuration
    pub fn srb1() -> Self {
        Self {
            lcid: Lcid::SRB1,
            priority: 1,
            pbr_kbps: 0,
            bsd_ms: 0,
            lcg_id: LcgId(0),
            rrm_policy: RrmPolicy::default(),
            qos: None,
        }
    }

    /// A default non-GBR DRB on the given LCID
    pub fn drb(lcid: Lcid) -> Self {
        Self {
            lcid,
            priority: 10,
            pbr_kbps: 8,
            bsd_ms: 100,
            lcg_id: LcgId(1),
            rrm_policy: RrmPolicy::default(),
            qos: Some(QosConfig {
                five_qi: FiveQi::DEFAULT,
                gbr: None,
            }),
        }
    }
}

/// Scheduling request configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedRequestConfig {
    /// SR identifier
    pub sr_id: u8,
    /// Prohibit timer in ms
    pub prohibit_timer_ms: u32,
    /// Maximum SR transmissions before RACH fallback
    pub max_tx: u32,
}

/// Request to create a UE in the scheduler
#[derive(Debug, Clone)]
pub struct UeCreationRequest {
    /// Dense DU-local index chosen by the DU manager
    pub ue_index: common::types::DuUeIndex,
    /// C-RNTI
    pub crnti: common::types::Rnti,
    /// Serving cell of the PCell
    pub pcell_index: DuCellIndex,
    /// Logical channel configuration
    pub lc_configs: Vec<LogicalChannelConfig>,
    /// Scheduling request configuration
    pub sched_request_configs: Vec<SchedRequestConfig>,
    /// Preferred PDCCH aggregation level
    pub preferred_aggregation_level: AggregationLevel,
}

/// Request to reconfigure an existing UE
#[derive(Debug, Clone)]
pub struct UeReconfigurationRequest {
    /// UE to reconfigure
    pub ue_index: common::types::DuUeIndex,
    /// Replacement logical channel configuration, if changed
    pub lc_configs: Option<Vec<LogicalChannelConfig>>,
}


#[cfg(test)]
mod tests {
    use super::test_util::test_cell_config;
    use super::*;
    use common::types::Rnti;

    #[test]
    fn test_tdd_pattern_classification() {
        let pattern = TddPattern::dddsu();
        let scs = SubcarrierSpacing::Scs30;
        for count in 0..10u32 {
            let slot = SlotPoint::from_count(scs, count);
            let pos = count % 5;
            assert_eq!(pattern.is_dl_slot(slot), pos < 3, "slot {}", count);
            assert_eq!(pattern.is_ul_slot(slot), pos == 4, "slot {}", count);
        }
    }

    #[test]
    fn test_cell_config_validation() {
        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, Some(TddPattern::dddsu()));
        assert!(cfg.validate().is_ok());

        cfg.nof_prbs = 500;
        assert!(cfg.validate().is_err());

        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        cfg.duplex = DuplexMode::Tdd;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_ue_creation_request_shape() {
        let req = UeCreationRequest {
            ue_index: common::types::DuUeIndex(0),
            crnti: Rnti(0x4601),
            pcell_index: DuCellIndex(0),
            lc_configs: vec![LogicalChannelConfig::srb1(), LogicalChannelConfig::drb(Lcid::MIN_DRB)],
            sched_request_configs: vec![],
            preferred_aggregation_level: AggregationLevel::Al4,
        };
        assert_eq!(req.lc_configs.len(), 2);
        assert!(req.lc_configs[1].lcid.is_drb());
    }
}
