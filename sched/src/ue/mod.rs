//! UE Context Store
//!
//! The owning table of scheduler UEs, dense by `DuUeIndex`, plus the
//! non-owning RNTI reverse index. Each UE carries its serving cells
//! (element 0 is the PCell), logical channel managers and capability state.

pub mod capability;
pub mod harq;
pub mod logical_channel;

use crate::config::{CellConfig, UeCreationRequest, UeReconfigurationRequest};
use crate::mcs::OllaState;
use crate::SchedError;
use capability::{UeAppliedConfig, UeCapabilityManager};
use common::types::{AggregationLevel, DuCellIndex, DuUeIndex, Rnti, MAX_DU_UES, MAX_UE_CELLS};
use harq::HarqEntity;
use logical_channel::{DlLogicalChannelManager, UlLogicalChannelManager};
use std::collections::HashMap;
use tracing::debug;

/// Channel quality state tracked per serving cell
#[derive(Debug, Clone, Copy)]
pub struct ChannelState {
    /// Last wideband CQI report; 0 until the first report arrives
    pub cqi: u8,
    /// Last rank indicator
    pub ri: u8,
    /// DL outer-loop link adaptation
    pub dl_olla: OllaState,
    /// UL outer-loop link adaptation
    pub ul_olla: OllaState,
    /// Last timing advance estimate in microseconds
    pub last_ta_us: f32,
}

/// Context of one UE serving cell
pub struct UeCell {
    /// Cell this context belongs to
    pub cell_index: DuCellIndex,
    /// DL HARQ processes
    pub dl_harqs: HarqEntity,
    /// UL HARQ processes
    pub ul_harqs: HarqEntity,
    /// Capability-derived configuration
    pub applied_cfg: UeAppliedConfig,
    /// Channel quality state
    pub channel_state: ChannelState,
}

impl UeCell {
    fn new(cell_cfg: &CellConfig) -> Self {
        let expert = &cell_cfg.expert;
        Self {
            cell_index: cell_cfg.cell_index,
            dl_harqs: HarqEntity::new(cell_cfg.nof_harqs, cell_cfg.max_harq_retx),
            ul_harqs: HarqEntity::new(cell_cfg.nof_harqs, cell_cfg.max_harq_retx),
            applied_cfg: UeAppliedConfig::from_cell(cell_cfg),
            channel_state: ChannelState {
                // Conservative startup CQI until the first CSI report.
                cqi: 4,
                ri: 1,
                dl_olla: OllaState::new(expert.olla_step_db, expert.olla_max_offset_db),
                ul_olla: OllaState::new(expert.olla_step_db, expert.olla_max_offset_db),
                last_ta_us: 0.0,
            },
        }
    }
}

/// Scheduler context of one UE
pub struct Ue {
    /// Dense DU-local index, stable while the UE lives
    pub ue_index: DuUeIndex,
    /// C-RNTI
    pub crnti: Rnti,
    /// Serving cells; element 0 is the PCell
    cells: Vec<UeCell>,
    /// DL logical channels
    pub dl_lc: DlLogicalChannelManager,
    /// UL logical channels
    pub ul_lc: UlLogicalChannelManager,
    /// Capability manager
    pub capabilities: UeCapabilityManager,
    /// Logical channel configuration as last applied
    pub lc_configs: Vec<crate::config::LogicalChannelConfig>,
    /// Scheduling request configuration
    pub sched_request_configs: Vec<crate::config::SchedRequestConfig>,
    /// Preferred PDCCH aggregation level
    pub preferred_al: AggregationLevel,
}

impl Ue {
    /// Build the UE from a creation request against its PCell config
    pub fn new(req: &UeCreationRequest, pcell_cfg: &CellConfig) -> Self {
        let mut dl_lc = DlLogicalChannelManager::default();
        dl_lc.configure(&req.lc_configs);
        let mut ue = Self {
            ue_index: req.ue_index,
            crnti: req.crnti,
            cells: Vec::with_capacity(MAX_UE_CELLS),
            dl_lc,
            ul_lc: UlLogicalChannelManager::default(),
            capabilities: UeCapabilityManager::default(),
            lc_configs: req.lc_configs.clone(),
            sched_request_configs: req.sched_request_configs.clone(),
            preferred_al: req.preferred_aggregation_level,
        };
        ue.cells.push(UeCell::new(pcell_cfg));
        ue
    }

    /// PCell context
    pub fn pcell(&self) -> &UeCell {
        &self.cells[0]
    }

    /// Mutable PCell context
    pub fn pcell_mut(&mut self) -> &mut UeCell {
        &mut self.cells[0]
    }

    /// Serving cell context by DU cell index
    pub fn find_cell(&self, cell_index: DuCellIndex) -> Option<&UeCell> {
        self.cells.iter().find(|c| c.cell_index == cell_index)
    }

    /// Mutable serving cell context by DU cell index
    pub fn find_cell_mut(&mut self, cell_index: DuCellIndex) -> Option<&mut UeCell> {
        self.cells.iter_mut().find(|c| c.cell_index == cell_index)
    }

    /// Number of configured serving cells
    pub fn nof_cells(&self) -> usize {
        self.cells.len()
    }

    /// Apply a reconfiguration
    pub fn handle_reconfiguration(&mut self, req: &UeReconfigurationRequest) {
        if let Some(lc_configs) = &req.lc_configs {
            self.dl_lc.configure(lc_configs);
            self.lc_configs = lc_configs.clone();
        }
    }

    /// Bytes pending a fresh DL transmission
    pub fn pending_dl_bytes(&self) -> u64 {
        self.dl_lc.pending_bytes()
    }

    /// Bytes pending a fresh UL transmission
    pub fn pending_ul_newtx_bytes(&self) -> u64 {
        self.ul_lc.pending_newtx_bytes()
    }
}

/// Owning table of scheduler UEs, dense by `DuUeIndex`
pub struct UeTable {
    ues: Vec<Option<Box<Ue>>>,
    nof_ues: usize,
}

impl Default for UeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            ues: (0..MAX_DU_UES).map(|_| None).collect(),
            nof_ues: 0,
        }
    }

    /// Number of alive UEs
    pub fn len(&self) -> usize {
        self.nof_ues
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.nof_ues == 0
    }

    /// Insert a new UE; the index must be free
    pub fn insert(&mut self, ue: Box<Ue>) -> Result<(), SchedError> {
        let idx = ue.ue_index.value();
        if self.ues[idx].is_some() {
            return Err(SchedError::DuplicateUe(ue.ue_index));
        }
        self.ues[idx] = Some(ue);
        self.nof_ues += 1;
        Ok(())
    }

    /// Look up a UE
    pub fn get(&self, ue_index: DuUeIndex) -> Option<&Ue> {
        self.ues[ue_index.value()].as_deref()
    }

    /// Mutable lookup
    pub fn get_mut(&mut self, ue_index: DuUeIndex) -> Option<&mut Ue> {
        self.ues[ue_index.value()].as_deref_mut()
    }

    /// Remove and return a UE
    pub fn remove(&mut self, ue_index: DuUeIndex) -> Option<Box<Ue>> {
        let removed = self.ues[ue_index.value()].take();
        if removed.is_some() {
            self.nof_ues -= 1;
            debug!("UE {:?} removed from the table", ue_index);
        }
        removed
    }

    /// Iterate over alive UEs
    pub fn iter(&self) -> impl Iterator<Item = &Ue> {
        self.ues.iter().filter_map(|slot| slot.as_deref())
    }

    /// Iterate mutably over alive UEs
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Ue> {
        self.ues.iter_mut().filter_map(|slot| slot.as_deref_mut())
    }
}

/// Non-owning reverse map from RNTI to UE index.
///
/// Invariant: an entry exists exactly for alive UEs, and
/// `table[index].crnti == rnti` whenever `lookup(rnti) == Some(index)`.
#[derive(Default)]
pub struct RntiIndex {
    map: HashMap<Rnti, DuUeIndex>,
}

impl RntiIndex {
    /// Register a UE
    pub fn insert(&mut self, rnti: Rnti, ue_index: DuUeIndex) -> Result<(), SchedError> {
        if self.map.contains_key(&rnti) {
            return Err(SchedError::InvalidArgument(format!("RNTI {:#06x} already registered", rnti.0)));
        }
        self.map.insert(rnti, ue_index);
        Ok(())
    }

    /// Drop a UE registration
    pub fn remove(&mut self, rnti: Rnti) -> Option<DuUeIndex> {
        self.map.remove(&rnti)
    }

    /// Reverse lookup
    pub fn lookup(&self, rnti: Rnti) -> Option<DuUeIndex> {
        self.map.get(&rnti).copied()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
