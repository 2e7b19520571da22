//! Scheduler Facade
//!
//! The entry point MAC and upper layers talk to: owns the UE table, the
//! RNTI reverse index and one `CellScheduler` per cell, routes buffered
//! indications to the owning cell and drives the per-slot runs.

use crate::cell_scheduler::CellScheduler;
use crate::config::{CellConfig, UeCreationRequest, UeReconfigurationRequest};
use crate::messages::{
    BsrIndication, DlBufferStateIndication, MacCeIndication, PhrIndication, RachIndicationMessage,
    SrIndication, UeIndication,
};
use crate::metrics::SchedulerMetricsNotifier;
use crate::result::SchedResult;
use crate::uci::{MacUciIndication, UlCrcIndication};
use crate::ue::{RntiIndex, Ue, UeTable};
use crate::{SchedError, SchedResultNotifier};
use bytes::Bytes;
use common::types::{DuCellIndex, DuUeIndex};
use common::SlotPoint;
use std::sync::Arc;
use tracing::{debug, info};

/// The MAC scheduler of a cell group
pub struct Scheduler {
    cells: Vec<CellScheduler>,
    ues: UeTable,
    rnti_index: RntiIndex,
    result_notifier: Arc<dyn SchedResultNotifier>,
    metrics_notifier: Arc<dyn SchedulerMetricsNotifier>,
}

impl Scheduler {
    /// Create an empty scheduler; cells are added one by one.
    pub fn new(
        result_notifier: Arc<dyn SchedResultNotifier>,
        metrics_notifier: Arc<dyn SchedulerMetricsNotifier>,
    ) -> Self {
        Self {
            cells: Vec::new(),
            ues: UeTable::new(),
            rnti_index: RntiIndex::default(),
            result_notifier,
            metrics_notifier,
        }
    }

    /// Add a cell. Configuration errors abort startup.
    pub fn add_cell(&mut self, cfg: CellConfig) -> Result<DuCellIndex, SchedError> {
        cfg.validate().map_err(SchedError::InvalidArgument)?;
        if self.find_cell(cfg.cell_index).is_some() {
            return Err(SchedError::InvalidArgument(format!(
                "cell index {:?} already configured",
                cfg.cell_index
            )));
        }
        let cell_index = cfg.cell_index;
        info!("scheduler cell {:?} added: pci={}, {} PRBs", cell_index, cfg.pci.0, cfg.nof_prbs);
        self.cells.push(CellScheduler::new(cfg));
        Ok(cell_index)
    }

    /// Number of alive UEs
    pub fn nof_ues(&self) -> usize {
        self.ues.len()
    }

    /// Inspect a UE context
    pub fn ue(&self, ue_index: DuUeIndex) -> Option<&Ue> {
        self.ues.get(ue_index)
    }

    /// Reverse RNTI lookup
    pub fn lookup_rnti(&self, rnti: common::types::Rnti) -> Option<DuUeIndex> {
        self.rnti_index.lookup(rnti)
    }

    fn find_cell(&self, cell_index: DuCellIndex) -> Option<&CellScheduler> {
        self.cells.iter().find(|c| c.cfg.cell_index == cell_index)
    }

    fn find_cell_mut(&mut self, cell_index: DuCellIndex) -> Result<&mut CellScheduler, SchedError> {
        self.cells
            .iter_mut()
            .find(|c| c.cfg.cell_index == cell_index)
            .ok_or(SchedError::CellNotFound(cell_index))
    }

    fn pcell_of(&self, ue_index: DuUeIndex) -> Result<DuCellIndex, SchedError> {
        self.ues
            .get(ue_index)
            .map(|ue| ue.pcell().cell_index)
            .ok_or(SchedError::UeNotFound(ue_index))
    }

    /// Admit a UE.
    ///
    /// Fails with `DuplicateUe` when the index is in use; the RNTI must be
    /// unique among alive UEs as well.
    pub fn handle_ue_creation(&mut self, req: UeCreationRequest) -> Result<(), SchedError> {
        if !req.crnti.is_crnti() {
            return Err(SchedError::InvalidArgument(format!("invalid C-RNTI {:#06x}", req.crnti.0)));
        }
        if self.ues.get(req.ue_index).is_some() {
            return Err(SchedError::DuplicateUe(req.ue_index));
        }
        let cell = self
            .cells
            .iter_mut()
            .find(|c| c.cfg.cell_index == req.pcell_index)
            .ok_or(SchedError::CellNotFound(req.pcell_index))?;

        let ue = Box::new(Ue::new(&req, &cell.cfg));
        self.rnti_index.insert(req.crnti, req.ue_index)?;
        cell.policy.add_ue(&ue);
        cell.metrics.handle_ue_creation(req.ue_index, req.crnti);
        self.ues.insert(ue)?;
        info!("UE {:?} created with RNTI {:#06x}", req.ue_index, req.crnti.0);
        Ok(())
    }

    /// Apply a UE reconfiguration; takes effect from the next slot run.
    pub fn handle_ue_reconfiguration(&mut self, req: UeReconfigurationRequest) -> Result<(), SchedError> {
        let pcell = self.pcell_of(req.ue_index)?;
        let ue = self.ues.get_mut(req.ue_index).ok_or(SchedError::UeNotFound(req.ue_index))?;
        ue.handle_reconfiguration(&req);
        let ue_index = req.ue_index;
        let cell = self
            .cells
            .iter_mut()
            .find(|c| c.cfg.cell_index == pcell)
            .ok_or(SchedError::CellNotFound(pcell))?;
        // Slice/GBR membership may have changed; re-register with policy.
        if let Some(ue) = self.ues.get(ue_index) {
            cell.policy.remove_ue(ue_index);
            cell.policy.add_ue(ue);
        }
        cell.metrics.handle_ue_reconfiguration(ue_index);
        Ok(())
    }

    /// Remove a UE from all scheduler state.
    ///
    /// The executor-level drain happens in the DU layer before this call;
    /// once this returns, no slot run will reference the UE again.
    pub fn handle_ue_deletion(&mut self, ue_index: DuUeIndex) -> Result<(), SchedError> {
        let pcell = self.pcell_of(ue_index)?;
        let ue = self.ues.remove(ue_index).ok_or(SchedError::UeNotFound(ue_index))?;
        self.rnti_index.remove(ue.crnti);
        let cell = self.find_cell_mut(pcell)?;
        cell.policy.remove_ue(ue_index);
        cell.metrics.handle_ue_deletion(ue_index);
        info!("UE {:?} deleted", ue_index);
        Ok(())
    }

    /// PRACH occasion report
    pub fn handle_rach_indication(&mut self, msg: RachIndicationMessage) -> Result<(), SchedError> {
        let cell = self.find_cell_mut(msg.cell_index)?;
        cell.enqueue_rach(msg);
        Ok(())
    }

    /// UL buffer status report
    pub fn handle_bsr_indication(&mut self, msg: BsrIndication) -> Result<(), SchedError> {
        let pcell = self.pcell_of(msg.ue_index)?;
        self.find_cell_mut(pcell)?.enqueue_ue_indication(UeIndication::Bsr(msg));
        Ok(())
    }

    /// Power headroom report
    pub fn handle_phr_indication(&mut self, msg: PhrIndication) -> Result<(), SchedError> {
        let pcell = self.pcell_of(msg.ue_index)?;
        self.find_cell_mut(pcell)?.enqueue_ue_indication(UeIndication::Phr(msg));
        Ok(())
    }

    /// Scheduling request
    pub fn handle_sr_indication(&mut self, msg: SrIndication) -> Result<(), SchedError> {
        let pcell = self.pcell_of(msg.ue_index)?;
        self.find_cell_mut(pcell)?.enqueue_ue_indication(UeIndication::Sr(msg));
        Ok(())
    }

    /// DL buffer occupancy update
    pub fn handle_dl_buffer_state_indication(&mut self, msg: DlBufferStateIndication) -> Result<(), SchedError> {
        let pcell = self.pcell_of(msg.ue_index)?;
        self.find_cell_mut(pcell)?
            .enqueue_ue_indication(UeIndication::DlBufferState(msg));
        Ok(())
    }

    /// Pending MAC CE
    pub fn handle_mac_ce_indication(&mut self, msg: MacCeIndication) -> Result<(), SchedError> {
        let pcell = self.pcell_of(msg.ue_index)?;
        self.find_cell_mut(pcell)?.enqueue_ue_indication(UeIndication::MacCe(msg));
        Ok(())
    }

    /// UCI indication from the PHY
    pub fn handle_uci_indication(&mut self, msg: MacUciIndication) -> Result<(), SchedError> {
        self.find_cell_mut(msg.cell_index)?.enqueue_uci(msg);
        Ok(())
    }

    /// CRC indication from the PHY
    pub fn handle_crc_indication(&mut self, msg: UlCrcIndication) -> Result<(), SchedError> {
        self.find_cell_mut(msg.cell_index)?.enqueue_crc(msg);
        Ok(())
    }

    /// Lower-layer error indication; counted, no state change.
    pub fn handle_error_indication(&mut self, cell_index: DuCellIndex) -> Result<(), SchedError> {
        self.find_cell_mut(cell_index)?.metrics.handle_error_indication();
        Ok(())
    }

    /// UE capability container update, applied on the PCell.
    pub fn handle_capability_update(&mut self, ue_index: DuUeIndex, container: Bytes) -> Result<(), SchedError> {
        let pcell = self.pcell_of(ue_index)?;
        let cell_cfg = self.find_cell(pcell).ok_or(SchedError::CellNotFound(pcell))?.cfg.clone();
        let ue = self.ues.get_mut(ue_index).ok_or(SchedError::UeNotFound(ue_index))?;
        let mut applied = ue.pcell().applied_cfg;
        ue.capabilities.update(&mut applied, &cell_cfg, &container)?;
        ue.pcell_mut().applied_cfg = applied;
        debug!("UE {:?} capability update applied: {:?}", ue_index, applied);
        Ok(())
    }

    /// Run one slot for one cell and publish the result.
    pub fn run_slot(&mut self, slot: SlotPoint, cell_index: DuCellIndex) -> Result<&SchedResult, SchedError> {
        let cell = self
            .cells
            .iter_mut()
            .find(|c| c.cfg.cell_index == cell_index)
            .ok_or(SchedError::CellNotFound(cell_index))?;
        let result = cell.run_slot(slot, &mut self.ues, &self.rnti_index, self.metrics_notifier.as_ref());
        self.result_notifier.on_sched_result(result);
        debug!(
            "slot {} cell {:?}: {} DL grants, {} UL grants",
            slot,
            cell_index,
            result.dl.ue_grants.len(),
            result.ul.pusch_grants.len()
        );
        Ok(result)
    }
}
