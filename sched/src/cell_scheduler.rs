//! Slot Orchestrator
//!
//! Drives one cell through its per-slot sequence: advance the clock and
//! expire stale state, drain buffered feedback, rank UEs, allocate, record
//! the result. The whole run is synchronous and must finish within half a
//! slot; an overrun is counted and the scheduler carries on.

use crate::allocator::{allocate_dl_slot, allocate_ul_slot};
use crate::cell::resource_grid::CellResourceGrid;
use crate::config::CellConfig;
use crate::messages::{RachIndicationMessage, UeIndication};
use crate::metrics::{CellMetricsHandler, SchedulerMetricsNotifier};
use crate::policy::{Direction, GrantSummary, TimePfPolicy};
use crate::result::{DlSchedResult, SchedResult, UlSchedResult};
use crate::uci::{MacUciIndication, UciCellDecoder, UlCrcIndication};
use crate::ue::{RntiIndex, UeTable};
use common::SlotPoint;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Scheduler state of one cell
pub struct CellScheduler {
    /// Cell configuration
    pub cfg: CellConfig,
    grid: CellResourceGrid,
    uci: UciCellDecoder,
    /// Policy state of the cell
    pub policy: TimePfPolicy,
    /// Metrics handler of the cell
    pub metrics: CellMetricsHandler,
    pending_uci: Vec<MacUciIndication>,
    pending_crc: Vec<UlCrcIndication>,
    pending_ue_ind: Vec<UeIndication>,
    pending_rach: Vec<RachIndicationMessage>,
    last_slot: Option<SlotPoint>,
    last_result: Option<SchedResult>,
    slot_budget: Duration,
}

impl CellScheduler {
    /// Build the scheduler state for one cell
    pub fn new(cfg: CellConfig) -> Self {
        let slot_duration = cfg.scs.slot_duration();
        Self {
            grid: CellResourceGrid::new(&cfg),
            uci: UciCellDecoder::new(&cfg),
            policy: TimePfPolicy::new(&cfg),
            metrics: CellMetricsHandler::new(&cfg),
            pending_uci: Vec::new(),
            pending_crc: Vec::new(),
            pending_ue_ind: Vec::new(),
            pending_rach: Vec::new(),
            last_slot: None,
            last_result: None,
            // Decision budget: half the slot, the rest belongs to the PHY.
            slot_budget: slot_duration / 2,
            cfg,
        }
    }

    /// Buffer a UCI indication until the next slot run
    pub fn enqueue_uci(&mut self, msg: MacUciIndication) {
        self.pending_uci.push(msg);
    }

    /// Buffer a CRC indication until the next slot run
    pub fn enqueue_crc(&mut self, msg: UlCrcIndication) {
        self.pending_crc.push(msg);
    }

    /// Buffer a per-UE indication until the next slot run
    pub fn enqueue_ue_indication(&mut self, ind: UeIndication) {
        self.pending_ue_ind.push(ind);
    }

    /// Buffer a RACH indication until the next slot run
    pub fn enqueue_rach(&mut self, msg: RachIndicationMessage) {
        self.pending_rach.push(msg);
    }

    /// Result of the last slot run
    pub fn last_result(&self) -> Option<&SchedResult> {
        self.last_result.as_ref()
    }

    /// Run one slot for this cell.
    ///
    /// Must be called with strictly increasing slots on the cell's strand;
    /// it never suspends.
    pub fn run_slot(
        &mut self,
        slot: SlotPoint,
        ues: &mut UeTable,
        rnti_index: &RntiIndex,
        metrics_notifier: &dyn SchedulerMetricsNotifier,
    ) -> &SchedResult {
        let started = Instant::now();
        self.tick(slot, ues);
        self.collect_feedback(ues, rnti_index);

        let pdcch_capable = self.cfg.is_dl_slot(slot);
        let mut dl = DlSchedResult::default();
        let mut ul = UlSchedResult::default();

        if pdcch_capable {
            let ranked_dl = self.policy.rank(ues, Direction::Dl);
            let dl_outcome = allocate_dl_slot(&self.cfg, &mut self.grid, ues, &ranked_dl, slot);
            for (uci_slot, pucch) in &dl_outcome.pucchs {
                self.uci.store_uci(*uci_slot, std::slice::from_ref(pucch));
            }
            self.metrics.handle_alloc_failures(
                dl_outcome.counters.pdcch_alloc_failures,
                dl_outcome.counters.harq_exhausted,
            );
            self.policy.on_slot_complete(
                Direction::Dl,
                &dl_outcome
                    .grants
                    .iter()
                    .map(|g| GrantSummary {
                        ue_index: g.ue_index,
                        bytes: g.tbs_bytes,
                        nof_prbs: g.prbs.len(),
                    })
                    .collect::<Vec<_>>(),
            );
            dl.ue_grants = dl_outcome.grants;

            let ranked_ul = self.policy.rank(ues, Direction::Ul);
            let ul_outcome = allocate_ul_slot(&self.cfg, &mut self.grid, ues, &ranked_ul, slot);
            self.metrics.handle_alloc_failures(
                ul_outcome.counters.pdcch_alloc_failures,
                ul_outcome.counters.harq_exhausted,
            );
            self.policy.on_slot_complete(
                Direction::Ul,
                &ul_outcome
                    .grants
                    .iter()
                    .map(|g| GrantSummary {
                        ue_index: g.ue_index,
                        bytes: g.tbs_bytes,
                        nof_prbs: g.prbs.len(),
                    })
                    .collect::<Vec<_>>(),
            );
            ul.pusch_grants = ul_outcome.grants;
        } else {
            // Keep the averages decaying on non-PDCCH slots too.
            self.policy.on_slot_complete(Direction::Dl, &[]);
            self.policy.on_slot_complete(Direction::Ul, &[]);
        }

        // PUCCHs expected in this very slot were committed by earlier runs.
        ul.pucchs = self.grid.slot(slot).pucchs.clone();

        let latency = started.elapsed();
        if latency > self.slot_budget {
            warn!("slot {} decision took {:?}, budget {:?}", slot, latency, self.slot_budget);
            self.metrics.handle_slot_deadline_missed();
        }

        let result = SchedResult {
            cell_index: self.cfg.cell_index,
            slot,
            dl,
            ul,
            latency,
        };
        self.metrics.push_result(&result, metrics_notifier);
        self.last_slot = Some(slot);
        self.last_result = Some(result);
        self.last_result.as_ref().unwrap()
    }

    /// Advance time: recycle ring entries and expire HARQ processes.
    fn tick(&mut self, slot: SlotPoint, ues: &mut UeTable) {
        if let Some(last) = self.last_slot {
            debug_assert!(slot - last >= 1, "slot {} not after {}", slot, last);
        }
        // The previous slot's commitments are history.
        self.grid.reset_slot(slot - 1);
        // UCI contexts survive until the PHY can no longer report them.
        let horizon = self.cfg.expert.max_processing_delay_slots as i32 + 1;
        self.uci.evict_slot(slot - horizon);

        let timeout = self.cfg.harq_retx_timeout_slots;
        let mut timeouts = 0;
        let cell_index = self.cfg.cell_index;
        for ue in ues.iter_mut() {
            if let Some(cell) = ue.find_cell_mut(cell_index) {
                timeouts += cell.dl_harqs.expire_timeouts(slot, timeout);
                timeouts += cell.ul_harqs.expire_timeouts(slot, timeout);
            }
        }
        if timeouts > 0 {
            trace!("{} HARQ processes timed out at {}", timeouts, slot);
            self.metrics.handle_harq_timeouts(timeouts);
        }
    }

    /// Drain every buffered indication into the UE/scheduler state.
    fn collect_feedback(&mut self, ues: &mut UeTable, rnti_index: &RntiIndex) {
        for msg in std::mem::take(&mut self.pending_rach) {
            self.metrics.handle_rach_indication(msg.preambles.len() as u32);
        }

        for ind in std::mem::take(&mut self.pending_ue_ind) {
            match ind {
                UeIndication::Bsr(bsr) => {
                    if let Some(ue) = ues.get_mut(bsr.ue_index) {
                        for report in &bsr.reports {
                            ue.ul_lc.handle_bsr(report.lcg_id, report.bytes);
                        }
                        let total: u64 = bsr.reports.iter().map(|r| r.bytes as u64).sum();
                        self.metrics.handle_bsr(bsr.ue_index, total);
                    }
                }
                UeIndication::Phr(phr) => {
                    self.metrics.handle_phr(phr.ue_index, phr.phr_db);
                }
                UeIndication::Sr(sr) => {
                    if let Some(ue) = ues.get_mut(sr.ue_index) {
                        ue.ul_lc.handle_sr();
                    }
                }
                UeIndication::DlBufferState(bs) => {
                    if let Some(ue) = ues.get_mut(bs.ue_index) {
                        ue.dl_lc.handle_dl_buffer_state(bs.lcid, bs.bytes);
                    }
                }
                UeIndication::MacCe(ce) => {
                    if let Some(ue) = ues.get_mut(ce.ue_index) {
                        ue.dl_lc.handle_mac_ce(ce.bytes);
                    }
                }
            }
        }

        for msg in std::mem::take(&mut self.pending_uci) {
            // Split per PDU so counters attribute to the right UE.
            for pdu in msg.pdus {
                let ue_index = rnti_index.lookup(pdu.rnti);
                let single = MacUciIndication {
                    cell_index: msg.cell_index,
                    slot_rx: msg.slot_rx,
                    pdus: vec![pdu],
                };
                let counters = self.uci.decode_uci(&single, ues, rnti_index);
                if counters.csi_reports > 0 {
                    if let Some(idx) = ue_index {
                        if let Some(ue) = ues.get(idx) {
                            let state = ue.pcell().channel_state;
                            self.metrics.handle_csi_report(idx, state.cqi, state.ri);
                        }
                    }
                }
                self.metrics.handle_feedback(ue_index, &counters);
            }
        }

        for msg in std::mem::take(&mut self.pending_crc) {
            for crc in msg.crcs {
                let ue_index = rnti_index.lookup(crc.rnti);
                let single = UlCrcIndication {
                    cell_index: msg.cell_index,
                    slot_rx: msg.slot_rx,
                    crcs: vec![crc],
                };
                let counters = self.uci.handle_crc(&single, ues, rnti_index);
                self.metrics.handle_feedback(ue_index, &counters);
            }
        }
    }
}
