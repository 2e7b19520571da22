//! Scheduler Metrics
//!
//! Per-cell metrics handler: per-UE counters reset on every report, cell
//! counters, incremental sample statistics for CQI/RI/TA, and periodic
//! report emission through the outbound notifier. A report period of zero
//! disables emission entirely.

use crate::config::CellConfig;
use crate::result::SchedResult;
use crate::uci::FeedbackCounters;
use common::types::{DuCellIndex, DuUeIndex, Pci, Rnti};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Incremental mean/variance accumulator (Welford)
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleStatistics {
    n: u64,
    mean: f64,
    m2: f64,
}

impl SampleStatistics {
    /// Add one sample
    pub fn push(&mut self, sample: f64) {
        self.n += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (sample - self.mean);
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.n
    }

    /// Sample mean, `None` without samples
    pub fn mean(&self) -> Option<f64> {
        (self.n > 0).then_some(self.mean)
    }

    /// Sample variance, `None` below two samples
    pub fn variance(&self) -> Option<f64> {
        (self.n > 1).then(|| self.m2 / (self.n - 1) as f64)
    }

    /// Drop all samples
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-UE entry of a metrics report
#[derive(Debug, Clone)]
pub struct SchedulerUeMetrics {
    /// UE index
    pub ue_index: DuUeIndex,
    /// C-RNTI
    pub rnti: Rnti,
    /// DL throughput over the report period in Mbps
    pub dl_mbps: f64,
    /// UL throughput over the report period in Mbps
    pub ul_mbps: f64,
    /// DL transport block bytes
    pub sum_dl_tb_bytes: u64,
    /// UL transport block bytes
    pub sum_ul_tb_bytes: u64,
    /// HARQ ACKs received
    pub nof_harq_acks: u32,
    /// HARQ NACKs received
    pub nof_harq_nacks: u32,
    /// CRC passes
    pub nof_crc_acks: u32,
    /// CRC PDUs received
    pub nof_crc_pdus: u32,
    /// Mean CQI over the period
    pub avg_cqi: Option<f64>,
    /// Mean RI over the period
    pub avg_ri: Option<f64>,
    /// Last reported BSR total in bytes
    pub last_bsr_bytes: u64,
    /// Last reported power headroom in dB
    pub last_phr_db: Option<i8>,
}

/// One periodic report for a cell
#[derive(Debug, Clone)]
pub struct SchedulerCellMetrics {
    /// Cell index
    pub cell_index: DuCellIndex,
    /// Physical cell id
    pub pci: Pci,
    /// Slots covered by this report
    pub nof_slots: u32,
    /// Error indications received
    pub nof_error_indications: u32,
    /// PDCCH allocation failures
    pub nof_pdcch_failures: u32,
    /// No-empty-HARQ skips
    pub nof_harq_exhausted: u32,
    /// HARQ processes dropped on timeout
    pub nof_harq_timeouts: u32,
    /// Transport blocks dropped after max retransmissions
    pub nof_harq_drops: u32,
    /// UCI PDUs without context
    pub nof_unexpected_uci: u32,
    /// Invalid HARQ bits on PUCCH F2/F3/F4
    pub nof_pucch_f2f3f4_invalid_harqs: u32,
    /// PRACH preambles observed
    pub nof_prach_preambles: u32,
    /// Slots that blew the decision deadline
    pub nof_slot_deadline_missed: u32,
    /// Mean scheduling latency per slot
    pub avg_decision_latency: Duration,
    /// Worst scheduling latency in the period
    pub max_decision_latency: Duration,
    /// Per-UE entries
    pub ue_metrics: Vec<SchedulerUeMetrics>,
}

/// Outbound notifier for periodic metrics
pub trait SchedulerMetricsNotifier: Send + Sync {
    /// Deliver one report
    fn on_metrics_report(&self, report: &SchedulerCellMetrics);
}

/// Per-UE state: identity survives reports, `data` resets every period.
struct UeMetricContext {
    rnti: Rnti,
    data: UeNonPersistentData,
}

#[derive(Default)]
struct UeNonPersistentData {
    sum_dl_tb_bytes: u64,
    sum_ul_tb_bytes: u64,
    nof_harq_acks: u32,
    nof_harq_nacks: u32,
    nof_crc_acks: u32,
    nof_crc_pdus: u32,
    cqi: SampleStatistics,
    ri: SampleStatistics,
    last_bsr_bytes: u64,
    last_phr_db: Option<i8>,
}

#[derive(Default)]
struct CellCounters {
    nof_error_indications: u32,
    nof_pdcch_failures: u32,
    nof_harq_exhausted: u32,
    nof_harq_timeouts: u32,
    nof_harq_drops: u32,
    nof_unexpected_uci: u32,
    nof_pucch_f2f3f4_invalid_harqs: u32,
    nof_prach_preambles: u32,
    nof_slot_deadline_missed: u32,
    latency_sum: Duration,
    latency_max: Duration,
}

/// Metrics handler for one cell
pub struct CellMetricsHandler {
    cell_index: DuCellIndex,
    pci: Pci,
    report_period_slots: u32,
    slot_counter: u32,
    slot_duration: Duration,
    ues: HashMap<DuUeIndex, UeMetricContext>,
    counters: CellCounters,
}

impl CellMetricsHandler {
    /// Build the handler; a zero `metrics_report_period_ms` disables it
    pub fn new(cfg: &CellConfig) -> Self {
        let report_period_slots = cfg.metrics_report_period_ms * cfg.scs.slots_per_subframe();
        Self {
            cell_index: cfg.cell_index,
            pci: cfg.pci,
            report_period_slots,
            slot_counter: 0,
            slot_duration: cfg.scs.slot_duration(),
            ues: HashMap::new(),
            counters: CellCounters::default(),
        }
    }

    /// Whether reporting is enabled
    pub fn connected(&self) -> bool {
        self.report_period_slots != 0
    }

    /// Register a UE
    pub fn handle_ue_creation(&mut self, ue_index: DuUeIndex, rnti: Rnti) {
        self.ues.insert(
            ue_index,
            UeMetricContext {
                rnti,
                data: UeNonPersistentData::default(),
            },
        );
    }

    /// Register a UE reconfiguration
    pub fn handle_ue_reconfiguration(&mut self, ue_index: DuUeIndex) {
        debug!("metrics: UE {:?} reconfigured", ue_index);
    }

    /// Deregister a UE
    pub fn handle_ue_deletion(&mut self, ue_index: DuUeIndex) {
        self.ues.remove(&ue_index);
    }

    /// Count detected PRACH preambles
    pub fn handle_rach_indication(&mut self, nof_preambles: u32) {
        self.counters.nof_prach_preambles += nof_preambles;
    }

    /// Record a CSI report
    pub fn handle_csi_report(&mut self, ue_index: DuUeIndex, cqi: u8, ri: u8) {
        if let Some(ue) = self.ues.get_mut(&ue_index) {
            ue.data.cqi.push(cqi as f64);
            ue.data.ri.push(ri as f64);
        }
    }

    /// Record the last BSR total
    pub fn handle_bsr(&mut self, ue_index: DuUeIndex, total_bytes: u64) {
        if let Some(ue) = self.ues.get_mut(&ue_index) {
            ue.data.last_bsr_bytes = total_bytes;
        }
    }

    /// Record the last PHR
    pub fn handle_phr(&mut self, ue_index: DuUeIndex, phr_db: i8) {
        if let Some(ue) = self.ues.get_mut(&ue_index) {
            ue.data.last_phr_db = Some(phr_db);
        }
    }

    /// Fold in feedback counters, attributing per-UE parts where known
    pub fn handle_feedback(&mut self, ue_index: Option<DuUeIndex>, counters: &FeedbackCounters) {
        self.counters.nof_unexpected_uci += counters.unexpected_uci;
        self.counters.nof_pucch_f2f3f4_invalid_harqs += counters.nof_pucch_f2f3f4_invalid_harqs;
        self.counters.nof_harq_drops += counters.harq_drops;
        if let Some(ue) = ue_index.and_then(|idx| self.ues.get_mut(&idx)) {
            ue.data.nof_harq_acks += counters.harq_acks;
            ue.data.nof_harq_nacks += counters.harq_nacks;
            ue.data.nof_crc_acks += counters.crc_acks;
            ue.data.nof_crc_pdus += counters.crc_pdus;
        }
    }

    /// Count HARQ timeouts
    pub fn handle_harq_timeouts(&mut self, nof_timeouts: u32) {
        self.counters.nof_harq_timeouts += nof_timeouts;
    }

    /// Count an error indication
    pub fn handle_error_indication(&mut self) {
        self.counters.nof_error_indications += 1;
    }

    /// Count a missed slot deadline
    pub fn handle_slot_deadline_missed(&mut self) {
        self.counters.nof_slot_deadline_missed += 1;
    }

    /// Count allocation failures of one slot
    pub fn handle_alloc_failures(&mut self, pdcch_failures: u32, harq_exhausted: u32) {
        self.counters.nof_pdcch_failures += pdcch_failures;
        self.counters.nof_harq_exhausted += harq_exhausted;
    }

    /// Fold in one slot result; emits a report when the period elapses.
    pub fn push_result(
        &mut self,
        result: &SchedResult,
        notifier: &dyn SchedulerMetricsNotifier,
    ) {
        for grant in &result.dl.ue_grants {
            if let Some(ue) = self.ues.get_mut(&grant.ue_index) {
                ue.data.sum_dl_tb_bytes += grant.tbs_bytes as u64;
            }
        }
        for grant in &result.ul.pusch_grants {
            if let Some(ue) = self.ues.get_mut(&grant.ue_index) {
                ue.data.sum_ul_tb_bytes += grant.tbs_bytes as u64;
            }
        }
        self.counters.latency_sum += result.latency;
        self.counters.latency_max = self.counters.latency_max.max(result.latency);

        if !self.connected() {
            return;
        }
        self.slot_counter += 1;
        if self.slot_counter >= self.report_period_slots {
            let report = self.build_report();
            notifier.on_metrics_report(&report);
            self.reset_period();
        }
    }

    fn build_report(&self) -> SchedulerCellMetrics {
        let period = self.slot_duration * self.slot_counter;
        let period_secs = period.as_secs_f64().max(1e-9);
        let ue_metrics = self
            .ues
            .iter()
            .map(|(ue_index, ctx)| SchedulerUeMetrics {
                ue_index: *ue_index,
                rnti: ctx.rnti,
                dl_mbps: ctx.data.sum_dl_tb_bytes as f64 * 8.0 / period_secs / 1e6,
                ul_mbps: ctx.data.sum_ul_tb_bytes as f64 * 8.0 / period_secs / 1e6,
                sum_dl_tb_bytes: ctx.data.sum_dl_tb_bytes,
                sum_ul_tb_bytes: ctx.data.sum_ul_tb_bytes,
                nof_harq_acks: ctx.data.nof_harq_acks,
                nof_harq_nacks: ctx.data.nof_harq_nacks,
                nof_crc_acks: ctx.data.nof_crc_acks,
                nof_crc_pdus: ctx.data.nof_crc_pdus,
                avg_cqi: ctx.data.cqi.mean(),
                avg_ri: ctx.data.ri.mean(),
                last_bsr_bytes: ctx.data.last_bsr_bytes,
                last_phr_db: ctx.data.last_phr_db,
            })
            .collect();

        SchedulerCellMetrics {
            cell_index: self.cell_index,
            pci: self.pci,
            nof_slots: self.slot_counter,
            nof_error_indications: self.counters.nof_error_indications,
            nof_pdcch_failures: self.counters.nof_pdcch_failures,
            nof_harq_exhausted: self.counters.nof_harq_exhausted,
            nof_harq_timeouts: self.counters.nof_harq_timeouts,
            nof_harq_drops: self.counters.nof_harq_drops,
            nof_unexpected_uci: self.counters.nof_unexpected_uci,
            nof_pucch_f2f3f4_invalid_harqs: self.counters.nof_pucch_f2f3f4_invalid_harqs,
            nof_prach_preambles: self.counters.nof_prach_preambles,
            nof_slot_deadline_missed: self.counters.nof_slot_deadline_missed,
            avg_decision_latency: if self.slot_counter > 0 {
                self.counters.latency_sum / self.slot_counter
            } else {
                Duration::ZERO
            },
            max_decision_latency: self.counters.latency_max,
            ue_metrics,
        }
    }

    fn reset_period(&mut self) {
        self.slot_counter = 0;
        self.counters = CellCounters::default();
        for ctx in self.ues.values_mut() {
            ctx.data = UeNonPersistentData::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_util::test_cell_config;
    use crate::result::{DlSchedResult, UlSchedResult};
    use common::types::SubcarrierSpacing;
    use common::SlotPoint;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingNotifier {
        reports: AtomicU32,
        last: Mutex<Option<SchedulerCellMetrics>>,
    }

    impl SchedulerMetricsNotifier for CollectingNotifier {
        fn on_metrics_report(&self, report: &SchedulerCellMetrics) {
            self.reports.fetch_add(1, Ordering::Relaxed);
            *self.last.lock().unwrap() = Some(report.clone());
        }
    }

    fn empty_result(cfg: &crate::config::CellConfig) -> SchedResult {
        SchedResult {
            cell_index: cfg.cell_index,
            slot: SlotPoint::new(cfg.scs, 0, 0),
            dl: DlSchedResult::default(),
            ul: UlSchedResult::default(),
            latency: Duration::from_micros(10),
        }
    }

    #[test]
    fn test_sample_statistics() {
        let mut stats = SampleStatistics::default();
        assert_eq!(stats.mean(), None);
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.push(x);
        }
        assert_eq!(stats.count(), 8);
        assert!((stats.mean().unwrap() - 5.0).abs() < 1e-9);
        assert!((stats.variance().unwrap() - 32.0 / 7.0).abs() < 1e-9);
        stats.reset();
        assert_eq!(stats.count(), 0);
    }

    #[test]
    fn test_zero_period_disables_reporting() {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let mut handler = CellMetricsHandler::new(&cfg);
        assert!(!handler.connected());

        let notifier = CollectingNotifier::default();
        for _ in 0..10_000 {
            handler.push_result(&empty_result(&cfg), &notifier);
        }
        assert_eq!(notifier.reports.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_report_emitted_every_period() {
        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        cfg.metrics_report_period_ms = 10;
        // 10 ms at 30 kHz SCS = 20 slots.
        let mut handler = CellMetricsHandler::new(&cfg);
        assert!(handler.connected());
        handler.handle_ue_creation(DuUeIndex(0), Rnti(0x4601));

        let notifier = CollectingNotifier::default();
        for _ in 0..40 {
            handler.push_result(&empty_result(&cfg), &notifier);
        }
        assert_eq!(notifier.reports.load(Ordering::Relaxed), 2);
        let last = notifier.last.lock().unwrap();
        let report = last.as_ref().unwrap();
        assert_eq!(report.nof_slots, 20);
        assert_eq!(report.ue_metrics.len(), 1);
    }

    #[test]
    fn test_non_persistent_data_resets_per_report() {
        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        cfg.metrics_report_period_ms = 1;
        let mut handler = CellMetricsHandler::new(&cfg);
        handler.handle_ue_creation(DuUeIndex(0), Rnti(0x4601));
        handler.handle_csi_report(DuUeIndex(0), 12, 2);
        handler.handle_error_indication();

        let notifier = CollectingNotifier::default();
        // First period: carries the CSI sample and the error indication.
        for _ in 0..2 {
            handler.push_result(&empty_result(&cfg), &notifier);
        }
        {
            let last = notifier.last.lock().unwrap();
            let report = last.as_ref().unwrap();
            assert_eq!(report.nof_error_indications, 1);
            assert_eq!(report.ue_metrics[0].avg_cqi, Some(12.0));
        }

        // Second period: everything reset.
        for _ in 0..2 {
            handler.push_result(&empty_result(&cfg), &notifier);
        }
        let last = notifier.last.lock().unwrap();
        let report = last.as_ref().unwrap();
        assert_eq!(report.nof_error_indications, 0);
        assert_eq!(report.ue_metrics[0].avg_cqi, None);
    }
}
