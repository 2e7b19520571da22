//! Boreal 5G DU Main Application
//!
//! This is the main entry point for the DU: it loads the YAML
//! configuration, brings up the execution fabric and the MAC scheduler and
//! drives the per-slot loop on the cell strand.

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::types::{Bandwidth, DuCellIndex, NrBand, Pci, SubcarrierSpacing};
use common::SlotPoint;
use fabric::rusage::{ResourceUsageMeasurement, RusageScope, ScopedResourceUsage};
use fabric::{
    IoUlExecutor, QueuePolicy, SharedExecutor, Strand, TaskExecutor, UeExecutorPool, WorkerPool,
    WorkerPoolConfig,
};
use sched::config::{
    CellConfig, CoresetConfig, SchedulerExpertConfig, SearchSpaceConfig, TddPattern,
};
use sched::mcs::McsTable;
use sched::metrics::{SchedulerCellMetrics, SchedulerMetricsNotifier};
use sched::result::SchedResult;
use sched::{SchedResultNotifier, Scheduler};

mod config;
mod setup;

use config::DuConfig;
use setup::{SetupProcedure, SetupRequestNotifier, SetupResult, TransactionManager};

/// Boreal 5G DU
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

/// PHY-side consumer of slot results; the FAPI adaptor in a full split.
struct PhyResultAdaptor;

impl SchedResultNotifier for PhyResultAdaptor {
    fn on_sched_result(&self, result: &SchedResult) {
        debug!(
            "slot {}: {} DL grants, {} UL grants, {} PUCCHs, latency {:?}",
            result.slot,
            result.dl.ue_grants.len(),
            result.ul.pusch_grants.len(),
            result.ul.pucchs.len(),
            result.latency
        );
    }
}

/// Logs metric reports; a metrics exporter replaces this in deployments.
struct MetricsLogger;

impl SchedulerMetricsNotifier for MetricsLogger {
    fn on_metrics_report(&self, report: &SchedulerCellMetrics) {
        info!(
            "cell {:?} metrics: {} slots, {} UEs, deadline misses {}, avg latency {:?}",
            report.cell_index,
            report.nof_slots,
            report.ue_metrics.len(),
            report.nof_slot_deadline_missed,
            report.avg_decision_latency
        );
        for ue in &report.ue_metrics {
            info!(
                "  UE {:?}: DL {:.3} Mbps, UL {:.3} Mbps, CQI {:?}",
                ue.ue_index, ue.dl_mbps, ue.ul_mbps, ue.avg_cqi
            );
        }
    }
}

/// Sends the F1 Setup Request through the F1AP gateway.
///
/// The wire encoding and the SCTP transport live in the F1AP collaborator;
/// without a CU connection the request goes nowhere and the procedure
/// times out, which the DU tolerates by starting standalone.
struct F1RequestNotifier {
    gnb_du_id: u64,
    gnb_du_name: String,
}

impl SetupRequestNotifier for F1RequestNotifier {
    fn on_setup_request(&self, transaction_id: u32) {
        info!(
            "F1 Setup: sending F1 Setup Request (transaction {}, gnb-du-id {:#x}, name \"{}\")",
            transaction_id, self.gnb_du_id, self.gnb_du_name
        );
    }
}

fn build_cell_config(config: &DuConfig) -> Result<CellConfig> {
    let cell = &config.cell_cfg;
    let pci = Pci::new(cell.pci).ok_or_else(|| anyhow::anyhow!("Invalid PCI: {}", cell.pci))?;
    let scs = match cell.common_scs {
        15 => SubcarrierSpacing::Scs15,
        30 => SubcarrierSpacing::Scs30,
        60 => SubcarrierSpacing::Scs60,
        120 => SubcarrierSpacing::Scs120,
        other => anyhow::bail!("Invalid subcarrier spacing: {} kHz", other),
    };
    let bandwidth = Bandwidth::from_mhz(cell.channel_bandwidth_mhz)
        .ok_or_else(|| anyhow::anyhow!("Invalid bandwidth: {} MHz", cell.channel_bandwidth_mhz))?;
    let nof_prbs = bandwidth.max_nof_prbs(scs);

    let mcs_table = |name: &str| -> Result<McsTable> {
        match name {
            "qam64" => Ok(McsTable::Qam64),
            "qam256" => Ok(McsTable::Qam256),
            other => anyhow::bail!("Invalid MCS table: {}", other),
        }
    };

    Ok(CellConfig {
        cell_index: DuCellIndex(0),
        pci,
        scs,
        bandwidth,
        nof_prbs,
        band: NrBand(cell.band),
        duplex: if cell.tdd.is_some() {
            common::types::DuplexMode::Tdd
        } else {
            common::types::DuplexMode::Fdd
        },
        tdd: cell.tdd.map(|tdd| TddPattern {
            period_slots: tdd.period_slots,
            nof_dl_slots: tdd.nof_dl_slots,
            nof_ul_slots: tdd.nof_ul_slots,
        }),
        k1: cell.k1,
        k2: cell.k2,
        nof_harqs: 16,
        max_harq_retx: cell.max_harq_retx,
        harq_retx_timeout_slots: config.sched.harq_retx_timeout,
        coreset: CoresetConfig { nof_cces: 24 },
        search_space: SearchSpaceConfig::default(),
        pdsch_mcs_table: mcs_table(&cell.pdsch_mcs_table)?,
        pusch_mcs_table: mcs_table(&cell.pusch_mcs_table)?,
        pusch_max_nof_layers: cell.pusch_max_nof_layers,
        nof_reserved_dl_prbs: 4,
        metrics_report_period_ms: cell.metrics_report_period,
        expert: SchedulerExpertConfig {
            pf_time_constant: config.sched.pf_time_constant,
            max_processing_delay_slots: config.sched.max_processing_delay_slots,
            pusch_dec_max_iterations: config.sched.pusch_dec_max_iterations,
            pusch_dec_enable_early_stop: config.sched.pusch_dec_enable_early_stop,
            ..SchedulerExpertConfig::default()
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load YAML configuration
    let config = DuConfig::from_yaml_file(&args.config)?;

    // Initialize logging with level from config or override
    let log_level = args.log_level.as_ref().unwrap_or(&config.log.all_level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Boreal 5G DU");
    info!("Configuration loaded from: {}", args.config);

    let cell_cfg = build_cell_config(&config)?;
    info!("Cell configuration:");
    info!("  PCI: {}", cell_cfg.pci.0);
    info!("  Band: {}", cell_cfg.band.0);
    info!("  Bandwidth: {} MHz ({} PRBs)", config.cell_cfg.channel_bandwidth_mhz, cell_cfg.nof_prbs);
    info!("  Subcarrier spacing: {} kHz", config.cell_cfg.common_scs);
    info!("  Duplex: {:?}", cell_cfg.duplex);
    info!("  Metrics period: {} ms", cell_cfg.metrics_report_period_ms);

    // Bring up the worker pool and the strands on top of it.
    let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
        name: "du-worker".to_string(),
        nof_workers: config.fabric.nof_workers,
        queue_size: config.fabric.default_task_queue_size,
        policy: QueuePolicy::Block,
        cpu_affinity: config
            .fabric
            .dl_affinity
            .iter()
            .chain(config.fabric.ul_affinity.iter())
            .copied()
            .collect(),
    })?);
    let pool_exec: SharedExecutor = Arc::new(pool.executor());

    // The cell strand sequentializes all scheduler work.
    let cell_strand: Arc<Strand> = Arc::new(Strand::new(
        Arc::clone(&pool_exec),
        config.fabric.default_task_queue_size,
    ));
    // UE transport work is dispatched through mappers from this pool as
    // UEs attach; it lives for the process lifetime.
    let _ue_pool = Arc::new(UeExecutorPool::new(
        Arc::clone(&pool_exec),
        Arc::clone(&pool_exec),
        config.fabric.max_nof_ue_strands,
        config.fabric.default_task_queue_size,
        config.fabric.gtpu_task_queue_size,
    )?);
    let _io_ul_exec = IoUlExecutor::new(
        config.fabric.dedicated_io_strand,
        Arc::clone(&pool_exec),
        config.fabric.gtpu_task_queue_size,
    );
    info!(
        "Execution fabric up: {} workers, {} UE strands, dedicated IO strand: {}",
        config.fabric.nof_workers, config.fabric.max_nof_ue_strands, config.fabric.dedicated_io_strand
    );

    // Scheduler core.
    let mut scheduler = Scheduler::new(Arc::new(PhyResultAdaptor), Arc::new(MetricsLogger));
    let cell_index = scheduler.add_cell(cell_cfg.clone()).map_err(|e| anyhow::anyhow!("{}", e))?;
    let scheduler = Arc::new(Mutex::new(scheduler));

    // F1 Setup towards the CU.
    let transactions = Arc::new(TransactionManager::default());
    let (f1_setup, _f1_cancel) = SetupProcedure::new(
        "F1 Setup",
        config.f1.max_setup_retries,
        Duration::from_secs(config.f1.response_timeout_s),
        Arc::new(F1RequestNotifier {
            gnb_du_id: config.f1.gnb_du_id,
            gnb_du_name: config.f1.gnb_du_name.clone(),
        }),
        Arc::clone(&transactions),
    );
    match f1_setup.run().await {
        SetupResult::Success => info!("F1 Setup completed"),
        SetupResult::Timeout => {
            warn!("F1 Setup timed out; no CU reachable, continuing standalone")
        }
        SetupResult::Failed(cause) => {
            warn!("F1 Setup failed ({}); continuing standalone", cause)
        }
        SetupResult::Cancelled => anyhow::bail!("F1 Setup cancelled during startup"),
    }

    // Per-slot loop on the cell strand.
    let slot_duration = cell_cfg.scs.slot_duration();
    let mut interval = tokio::time::interval(slot_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    let mut slot = SlotPoint::new(cell_cfg.scs, 0, 0);

    info!("Entering slot loop ({} us per slot)", slot_duration.as_micros());
    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sched = Arc::clone(&scheduler);
                let run_slot = slot;
                let submitted = cell_strand.execute(Box::new(move || {
                    let mut usage = ResourceUsageMeasurement::default();
                    {
                        let _scope = ScopedResourceUsage::new(&mut usage, RusageScope::Thread);
                        let mut sched = sched.lock();
                        if let Err(e) = sched.run_slot(run_slot, cell_index) {
                            warn!("slot {} failed: {}", run_slot, e);
                        }
                    }
                    // One sample per frame is enough for the log.
                    if run_slot.slot_index() == 0 {
                        debug!(
                            "slot {} decision: user {:?}, system {:?}, max RSS {} kB",
                            run_slot, usage.user_time, usage.system_time, usage.max_rss_kb
                        );
                    }
                }));
                if submitted.is_err() {
                    warn!("cell strand rejected slot {}", slot);
                }
                slot += 1;
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // Drain: let queued slot work finish, then stop the pool.
    pool.stop();
    info!("Boreal 5G DU stopped");
    Ok(())
}
