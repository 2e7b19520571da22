//! YAML Configuration Structures
//!
//! DU application configuration: cell parameters, the execution fabric
//! sizing and the scheduler expert options.

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DuConfig {
    /// Cell configuration
    pub cell_cfg: CellCfg,
    /// Execution fabric configuration
    #[serde(default)]
    pub fabric: FabricCfg,
    /// Scheduler expert options
    #[serde(default)]
    pub sched: SchedCfg,
    /// F1 setup configuration
    #[serde(default)]
    pub f1: F1Cfg,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellCfg {
    /// Physical Cell ID
    pub pci: u16,
    /// Common subcarrier spacing in kHz
    pub common_scs: u32,
    /// Channel bandwidth in MHz
    #[serde(rename = "channel_bandwidth_MHz")]
    pub channel_bandwidth_mhz: u32,
    /// Band number
    pub band: u16,
    /// TDD pattern; absent for FDD
    #[serde(default)]
    pub tdd: Option<TddCfg>,
    /// PDSCH-to-HARQ-ACK delay in slots
    #[serde(default = "default_k1")]
    pub k1: u32,
    /// UL-grant-to-PUSCH delay in slots
    #[serde(default = "default_k2")]
    pub k2: u32,
    /// Maximum HARQ retransmissions
    #[serde(default = "default_max_harq_retx")]
    pub max_harq_retx: u8,
    /// PDSCH MCS table
    #[serde(default = "default_mcs_table")]
    pub pdsch_mcs_table: String,
    /// PUSCH MCS table
    #[serde(default = "default_mcs_table")]
    pub pusch_mcs_table: String,
    /// Maximum PUSCH layers
    #[serde(default = "default_pusch_max_nof_layers")]
    pub pusch_max_nof_layers: u8,
    /// Metrics report period in ms; zero disables reporting
    #[serde(default)]
    pub metrics_report_period: u32,
}

fn default_k1() -> u32 {
    4
}

fn default_k2() -> u32 {
    4
}

fn default_max_harq_retx() -> u8 {
    4
}

fn default_mcs_table() -> String {
    "qam64".to_string()
}

fn default_pusch_max_nof_layers() -> u8 {
    1
}

/// TDD UL/DL pattern
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TddCfg {
    /// Pattern period in slots
    pub period_slots: u32,
    /// Leading DL slots
    pub nof_dl_slots: u32,
    /// Trailing UL slots
    pub nof_ul_slots: u32,
}

/// Execution fabric configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FabricCfg {
    /// Number of worker threads
    #[serde(default = "default_nof_workers")]
    pub nof_workers: usize,
    /// Size of the round-robin UE strand pool
    #[serde(default = "default_max_nof_ue_strands")]
    pub max_nof_ue_strands: usize,
    /// Capacity of the main strand task queue
    #[serde(default = "default_task_queue_size")]
    pub default_task_queue_size: usize,
    /// Capacity of the data-plane strand queues
    #[serde(default = "default_gtpu_task_queue_size")]
    pub gtpu_task_queue_size: usize,
    /// If false, UL I/O runs inline on the caller
    #[serde(default)]
    pub dedicated_io_strand: bool,
    /// CPU ids workers may run on for DL-side work; empty means unpinned
    #[serde(default)]
    pub dl_affinity: Vec<usize>,
    /// CPU ids workers may run on for UL-side work; empty means unpinned
    #[serde(default)]
    pub ul_affinity: Vec<usize>,
}

impl Default for FabricCfg {
    fn default() -> Self {
        Self {
            nof_workers: default_nof_workers(),
            max_nof_ue_strands: default_max_nof_ue_strands(),
            default_task_queue_size: default_task_queue_size(),
            gtpu_task_queue_size: default_gtpu_task_queue_size(),
            dedicated_io_strand: false,
            dl_affinity: Vec::new(),
            ul_affinity: Vec::new(),
        }
    }
}

fn default_nof_workers() -> usize {
    4
}

fn default_max_nof_ue_strands() -> usize {
    16
}

fn default_task_queue_size() -> usize {
    2048
}

fn default_gtpu_task_queue_size() -> usize {
    8192
}

/// Scheduler expert options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedCfg {
    /// Proportional-fair time constant in slots
    #[serde(default = "default_pf_time_constant")]
    pub pf_time_constant: u32,
    /// Slots before a waiting-ack HARQ process is dropped
    #[serde(default = "default_harq_retx_timeout")]
    pub harq_retx_timeout: u32,
    /// PUSCH decoder iteration cap
    #[serde(default = "default_pusch_dec_max_iterations")]
    pub pusch_dec_max_iterations: u32,
    /// PUSCH decoder early stop
    #[serde(default = "default_true")]
    pub pusch_dec_enable_early_stop: bool,
    /// L1 pipeline depth in slots
    #[serde(default = "default_max_processing_delay_slots")]
    pub max_processing_delay_slots: u32,
}

impl Default for SchedCfg {
    fn default() -> Self {
        Self {
            pf_time_constant: default_pf_time_constant(),
            harq_retx_timeout: default_harq_retx_timeout(),
            pusch_dec_max_iterations: default_pusch_dec_max_iterations(),
            pusch_dec_enable_early_stop: true,
            max_processing_delay_slots: default_max_processing_delay_slots(),
        }
    }
}

fn default_pf_time_constant() -> u32 {
    100
}

fn default_harq_retx_timeout() -> u32 {
    256
}

fn default_pusch_dec_max_iterations() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_max_processing_delay_slots() -> u32 {
    4
}

/// F1 setup configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct F1Cfg {
    /// gNB-DU id
    #[serde(default)]
    pub gnb_du_id: u64,
    /// gNB-DU name sent in the setup request
    #[serde(default = "default_du_name")]
    pub gnb_du_name: String,
    /// Maximum setup attempts
    #[serde(default = "default_max_setup_retries")]
    pub max_setup_retries: u32,
    /// Seconds to wait for a setup response
    #[serde(default = "default_response_timeout_s")]
    pub response_timeout_s: u64,
}

impl Default for F1Cfg {
    fn default() -> Self {
        Self {
            gnb_du_id: 0,
            gnb_du_name: default_du_name(),
            max_setup_retries: default_max_setup_retries(),
            response_timeout_s: default_response_timeout_s(),
        }
    }
}

fn default_du_name() -> String {
    "boreal-du".to_string()
}

fn default_max_setup_retries() -> u32 {
    3
}

fn default_response_timeout_s() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogConfig {
    /// Log filename
    pub filename: Option<String>,
    /// All layers log level
    #[serde(default = "default_log_level")]
    pub all_level: String,
    /// Scheduler log level
    #[serde(default = "default_log_level")]
    pub sched_level: String,
    /// Fabric log level
    #[serde(default = "default_log_level")]
    pub fabric_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DuConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: DuConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; errors here abort the process.
    pub fn validate(&self) -> anyhow::Result<()> {
        if common::types::Pci::new(self.cell_cfg.pci).is_none() {
            anyhow::bail!("Invalid PCI: {}", self.cell_cfg.pci);
        }
        if !matches!(self.cell_cfg.common_scs, 15 | 30 | 60 | 120) {
            anyhow::bail!("Invalid subcarrier spacing: {} kHz", self.cell_cfg.common_scs);
        }
        match &self.cell_cfg.tdd {
            Some(tdd) if tdd.nof_dl_slots + tdd.nof_ul_slots > tdd.period_slots => {
                anyhow::bail!("TDD pattern does not fit its period");
            }
            _ => {}
        }
        match self.cell_cfg.pdsch_mcs_table.as_str() {
            "qam64" | "qam256" => {}
            other => anyhow::bail!("Invalid PDSCH MCS table: {}", other),
        }
        match self.cell_cfg.pusch_mcs_table.as_str() {
            "qam64" | "qam256" => {}
            other => anyhow::bail!("Invalid PUSCH MCS table: {}", other),
        }
        if self.fabric.nof_workers == 0 || self.fabric.max_nof_ue_strands == 0 {
            anyhow::bail!("Fabric sizing must be non-zero");
        }
        Ok(())
    }
}
