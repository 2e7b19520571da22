//! UE Capability Manager
//!
//! Decodes the compact UE capability container delivered over F1 and
//! derives the per-UE configuration the scheduler actually uses: the PUSCH
//! MCS table, UL MIMO rank, SRS ports and codebook subset. The first valid
//! decode seeds the summary; later empty containers leave it untouched.
//!
//! Container format (the ASN.1 RRC decode happens in an external
//! collaborator; this is its compact output form): a sequence of
//! tag-length-free records,
//!   0x01 <flags u8>                         global capabilities
//!   0x02 <band u16> <flags u8> <coherence u8> <srs_ports u8> <max_rank u8>
//! Any other tag, or a truncated record, is a malformed container.

use crate::config::CellConfig;
use crate::mcs::McsTable;
use crate::SchedError;
use bytes::{Buf, Bytes};
use common::types::NrBand;
use std::collections::HashMap;
use std::fmt::Write as _;
use tracing::{debug, warn};

const TAG_GLOBAL: u8 = 0x01;
const TAG_BAND: u8 = 0x02;

const GLOBAL_FLAG_PDSCH_QAM256: u8 = 0x01;
const GLOBAL_FLAG_LONG_DRX: u8 = 0x02;
const GLOBAL_FLAG_SHORT_DRX: u8 = 0x04;

const BAND_FLAG_PUSCH_QAM256: u8 = 0x01;

/// PUSCH transmit coherence capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxCoherence {
    /// Non-coherent codebook subset
    NonCoherent,
    /// Partial-and-non-coherent codebook subset
    Partial,
    /// Fully coherent codebook subset
    Full,
}

impl TxCoherence {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TxCoherence::NonCoherent),
            1 => Some(TxCoherence::Partial),
            2 => Some(TxCoherence::Full),
            _ => None,
        }
    }
}

/// Per-band UE capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandCapability {
    /// 256QAM supported on PUSCH in this band
    pub pusch_qam256_supported: bool,
    /// Transmit coherence
    pub pusch_tx_coherence: TxCoherence,
    /// Number of SRS transmit ports
    pub nof_srs_tx_ports: u8,
    /// Maximum PUSCH rank
    pub pusch_max_rank: u8,
}

/// Defaults applied when the UE reported nothing for a band
impl Default for BandCapability {
    fn default() -> Self {
        Self {
            pusch_qam256_supported: false,
            pusch_tx_coherence: TxCoherence::NonCoherent,
            nof_srs_tx_ports: 1,
            pusch_max_rank: 1,
        }
    }
}

/// Summary of the decoded UE capabilities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UeCapabilitySummary {
    /// 256QAM supported on PDSCH
    pub pdsch_qam256_supported: bool,
    /// Long DRX cycle supported
    pub long_drx_supported: bool,
    /// Short DRX cycle supported
    pub short_drx_supported: bool,
    /// Per-band capabilities
    pub bands: HashMap<NrBand, BandCapability>,
}

/// Decode a capability container.
///
/// An empty container decodes to `None` (no update); a malformed one is an
/// `InvalidArgument` and leaves all state untouched.
pub fn decode_capability_container(container: &Bytes) -> Result<Option<UeCapabilitySummary>, SchedError> {
    if container.is_empty() {
        return Ok(None);
    }
    let mut buf = container.clone();
    let mut summary = UeCapabilitySummary::default();
    while buf.has_remaining() {
        match buf.get_u8() {
            TAG_GLOBAL => {
                if buf.remaining() < 1 {
                    return Err(malformed(container, "truncated global record"));
                }
                let flags = buf.get_u8();
                summary.pdsch_qam256_supported = flags & GLOBAL_FLAG_PDSCH_QAM256 != 0;
                summary.long_drx_supported = flags & GLOBAL_FLAG_LONG_DRX != 0;
                summary.short_drx_supported = flags & GLOBAL_FLAG_SHORT_DRX != 0;
            }
            TAG_BAND => {
                if buf.remaining() < 6 {
                    return Err(malformed(container, "truncated band record"));
                }
                let band = NrBand(buf.get_u16());
                let flags = buf.get_u8();
                let coherence = TxCoherence::from_u8(buf.get_u8())
                    .ok_or_else(|| malformed(container, "invalid coherence value"))?;
                let nof_srs_tx_ports = buf.get_u8();
                let pusch_max_rank = buf.get_u8();
                if nof_srs_tx_ports == 0 || pusch_max_rank == 0 {
                    return Err(malformed(container, "zero ports or rank"));
                }
                summary.bands.insert(
                    band,
                    BandCapability {
                        pusch_qam256_supported: flags & BAND_FLAG_PUSCH_QAM256 != 0,
                        pusch_tx_coherence: coherence,
                        nof_srs_tx_ports,
                        pusch_max_rank,
                    },
                );
            }
            tag => {
                return Err(malformed(container, &format!("unknown tag {:#04x}", tag)));
            }
        }
    }
    Ok(Some(summary))
}

fn malformed(container: &Bytes, what: &str) -> SchedError {
    warn!("malformed UE capability container ({}): {}", what, hex_dump(container));
    SchedError::InvalidArgument(format!("malformed UE capability container: {}", what))
}

/// Contiguous hex rendering of a rejected container for the log
fn hex_dump(container: &Bytes) -> String {
    container.iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}

/// Per-UE configuration derived from cell config and capabilities
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UeAppliedConfig {
    /// Effective PDSCH MCS table
    pub pdsch_mcs_table: McsTable,
    /// Effective PUSCH MCS table
    pub pusch_mcs_table: McsTable,
    /// Effective maximum PUSCH rank
    pub pusch_max_rank: u8,
    /// SRS ports forced on all SRS resources
    pub srs_nof_ports: u8,
    /// Codebook subset signalled to the UE
    pub codebook_subset: TxCoherence,
}

impl UeAppliedConfig {
    /// Capability-independent starting point for a cell
    pub fn from_cell(cfg: &CellConfig) -> Self {
        let defaults = BandCapability::default();
        Self {
            pdsch_mcs_table: cfg.pdsch_mcs_table,
            // Until capabilities arrive the conservative table applies.
            pusch_mcs_table: McsTable::Qam64,
            pusch_max_rank: cfg.pusch_max_nof_layers.min(defaults.pusch_max_rank),
            srs_nof_ports: defaults.nof_srs_tx_ports,
            codebook_subset: defaults.pusch_tx_coherence,
        }
    }
}

/// Manager holding the decoded summary and applying it to the PCell config
#[derive(Default)]
pub struct UeCapabilityManager {
    ue_caps: Option<UeCapabilitySummary>,
    first_update_done: bool,
}

impl UeCapabilityManager {
    /// Decoded summary, if any arrived yet
    pub fn summary(&self) -> Option<&UeCapabilitySummary> {
        self.ue_caps.as_ref()
    }

    /// Decode a container and refresh the applied PCell configuration.
    ///
    /// An empty container after the first successful update is a no-op.
    pub fn update(
        &mut self,
        applied: &mut UeAppliedConfig,
        cell_cfg: &CellConfig,
        container: &Bytes,
    ) -> Result<(), SchedError> {
        match decode_capability_container(container)? {
            Some(summary) => {
                debug!(
                    "UE capability update: pdsch_qam256={}, {} band(s)",
                    summary.pdsch_qam256_supported,
                    summary.bands.len()
                );
                self.ue_caps = Some(summary);
            }
            None => {
                if self.first_update_done {
                    return Ok(());
                }
            }
        }
        self.first_update_done = true;

        applied.pdsch_mcs_table = self.select_pdsch_mcs_table(cell_cfg);
        applied.pusch_mcs_table = self.select_pusch_mcs_table(cell_cfg);
        applied.pusch_max_rank = self.select_pusch_max_rank(cell_cfg);
        applied.srs_nof_ports = self.select_srs_nof_ports(cell_cfg);
        applied.codebook_subset = self.select_tx_codebook_subset(cell_cfg);
        Ok(())
    }

    fn band_caps(&self, cell_cfg: &CellConfig) -> Option<&BandCapability> {
        self.ue_caps.as_ref().and_then(|caps| caps.bands.get(&cell_cfg.band))
    }

    fn select_pdsch_mcs_table(&self, cell_cfg: &CellConfig) -> McsTable {
        // The DL table follows the base cell configuration; a dynamic
        // downgrade would require scheduler-wide CQI table changes.
        cell_cfg.pdsch_mcs_table
    }

    fn select_pusch_mcs_table(&self, cell_cfg: &CellConfig) -> McsTable {
        let caps = match &self.ue_caps {
            Some(caps) => caps,
            None => return McsTable::Qam64,
        };
        if cell_cfg.pusch_mcs_table == McsTable::Qam256 {
            if let Some(band) = caps.bands.get(&cell_cfg.band) {
                return if band.pusch_qam256_supported {
                    McsTable::Qam256
                } else {
                    McsTable::Qam64
                };
            }
            // The serving band was not reported; fall back unless some
            // other band supports 256QAM.
            if caps.bands.values().all(|b| !b.pusch_qam256_supported) {
                return McsTable::Qam64;
            }
        }
        cell_cfg.pusch_mcs_table
    }

    fn select_pusch_max_rank(&self, cell_cfg: &CellConfig) -> u8 {
        let default = BandCapability::default();
        let band_rank = self
            .band_caps(cell_cfg)
            .map(|b| b.pusch_max_rank)
            .unwrap_or(default.pusch_max_rank);
        cell_cfg.pusch_max_nof_layers.min(band_rank)
    }

    fn select_srs_nof_ports(&self, cell_cfg: &CellConfig) -> u8 {
        self.band_caps(cell_cfg)
            .map(|b| b.nof_srs_tx_ports)
            .unwrap_or_else(|| BandCapability::default().nof_srs_tx_ports)
    }

    fn select_tx_codebook_subset(&self, cell_cfg: &CellConfig) -> TxCoherence {
        self.band_caps(cell_cfg)
            .map(|b| b.pusch_tx_coherence)
            .unwrap_or_else(|| BandCapability::default().pusch_tx_coherence)
    }
}

/// Build a capability container, used by tests and the DU test harness
pub fn encode_capability_container(summary: &UeCapabilitySummary) -> Bytes {
    use bytes::{BufMut, BytesMut};
    let mut buf = BytesMut::new();
    let mut flags = 0u8;
    if summary.pdsch_qam256_supported {
        flags |= GLOBAL_FLAG_PDSCH_QAM256;
    }
    if summary.long_drx_supported {
        flags |= GLOBAL_FLAG_LONG_DRX;
    }
    if summary.short_drx_supported {
        flags |= GLOBAL_FLAG_SHORT_DRX;
    }
    buf.put_u8(TAG_GLOBAL);
    buf.put_u8(flags);
    let mut bands: Vec<_> = summary.bands.iter().collect();
    bands.sort_by_key(|(band, _)| band.0);
    for (band, caps) in bands {
        buf.put_u8(TAG_BAND);
        buf.put_u16(band.0);
        buf.put_u8(if caps.pusch_qam256_supported { BAND_FLAG_PUSCH_QAM256 } else { 0 });
        buf.put_u8(match caps.pusch_tx_coherence {
            TxCoherence::NonCoherent => 0,
            TxCoherence::Partial => 1,
            TxCoherence::Full => 2,
        });
        buf.put_u8(caps.nof_srs_tx_ports);
        buf.put_u8(caps.pusch_max_rank);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_util::test_cell_config;
    use common::types::SubcarrierSpacing;

    fn n78_summary(qam256: bool, rank: u8) -> UeCapabilitySummary {
        let mut bands = HashMap::new();
        bands.insert(
            NrBand::N78,
            BandCapability {
                pusch_qam256_supported: qam256,
                pusch_tx_coherence: TxCoherence::Full,
                nof_srs_tx_ports: 2,
                pusch_max_rank: rank,
            },
        );
        UeCapabilitySummary {
            pdsch_qam256_supported: true,
            long_drx_supported: true,
            short_drx_supported: false,
            bands,
        }
    }

    #[test]
    fn test_container_round_trip() {
        let summary = n78_summary(true, 2);
        let container = encode_capability_container(&summary);
        let decoded = decode_capability_container(&container).unwrap().unwrap();
        assert_eq!(decoded, summary);
    }

    #[test]
    fn test_empty_container_is_no_update() {
        assert_eq!(decode_capability_container(&Bytes::new()).unwrap(), None);
    }

    #[test]
    fn test_malformed_container_rejected() {
        let truncated = Bytes::from_static(&[TAG_BAND, 0x00]);
        assert!(decode_capability_container(&truncated).is_err());
        let unknown = Bytes::from_static(&[0x7F]);
        assert!(decode_capability_container(&unknown).is_err());
    }

    #[test]
    fn test_pusch_table_falls_back_without_band_support() {
        // Cell configured for 256QAM on n78; UE reports n78 without
        // pusch_256_qam. The effective table must be qam64.
        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        cfg.pusch_mcs_table = McsTable::Qam256;

        let mut applied = UeAppliedConfig::from_cell(&cfg);
        let mut mgr = UeCapabilityManager::default();
        let container = encode_capability_container(&n78_summary(false, 1));
        mgr.update(&mut applied, &cfg, &container).unwrap();
        assert_eq!(applied.pusch_mcs_table, McsTable::Qam64);

        // A later update announcing support upgrades the table.
        let container = encode_capability_container(&n78_summary(true, 1));
        mgr.update(&mut applied, &cfg, &container).unwrap();
        assert_eq!(applied.pusch_mcs_table, McsTable::Qam256);
    }

    #[test]
    fn test_ul_mimo_derivation() {
        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        cfg.pusch_max_nof_layers = 2;

        let mut applied = UeAppliedConfig::from_cell(&cfg);
        assert_eq!(applied.pusch_max_rank, 1);
        assert_eq!(applied.srs_nof_ports, 1);
        assert_eq!(applied.codebook_subset, TxCoherence::NonCoherent);

        let mut mgr = UeCapabilityManager::default();
        let container = encode_capability_container(&n78_summary(false, 4));
        mgr.update(&mut applied, &cfg, &container).unwrap();
        // Rank is min(cell=2, band=4); ports and coherence from the band.
        assert_eq!(applied.pusch_max_rank, 2);
        assert_eq!(applied.srs_nof_ports, 2);
        assert_eq!(applied.codebook_subset, TxCoherence::Full);
    }

    #[test]
    fn test_empty_after_first_update_keeps_state() {
        let mut cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        cfg.pusch_mcs_table = McsTable::Qam256;

        let mut applied = UeAppliedConfig::from_cell(&cfg);
        let mut mgr = UeCapabilityManager::default();
        mgr.update(&mut applied, &cfg, &encode_capability_container(&n78_summary(true, 1)))
            .unwrap();
        assert_eq!(applied.pusch_mcs_table, McsTable::Qam256);

        mgr.update(&mut applied, &cfg, &Bytes::new()).unwrap();
        assert_eq!(applied.pusch_mcs_table, McsTable::Qam256);
        assert!(mgr.summary().is_some());
    }
}
