//! MCS Tables and Link Adaptation
//!
//! MCS index tables for PDSCH/PUSCH, an approximate transport block size
//! computation and the outer-loop link adaptation state that nudges the
//! CQI-derived MCS by a bounded dB offset.

/// MCS index table selection, TS 38.214
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McsTable {
    /// Table 5.1.3.1-1, up to 64QAM
    Qam64,
    /// Table 5.1.3.1-2, up to 256QAM
    Qam256,
}

/// One row of an MCS table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McsEntry {
    /// Modulation order (bits per symbol)
    pub modulation_order: u8,
    /// Target code rate x 1024
    pub code_rate_x1024: u16,
}

const fn e(modulation_order: u8, code_rate_x1024: u16) -> McsEntry {
    McsEntry {
        modulation_order,
        code_rate_x1024,
    }
}

/// TS 38.214 Table 5.1.3.1-1 (qam64), indices 0..=28
const QAM64_TABLE: [McsEntry; 29] = [
    e(2, 120), e(2, 157), e(2, 193), e(2, 251), e(2, 308), e(2, 379), e(2, 449), e(2, 526),
    e(2, 602), e(2, 679), e(4, 340), e(4, 378), e(4, 434), e(4, 490), e(4, 553), e(4, 616),
    e(4, 658), e(6, 438), e(6, 466), e(6, 517), e(6, 567), e(6, 616), e(6, 666), e(6, 719),
    e(6, 772), e(6, 822), e(6, 873), e(6, 910), e(6, 948),
];

/// TS 38.214 Table 5.1.3.1-2 (qam256), indices 0..=27
const QAM256_TABLE: [McsEntry; 28] = [
    e(2, 120), e(2, 193), e(2, 308), e(2, 449), e(2, 602), e(4, 378), e(4, 434), e(4, 490),
    e(4, 553), e(4, 616), e(4, 658), e(6, 466), e(6, 517), e(6, 567), e(6, 616), e(6, 666),
    e(6, 719), e(6, 772), e(6, 822), e(6, 873), e(8, 682), e(8, 711), e(8, 754),
    e(8, 797), e(8, 841), e(8, 885), e(8, 916), e(8, 948),
];

impl McsTable {
    /// Largest valid MCS index of the table
    pub fn max_mcs(&self) -> u8 {
        match self {
            McsTable::Qam64 => 28,
            McsTable::Qam256 => 27,
        }
    }

    /// Look up a table row
    pub fn entry(&self, mcs: u8) -> McsEntry {
        match self {
            McsTable::Qam64 => QAM64_TABLE[mcs as usize],
            McsTable::Qam256 => QAM256_TABLE[mcs as usize],
        }
    }
}

/// Map a wideband CQI (1..=15) onto an MCS index of the table.
///
/// CQI 0 means out of range; the caller should not schedule new data.
pub fn cqi_to_mcs(cqi: u8, table: McsTable) -> Option<u8> {
    if cqi == 0 || cqi > 15 {
        return None;
    }
    let max = table.max_mcs() as u32;
    // Linear spread of the 15 CQI steps over the table.
    Some(((cqi as u32 * max) / 15) as u8)
}

/// Outer-loop link adaptation state.
///
/// The offset moves up on ACK and down on NACK, scaled so the loop
/// converges on the target BLER, and is clamped to the configured bound.
#[derive(Debug, Clone, Copy)]
pub struct OllaState {
    offset_db: f32,
    step_db: f32,
    max_offset_db: f32,
}

/// Target BLER the ACK/NACK step ratio converges on
const OLLA_TARGET_BLER: f32 = 0.1;

impl OllaState {
    /// Create with the configured step and bound
    pub fn new(step_db: f32, max_offset_db: f32) -> Self {
        Self {
            offset_db: 0.0,
            step_db,
            max_offset_db,
        }
    }

    /// Current offset in dB
    pub fn offset_db(&self) -> f32 {
        self.offset_db
    }

    /// Register HARQ feedback for a DL transport block
    pub fn on_harq_feedback(&mut self, ack: bool) {
        if ack {
            self.offset_db += self.step_db * OLLA_TARGET_BLER / (1.0 - OLLA_TARGET_BLER);
        } else {
            self.offset_db -= self.step_db;
        }
        self.offset_db = self.offset_db.clamp(-self.max_offset_db, self.max_offset_db);
    }

    /// MCS after applying the offset, one index per dB
    pub fn adjust_mcs(&self, base_mcs: u8, table: McsTable) -> u8 {
        let adjusted = base_mcs as f32 + self.offset_db;
        adjusted.round().clamp(0.0, table.max_mcs() as f32) as u8
    }
}

/// Approximate transport block size in bytes.
///
/// Counts data REs over the allocation and scales by modulation order,
/// code rate and layers. Close enough to the TS 38.214 procedure for
/// scheduling decisions; the PHY computes the exact value.
pub fn estimate_tbs_bytes(nof_prbs: u16, nof_data_symbols: u8, entry: McsEntry, nof_layers: u8) -> u32 {
    const SUBCARRIERS_PER_PRB: u32 = 12;
    let nof_re = nof_prbs as u32 * SUBCARRIERS_PER_PRB * nof_data_symbols as u32;
    let bits = nof_re as u64
        * entry.modulation_order as u64
        * nof_layers as u64
        * entry.code_rate_x1024 as u64
        / 1024;
    (bits / 8) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shapes() {
        assert_eq!(McsTable::Qam64.max_mcs(), 28);
        assert_eq!(McsTable::Qam256.max_mcs(), 27);
        assert_eq!(McsTable::Qam64.entry(0).modulation_order, 2);
        assert_eq!(McsTable::Qam64.entry(28).modulation_order, 6);
        assert_eq!(McsTable::Qam256.entry(27).modulation_order, 8);
    }

    #[test]
    fn test_cqi_mapping_monotone() {
        assert_eq!(cqi_to_mcs(0, McsTable::Qam64), None);
        assert_eq!(cqi_to_mcs(16, McsTable::Qam64), None);
        let mut last = 0;
        for cqi in 1..=15 {
            let mcs = cqi_to_mcs(cqi, McsTable::Qam64).unwrap();
            assert!(mcs >= last);
            last = mcs;
        }
        assert_eq!(cqi_to_mcs(15, McsTable::Qam64), Some(28));
        assert_eq!(cqi_to_mcs(15, McsTable::Qam256), Some(27));
    }

    #[test]
    fn test_olla_bounds() {
        let mut olla = OllaState::new(0.5, 3.0);
        for _ in 0..100 {
            olla.on_harq_feedback(false);
        }
        assert!((olla.offset_db() + 3.0).abs() < 1e-6);

        for _ in 0..10_000 {
            olla.on_harq_feedback(true);
        }
        assert!((olla.offset_db() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_olla_adjusts_mcs() {
        let mut olla = OllaState::new(1.0, 3.0);
        assert_eq!(olla.adjust_mcs(10, McsTable::Qam64), 10);
        olla.on_harq_feedback(false);
        olla.on_harq_feedback(false);
        assert_eq!(olla.adjust_mcs(10, McsTable::Qam64), 8);
        assert_eq!(olla.adjust_mcs(1, McsTable::Qam64), 0);
    }

    #[test]
    fn test_tbs_scales_with_prbs_and_mcs() {
        let low = estimate_tbs_bytes(10, 12, McsTable::Qam64.entry(5), 1);
        let wide = estimate_tbs_bytes(20, 12, McsTable::Qam64.entry(5), 1);
        let fast = estimate_tbs_bytes(10, 12, McsTable::Qam64.entry(20), 1);
        assert!(wide > low);
        assert!(fast > low);
        // 10 PRBs, 12 symbols, QPSK r=120/1024: 1440 RE * 2 * 120/1024 / 8.
        assert_eq!(estimate_tbs_bytes(10, 12, McsTable::Qam64.entry(0), 1), 42);
    }
}
