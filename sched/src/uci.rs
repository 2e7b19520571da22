//! UCI / CRC Decoding
//!
//! Maps PHY feedback onto scheduler state. Every scheduled PUCCH leaves a
//! context in a slot-indexed ring so an incoming UCI PDU can be matched to
//! the UE and the expected payload; UCI without a context is dropped and
//! counted, never fatal. CRC indications map one-to-one onto UL HARQ
//! processes.

use crate::cell::ring_grid::RingGrid;
use crate::config::CellConfig;
use crate::result::PucchGrant;
use crate::ue::harq::{HarqId, NackOutcome};
use crate::ue::{RntiIndex, UeTable};
use common::slot::max_slot_alloc_delay;
use common::types::Rnti;
use common::SlotPoint;
use tracing::{debug, warn};

/// Expected UCI payload recorded when the PUCCH was scheduled
#[derive(Debug, Clone, Copy)]
pub struct UciContext {
    /// Transmitting UE
    pub rnti: Rnti,
    /// Number of HARQ-ACK bits expected
    pub expected_harq_bits: u8,
    /// Whether a CSI report is expected
    pub csi_expected: bool,
}

/// One HARQ-ACK bit as reported by the PHY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqAckBit {
    /// Positive acknowledgement
    Ack,
    /// Negative acknowledgement
    Nack,
    /// Detection flagged invalid by the PHY
    Invalid,
}

/// CSI part of a UCI PDU
#[derive(Debug, Clone, Copy)]
pub struct CsiReport {
    /// Wideband CQI, 0 means out of range
    pub cqi: u8,
    /// Rank indicator
    pub ri: u8,
}

/// One decoded PUCCH PDU
#[derive(Debug, Clone)]
pub struct UciPdu {
    /// Reported RNTI
    pub rnti: Rnti,
    /// HARQ-ACK bits
    pub harq_bits: Vec<HarqAckBit>,
    /// Scheduling request detected
    pub sr_detected: bool,
    /// CSI report, when present
    pub csi: Option<CsiReport>,
}

/// MAC UCI indication for one UL slot
#[derive(Debug, Clone)]
pub struct MacUciIndication {
    /// Cell the PUCCHs belong to
    pub cell_index: common::types::DuCellIndex,
    /// Slot the PUCCHs were received in
    pub slot_rx: SlotPoint,
    /// Decoded PDUs
    pub pdus: Vec<UciPdu>,
}

/// One PUSCH CRC result
#[derive(Debug, Clone, Copy)]
pub struct CrcPdu {
    /// Transmitting UE
    pub rnti: Rnti,
    /// UL HARQ process the PUSCH belonged to
    pub harq_id: HarqId,
    /// Whether the transport block passed CRC
    pub tb_crc_ok: bool,
}

/// CRC indication for one UL slot
#[derive(Debug, Clone)]
pub struct UlCrcIndication {
    /// Cell the PUSCHs belong to
    pub cell_index: common::types::DuCellIndex,
    /// Slot the PUSCHs were received in
    pub slot_rx: SlotPoint,
    /// Per-PUSCH results
    pub crcs: Vec<CrcPdu>,
}

/// Feedback events surfaced to the metrics handler
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedbackCounters {
    /// UCI PDUs with no recorded context
    pub unexpected_uci: u32,
    /// HARQ bits flagged invalid on PUCCH F2/F3/F4
    pub nof_pucch_f2f3f4_invalid_harqs: u32,
    /// HARQ ACKs applied
    pub harq_acks: u32,
    /// HARQ NACKs applied
    pub harq_nacks: u32,
    /// Transport blocks dropped after max retransmissions
    pub harq_drops: u32,
    /// CRC PDUs applied
    pub crc_pdus: u32,
    /// CRC passes
    pub crc_acks: u32,
    /// SRs detected
    pub srs: u32,
    /// CSI reports applied
    pub csi_reports: u32,
}

/// Per-cell UCI decoder with its context ring
pub struct UciCellDecoder {
    ring: RingGrid<Vec<UciContext>>,
}

impl UciCellDecoder {
    /// Build the decoder for a cell
    pub fn new(cfg: &CellConfig) -> Self {
        let lookahead = max_slot_alloc_delay(0) + cfg.expert.max_processing_delay_slots;
        Self {
            ring: RingGrid::new(lookahead, cfg.scs),
        }
    }

    /// Record the contexts of PUCCHs scheduled for `uci_slot`
    pub fn store_uci(&mut self, uci_slot: SlotPoint, pucchs: &[PucchGrant]) {
        let entry = self.ring.get_mut(uci_slot);
        for pucch in pucchs {
            entry.push(UciContext {
                rnti: pucch.rnti,
                expected_harq_bits: pucch.expected_harq_bits,
                csi_expected: pucch.csi_expected,
            });
        }
    }

    /// Drop contexts of a slot that passed beyond the feedback horizon
    pub fn evict_slot(&mut self, slot: SlotPoint) {
        self.ring.get_mut(slot).clear();
    }

    /// Number of contexts stored for a slot, used by tests
    pub fn nof_contexts(&self, slot: SlotPoint) -> usize {
        self.ring.get(slot).len()
    }

    /// Apply a MAC UCI indication to the UE state.
    ///
    /// Returns the counters for the metrics handler.
    pub fn decode_uci(
        &mut self,
        msg: &MacUciIndication,
        ues: &mut UeTable,
        rnti_index: &RntiIndex,
    ) -> FeedbackCounters {
        let mut counters = FeedbackCounters::default();
        for pdu in &msg.pdus {
            let has_context = self
                .ring
                .get(msg.slot_rx)
                .iter()
                .any(|ctx| ctx.rnti == pdu.rnti);
            if !has_context {
                warn!("UCI for RNTI {:#06x} at {} has no recorded context, dropping", pdu.rnti.0, msg.slot_rx);
                counters.unexpected_uci += 1;
                continue;
            }
            let ue_index = match rnti_index.lookup(pdu.rnti) {
                Some(idx) => idx,
                None => {
                    warn!("UCI for unknown RNTI {:#06x}, dropping", pdu.rnti.0);
                    counters.unexpected_uci += 1;
                    continue;
                }
            };
            let ue = match ues.get_mut(ue_index) {
                Some(ue) => ue,
                None => continue,
            };

            for bit in &pdu.harq_bits {
                match bit {
                    HarqAckBit::Invalid => {
                        // Detection not trustworthy: the process keeps
                        // waiting and will retx or time out on its own.
                        counters.nof_pucch_f2f3f4_invalid_harqs += 1;
                    }
                    HarqAckBit::Ack | HarqAckBit::Nack => {
                        let ack = *bit == HarqAckBit::Ack;
                        let pcell = ue.pcell_mut();
                        let max_retx = pcell.dl_harqs.max_retx();
                        match pcell.dl_harqs.find_waiting_ack_at(msg.slot_rx) {
                            Some(process) => {
                                if ack {
                                    process.ack();
                                    counters.harq_acks += 1;
                                } else {
                                    counters.harq_nacks += 1;
                                    if process.nack(max_retx) == NackOutcome::Dropped {
                                        counters.harq_drops += 1;
                                    }
                                }
                                pcell.channel_state.dl_olla.on_harq_feedback(ack);
                            }
                            None => {
                                debug!("HARQ bit without waiting process for UE {:?} at {}", ue_index, msg.slot_rx);
                            }
                        }
                    }
                }
            }

            if pdu.sr_detected {
                ue.ul_lc.handle_sr();
                counters.srs += 1;
            }

            if let Some(csi) = &pdu.csi {
                if csi.cqi > 15 {
                    debug!("CSI with out-of-range CQI {} dropped", csi.cqi);
                } else {
                    let state = &mut ue.pcell_mut().channel_state;
                    state.cqi = csi.cqi;
                    state.ri = csi.ri.max(1);
                    counters.csi_reports += 1;
                }
            }
        }
        counters
    }

    /// Apply a CRC indication to the UL HARQ entities.
    pub fn handle_crc(
        &mut self,
        msg: &UlCrcIndication,
        ues: &mut UeTable,
        rnti_index: &RntiIndex,
    ) -> FeedbackCounters {
        let mut counters = FeedbackCounters::default();
        for crc in &msg.crcs {
            let ue_index = match rnti_index.lookup(crc.rnti) {
                Some(idx) => idx,
                None => {
                    warn!("CRC for unknown RNTI {:#06x}, dropping", crc.rnti.0);
                    counters.unexpected_uci += 1;
                    continue;
                }
            };
            let ue = match ues.get_mut(ue_index) {
                Some(ue) => ue,
                None => continue,
            };
            let pcell = ue.pcell_mut();
            let max_retx = pcell.ul_harqs.max_retx();
            let process = match pcell.ul_harqs.process_mut(crc.harq_id) {
                Some(p) if !p.is_empty() => p,
                _ => {
                    debug!("CRC for idle UL HARQ {:?} of UE {:?} dropped", crc.harq_id, ue_index);
                    continue;
                }
            };
            counters.crc_pdus += 1;
            if crc.tb_crc_ok {
                process.ack();
                counters.crc_acks += 1;
            } else if process.nack(max_retx) == NackOutcome::Dropped {
                counters.harq_drops += 1;
            }
            pcell.channel_state.ul_olla.on_harq_feedback(crc.tb_crc_ok);
        }
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_util::test_cell_config;
    use crate::config::{LogicalChannelConfig, UeCreationRequest};
    use crate::result::PrbInterval;
    use crate::ue::Ue;
    use common::types::{AggregationLevel, DuCellIndex, DuUeIndex, SubcarrierSpacing};

    fn setup() -> (crate::config::CellConfig, UciCellDecoder, UeTable, RntiIndex) {
        let cfg = test_cell_config(SubcarrierSpacing::Scs30, None);
        let decoder = UciCellDecoder::new(&cfg);
        let mut ues = UeTable::new();
        let mut rntis = RntiIndex::default();
        let req = UeCreationRequest {
            ue_index: DuUeIndex(0),
            crnti: Rnti(0x4601),
            pcell_index: DuCellIndex(0),
            lc_configs: vec![LogicalChannelConfig::srb1()],
            sched_request_configs: vec![],
            preferred_aggregation_level: AggregationLevel::Al4,
        };
        ues.insert(Box::new(Ue::new(&req, &cfg))).unwrap();
        rntis.insert(Rnti(0x4601), DuUeIndex(0)).unwrap();
        (cfg, decoder, ues, rntis)
    }

    fn start_harq(ues: &mut UeTable, cfg: &crate::config::CellConfig, slot_tx: SlotPoint) -> SlotPoint {
        let ack_slot = slot_tx + cfg.k1 as i32;
        let ue = ues.get_mut(DuUeIndex(0)).unwrap();
        let p = ue.pcell_mut().dl_harqs.find_empty().unwrap();
        p.new_tx(slot_tx, ack_slot, 10, 1000, PrbInterval::new(0, 10));
        ack_slot
    }

    fn uci(slot_rx: SlotPoint, bit: HarqAckBit) -> MacUciIndication {
        MacUciIndication {
            cell_index: DuCellIndex(0),
            slot_rx,
            pdus: vec![UciPdu {
                rnti: Rnti(0x4601),
                harq_bits: vec![bit],
                sr_detected: false,
                csi: None,
            }],
        }
    }

    #[test]
    fn test_ack_releases_harq() {
        let (cfg, mut decoder, mut ues, rntis) = setup();
        let slot_tx = SlotPoint::new(cfg.scs, 0, 0);
        let ack_slot = start_harq(&mut ues, &cfg, slot_tx);
        decoder.store_uci(ack_slot, &[PucchGrant { rnti: Rnti(0x4601), expected_harq_bits: 1, csi_expected: false }]);

        let counters = decoder.decode_uci(&uci(ack_slot, HarqAckBit::Ack), &mut ues, &rntis);
        assert_eq!(counters.harq_acks, 1);
        assert!(!ues.get(DuUeIndex(0)).unwrap().pcell().dl_harqs.has_inflight());
    }

    #[test]
    fn test_nack_marks_pending_retx() {
        let (cfg, mut decoder, mut ues, rntis) = setup();
        let slot_tx = SlotPoint::new(cfg.scs, 0, 0);
        let ack_slot = start_harq(&mut ues, &cfg, slot_tx);
        decoder.store_uci(ack_slot, &[PucchGrant { rnti: Rnti(0x4601), expected_harq_bits: 1, csi_expected: false }]);

        let counters = decoder.decode_uci(&uci(ack_slot, HarqAckBit::Nack), &mut ues, &rntis);
        assert_eq!(counters.harq_nacks, 1);
        assert_eq!(counters.harq_drops, 0);
        let ue = ues.get_mut(DuUeIndex(0)).unwrap();
        assert!(ue.pcell_mut().dl_harqs.find_pending_retx().is_some());
    }

    #[test]
    fn test_unexpected_uci_dropped_and_counted() {
        let (cfg, mut decoder, mut ues, rntis) = setup();
        let slot = SlotPoint::new(cfg.scs, 2, 0);
        // No context stored for this slot.
        let counters = decoder.decode_uci(&uci(slot, HarqAckBit::Ack), &mut ues, &rntis);
        assert_eq!(counters.unexpected_uci, 1);
        assert_eq!(counters.harq_acks, 0);
    }

    #[test]
    fn test_invalid_harq_bit_leaves_state_untouched() {
        let (cfg, mut decoder, mut ues, rntis) = setup();
        let slot_tx = SlotPoint::new(cfg.scs, 0, 0);
        let ack_slot = start_harq(&mut ues, &cfg, slot_tx);
        decoder.store_uci(ack_slot, &[PucchGrant { rnti: Rnti(0x4601), expected_harq_bits: 1, csi_expected: false }]);

        let counters = decoder.decode_uci(&uci(ack_slot, HarqAckBit::Invalid), &mut ues, &rntis);
        assert_eq!(counters.nof_pucch_f2f3f4_invalid_harqs, 1);
        // Still waiting for feedback.
        let ue = ues.get_mut(DuUeIndex(0)).unwrap();
        assert!(ue.pcell_mut().dl_harqs.find_waiting_ack_at(ack_slot).is_some());
    }

    #[test]
    fn test_csi_updates_channel_state() {
        let (cfg, mut decoder, mut ues, rntis) = setup();
        let slot = SlotPoint::new(cfg.scs, 0, 4);
        decoder.store_uci(slot, &[PucchGrant { rnti: Rnti(0x4601), expected_harq_bits: 0, csi_expected: true }]);
        let msg = MacUciIndication {
            cell_index: DuCellIndex(0),
            slot_rx: slot,
            pdus: vec![UciPdu {
                rnti: Rnti(0x4601),
                harq_bits: vec![],
                sr_detected: true,
                csi: Some(CsiReport { cqi: 12, ri: 2 }),
            }],
        };
        let counters = decoder.decode_uci(&msg, &mut ues, &rntis);
        assert_eq!(counters.csi_reports, 1);
        assert_eq!(counters.srs, 1);
        let ue = ues.get(DuUeIndex(0)).unwrap();
        assert_eq!(ue.pcell().channel_state.cqi, 12);
        assert_eq!(ue.pcell().channel_state.ri, 2);
        assert!(ue.ul_lc.has_sr_pending());
    }

    #[test]
    fn test_crc_maps_to_ul_harq() {
        let (cfg, mut decoder, mut ues, rntis) = setup();
        let pusch_slot = SlotPoint::new(cfg.scs, 0, 4);
        {
            let ue = ues.get_mut(DuUeIndex(0)).unwrap();
            let p = ue.pcell_mut().ul_harqs.find_empty().unwrap();
            p.new_tx(pusch_slot, pusch_slot + 4, 8, 500, PrbInterval::new(0, 5));
        }
        let msg = UlCrcIndication {
            cell_index: DuCellIndex(0),
            slot_rx: pusch_slot,
            crcs: vec![CrcPdu {
                rnti: Rnti(0x4601),
                harq_id: HarqId(0),
                tb_crc_ok: true,
            }],
        };
        let counters = decoder.handle_crc(&msg, &mut ues, &rntis);
        assert_eq!(counters.crc_pdus, 1);
        assert_eq!(counters.crc_acks, 1);
        assert!(!ues.get(DuUeIndex(0)).unwrap().pcell().ul_harqs.has_inflight());
    }

    #[test]
    fn test_evict_clears_contexts() {
        let (cfg, mut decoder, _ues, _rntis) = setup();
        let slot = SlotPoint::new(cfg.scs, 0, 4);
        decoder.store_uci(slot, &[PucchGrant { rnti: Rnti(0x4601), expected_harq_bits: 1, csi_expected: false }]);
        assert_eq!(decoder.nof_contexts(slot), 1);
        decoder.evict_slot(slot);
        assert_eq!(decoder.nof_contexts(slot), 0);
    }
}
