//! HARQ Entity
//!
//! Per-UE, per-direction HARQ processes with a bounded process count and
//! strict ordering of retransmissions. One state machine per process:
//!
//! empty -> waiting_ack on a new transmission; waiting_ack resolves to
//! empty (ACK, drop after max retx, or timeout) or pending_retx (NACK with
//! retransmissions left); pending_retx returns to waiting_ack when the
//! retransmission is granted.

use crate::result::PrbInterval;
use common::SlotPoint;

/// Redundancy version sequence applied over (re)transmissions
pub const RV_SEQUENCE: [u8; 4] = [0, 2, 3, 1];

/// HARQ process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HarqId(pub u8);

/// HARQ process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqState {
    /// No transport block in flight
    Empty,
    /// Transmitted, waiting for feedback at `slot_ack`
    WaitingAck,
    /// NACKed, waiting for a retransmission grant
    PendingRetx,
}

/// Outcome of applying a NACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The process now waits for a retransmission grant
    RetxPending,
    /// Maximum retransmissions reached; the transport block is dropped
    Dropped,
}

/// One HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess {
    /// Process id, stable for the entity's lifetime
    pub id: HarqId,
    state: HarqState,
    ndi: bool,
    rv_idx: u8,
    retx_count: u8,
    /// MCS of the original transmission, preserved across retx
    pub mcs: u8,
    /// TBS of the original transmission in bytes
    pub tbs_bytes: u32,
    /// PRBs of the original transmission, preserved across retx
    pub prbs: PrbInterval,
    /// Slot of the last (re)transmission
    pub slot_tx: Option<SlotPoint>,
    /// Slot where feedback for the last (re)transmission is expected
    pub slot_ack: Option<SlotPoint>,
}

impl HarqProcess {
    fn new(id: HarqId) -> Self {
        Self {
            id,
            state: HarqState::Empty,
            ndi: false,
            rv_idx: 0,
            retx_count: 0,
            mcs: 0,
            tbs_bytes: 0,
            prbs: PrbInterval::default(),
            slot_tx: None,
            slot_ack: None,
        }
    }

    /// Current state
    pub fn state(&self) -> HarqState {
        self.state
    }

    /// Whether the process holds no transport block
    pub fn is_empty(&self) -> bool {
        self.state == HarqState::Empty
    }

    /// Whether a retransmission is pending
    pub fn has_pending_retx(&self) -> bool {
        self.state == HarqState::PendingRetx
    }

    /// New-data indicator; toggles only on fresh transmissions
    pub fn ndi(&self) -> bool {
        self.ndi
    }

    /// Redundancy version of the last (re)transmission
    pub fn rv(&self) -> u8 {
        RV_SEQUENCE[self.rv_idx as usize % RV_SEQUENCE.len()]
    }

    /// Number of retransmissions so far
    pub fn retx_count(&self) -> u8 {
        self.retx_count
    }

    /// Start a fresh transmission on an empty process
    pub fn new_tx(&mut self, slot_tx: SlotPoint, slot_ack: SlotPoint, mcs: u8, tbs_bytes: u32, prbs: PrbInterval) {
        assert!(self.is_empty(), "new_tx on a non-empty HARQ process");
        self.state = HarqState::WaitingAck;
        self.ndi = !self.ndi;
        self.rv_idx = 0;
        self.retx_count = 0;
        self.mcs = mcs;
        self.tbs_bytes = tbs_bytes;
        self.prbs = prbs;
        self.slot_tx = Some(slot_tx);
        self.slot_ack = Some(slot_ack);
    }

    /// Grant the pending retransmission; PRBs and MCS are unchanged, the
    /// redundancy version advances and the NDI does not toggle.
    pub fn new_retx(&mut self, slot_tx: SlotPoint, slot_ack: SlotPoint) {
        assert!(self.has_pending_retx(), "new_retx without a pending retx");
        self.state = HarqState::WaitingAck;
        self.rv_idx = (self.rv_idx + 1) % RV_SEQUENCE.len() as u8;
        self.retx_count += 1;
        self.slot_tx = Some(slot_tx);
        self.slot_ack = Some(slot_ack);
    }

    /// Positive feedback: release the process
    pub fn ack(&mut self) -> u32 {
        debug_assert_eq!(self.state, HarqState::WaitingAck);
        let tbs = self.tbs_bytes;
        self.reset();
        tbs
    }

    /// Negative feedback
    pub fn nack(&mut self, max_retx: u8) -> NackOutcome {
        debug_assert_eq!(self.state, HarqState::WaitingAck);
        if self.retx_count >= max_retx {
            self.reset();
            NackOutcome::Dropped
        } else {
            self.state = HarqState::PendingRetx;
            NackOutcome::RetxPending
        }
    }

    fn reset(&mut self) {
        self.state = HarqState::Empty;
        self.rv_idx = 0;
        self.retx_count = 0;
        self.slot_tx = None;
        self.slot_ack = None;
    }
}

/// All HARQ processes of one UE in one direction
pub struct HarqEntity {
    procs: Vec<HarqProcess>,
    max_retx: u8,
}

impl HarqEntity {
    /// Create an entity with `nof_procs` processes
    pub fn new(nof_procs: u8, max_retx: u8) -> Self {
        Self {
            procs: (0..nof_procs).map(|id| HarqProcess::new(HarqId(id))).collect(),
            max_retx,
        }
    }

    /// Maximum retransmissions configured for this entity
    pub fn max_retx(&self) -> u8 {
        self.max_retx
    }

    /// Access a process by id
    pub fn process(&self, id: HarqId) -> Option<&HarqProcess> {
        self.procs.get(id.0 as usize)
    }

    /// Mutable access to a process by id
    pub fn process_mut(&mut self, id: HarqId) -> Option<&mut HarqProcess> {
        self.procs.get_mut(id.0 as usize)
    }

    /// Lowest-id empty process
    pub fn find_empty(&mut self) -> Option<&mut HarqProcess> {
        self.procs.iter_mut().find(|p| p.is_empty())
    }

    /// Oldest process with a pending retransmission (lowest `slot_tx`)
    pub fn find_pending_retx(&mut self) -> Option<&mut HarqProcess> {
        self.procs
            .iter_mut()
            .filter(|p| p.has_pending_retx())
            .min_by_key(|p| p.slot_tx.map(|s| s.count()))
    }

    /// Process waiting for feedback at the given slot
    pub fn find_waiting_ack_at(&mut self, slot_ack: SlotPoint) -> Option<&mut HarqProcess> {
        self.procs
            .iter_mut()
            .find(|p| p.state() == HarqState::WaitingAck && p.slot_ack == Some(slot_ack))
    }

    /// Whether some process already expects feedback at the given slot.
    /// At most one process per entity may wait on a given slot, so a new
    /// (re)transmission must pick a different feedback occasion.
    pub fn has_waiting_ack_at(&self, slot_ack: SlotPoint) -> bool {
        self.procs
            .iter()
            .any(|p| p.state() == HarqState::WaitingAck && p.slot_ack == Some(slot_ack))
    }

    /// Whether any process holds a transport block
    pub fn has_inflight(&self) -> bool {
        self.procs.iter().any(|p| !p.is_empty())
    }

    /// Expire processes whose feedback never arrived.
    ///
    /// Returns the number of processes dropped; the caller feeds the count
    /// into the metrics, nothing bubbles up.
    pub fn expire_timeouts(&mut self, now: SlotPoint, timeout_slots: u32) -> u32 {
        let mut dropped = 0;
        for p in &mut self.procs {
            if p.state() == HarqState::WaitingAck {
                if let Some(slot_ack) = p.slot_ack {
                    if now - slot_ack > timeout_slots as i32 {
                        p.reset();
                        dropped += 1;
                    }
                }
            }
        }
        dropped
    }
}
