//! Scheduler Indication Messages
//!
//! Decoded structures handed to the scheduler by MAC and upper layers.
//! These are buffered per cell and drained at the start of the next slot.

use common::types::{DuCellIndex, DuUeIndex, Lcid, LcgId, Rnti};
use common::SlotPoint;

/// One detected PRACH preamble
#[derive(Debug, Clone, Copy)]
pub struct RachPreamble {
    /// Preamble index
    pub preamble_index: u8,
    /// Timing advance estimate in microseconds
    pub timing_advance_us: f32,
    /// Temporary C-RNTI allocated by MAC
    pub tc_rnti: Rnti,
}

/// PRACH detection report
#[derive(Debug, Clone)]
pub struct RachIndicationMessage {
    /// Cell the PRACH occasion belongs to
    pub cell_index: DuCellIndex,
    /// Slot the preambles were received in
    pub slot_rx: SlotPoint,
    /// Detected preambles
    pub preambles: Vec<RachPreamble>,
}

/// Buffer status report for one logical channel group
#[derive(Debug, Clone, Copy)]
pub struct BsrReport {
    /// Logical channel group
    pub lcg_id: LcgId,
    /// Reported buffer size in bytes
    pub bytes: u32,
}

/// UL buffer status indication
#[derive(Debug, Clone)]
pub struct BsrIndication {
    /// Reporting UE
    pub ue_index: DuUeIndex,
    /// Per-LCG reports
    pub reports: Vec<BsrReport>,
}

/// Power headroom indication
#[derive(Debug, Clone, Copy)]
pub struct PhrIndication {
    /// Reporting UE
    pub ue_index: DuUeIndex,
    /// Power headroom in dB
    pub phr_db: i8,
}

/// Scheduling request indication
#[derive(Debug, Clone, Copy)]
pub struct SrIndication {
    /// Requesting UE
    pub ue_index: DuUeIndex,
}

/// DL buffer occupancy update from RLC
#[derive(Debug, Clone, Copy)]
pub struct DlBufferStateIndication {
    /// Target UE
    pub ue_index: DuUeIndex,
    /// Logical channel
    pub lcid: Lcid,
    /// Pending bytes for the channel
    pub bytes: u64,
}

/// MAC CE pending for transmission
#[derive(Debug, Clone, Copy)]
pub struct MacCeIndication {
    /// Target UE
    pub ue_index: DuUeIndex,
    /// LCID identifying the CE type
    pub ce_lcid: Lcid,
    /// CE size in bytes
    pub bytes: u16,
}

/// Per-UE indication buffered onto the owning cell
#[derive(Debug, Clone)]
pub enum UeIndication {
    /// UL buffer status
    Bsr(BsrIndication),
    /// Power headroom
    Phr(PhrIndication),
    /// Scheduling request
    Sr(SrIndication),
    /// DL buffer state
    DlBufferState(DlBufferStateIndication),
    /// Pending MAC CE
    MacCe(MacCeIndication),
}
