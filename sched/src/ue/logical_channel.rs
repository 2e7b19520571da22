//! Logical Channel Managers
//!
//! DL side tracks per-channel buffer occupancy reported by RLC and pending
//! MAC CEs; UL side tracks per-LCG buffer status from BSRs and the SR flag.

use crate::config::LogicalChannelConfig;
use common::types::{Lcid, LcgId};
use tracing::debug;

/// Bytes assumed pending when only an SR (no BSR) has been received
const SR_GRANT_BYTES: u64 = 512;

/// Smallest useful transport block in bytes
pub const MIN_TBS_BYTES: u32 = 8;

struct DlChannel {
    cfg: LogicalChannelConfig,
    buffer_bytes: u64,
}

/// DL logical channel state of one UE
#[derive(Default)]
pub struct DlLogicalChannelManager {
    channels: Vec<DlChannel>,
    pending_ce_bytes: u64,
}

impl DlLogicalChannelManager {
    /// Replace the channel configuration, keeping buffer state of channels
    /// that survive.
    pub fn configure(&mut self, configs: &[LogicalChannelConfig]) {
        let mut next = Vec::with_capacity(configs.len());
        for cfg in configs {
            let buffer_bytes = self
                .channels
                .iter()
                .find(|ch| ch.cfg.lcid == cfg.lcid)
                .map(|ch| ch.buffer_bytes)
                .unwrap_or(0);
            next.push(DlChannel {
                cfg: cfg.clone(),
                buffer_bytes,
            });
        }
        // Served strictly by priority, lowest value first.
        next.sort_by_key(|ch| ch.cfg.priority);
        self.channels = next;
    }

    /// Channel configurations in serving order
    pub fn channel_configs(&self) -> impl Iterator<Item = &LogicalChannelConfig> {
        self.channels.iter().map(|ch| &ch.cfg)
    }

    /// RLC buffer occupancy update
    pub fn handle_dl_buffer_state(&mut self, lcid: Lcid, bytes: u64) {
        match self.channels.iter_mut().find(|ch| ch.cfg.lcid == lcid) {
            Some(ch) => ch.buffer_bytes = bytes,
            None => debug!("DL buffer state for unknown LCID {:?} ignored", lcid),
        }
    }

    /// A MAC CE awaits transmission
    pub fn handle_mac_ce(&mut self, bytes: u16) {
        self.pending_ce_bytes += bytes as u64;
    }

    /// Total bytes awaiting transmission
    pub fn pending_bytes(&self) -> u64 {
        self.pending_ce_bytes + self.channels.iter().map(|ch| ch.buffer_bytes).sum::<u64>()
    }

    /// Pending bytes of one channel
    pub fn pending_bytes_for(&self, lcid: Lcid) -> u64 {
        self.channels
            .iter()
            .find(|ch| ch.cfg.lcid == lcid)
            .map(|ch| ch.buffer_bytes)
            .unwrap_or(0)
    }

    /// Whether anything is pending
    pub fn has_pending(&self) -> bool {
        self.pending_bytes() > 0
    }

    /// Consume up to `tbs_bytes` across CEs first, then channels in
    /// priority order. Returns the bytes actually drawn.
    pub fn allocate(&mut self, tbs_bytes: u32) -> u64 {
        let mut budget = tbs_bytes as u64;
        let ce = budget.min(self.pending_ce_bytes);
        self.pending_ce_bytes -= ce;
        budget -= ce;
        for ch in &mut self.channels {
            if budget == 0 {
                break;
            }
            let taken = budget.min(ch.buffer_bytes);
            ch.buffer_bytes -= taken;
            budget -= taken;
        }
        tbs_bytes as u64 - budget
    }
}

/// UL logical channel state of one UE
#[derive(Default)]
pub struct UlLogicalChannelManager {
    lcg_bytes: [u64; 8],
    sr_pending: bool,
}

impl UlLogicalChannelManager {
    /// BSR update for one LCG
    pub fn handle_bsr(&mut self, lcg_id: LcgId, bytes: u32) {
        self.lcg_bytes[lcg_id.0 as usize] = bytes as u64;
    }

    /// SR received on PUCCH
    pub fn handle_sr(&mut self) {
        self.sr_pending = true;
    }

    /// A UL grant was issued; the SR is considered satisfied.
    pub fn reset_sr(&mut self) {
        self.sr_pending = false;
    }

    /// Whether an SR is outstanding
    pub fn has_sr_pending(&self) -> bool {
        self.sr_pending
    }

    /// Reported bytes of one LCG
    pub fn lcg_bytes(&self, lcg_id: LcgId) -> u64 {
        self.lcg_bytes[lcg_id.0 as usize]
    }

    /// Bytes to serve with a fresh UL grant. An SR with an all-zero buffer
    /// report still warrants a small grant so the UE can send its BSR.
    pub fn pending_newtx_bytes(&self) -> u64 {
        let reported: u64 = self.lcg_bytes.iter().sum();
        if reported == 0 && self.sr_pending {
            SR_GRANT_BYTES
        } else {
            reported
        }
    }

    /// A UL grant of `tbs_bytes` was scheduled; decrement the estimate.
    pub fn on_ul_grant(&mut self, tbs_bytes: u32) {
        let mut budget = tbs_bytes as u64;
        for bytes in &mut self.lcg_bytes {
            if budget == 0 {
                break;
            }
            let taken = budget.min(*bytes);
            *bytes -= taken;
            budget -= taken;
        }
        self.reset_sr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogicalChannelConfig;

    #[test]
    fn test_dl_priority_draining() {
        let mut mgr = DlLogicalChannelManager::default();
        let mut srb = LogicalChannelConfig::srb1();
        srb.priority = 1;
        let mut drb = LogicalChannelConfig::drb(Lcid::MIN_DRB);
        drb.priority = 10;
        mgr.configure(&[drb, srb]);

        mgr.handle_dl_buffer_state(Lcid::SRB1, 100);
        mgr.handle_dl_buffer_state(Lcid::MIN_DRB, 1000);
        assert_eq!(mgr.pending_bytes(), 1100);

        // 150-byte TB drains SRB1 fully, DRB partially.
        assert_eq!(mgr.allocate(150), 150);
        assert_eq!(mgr.pending_bytes_for(Lcid::SRB1), 0);
        assert_eq!(mgr.pending_bytes_for(Lcid::MIN_DRB), 950);
    }

    #[test]
    fn test_dl_mac_ce_served_first() {
        let mut mgr = DlLogicalChannelManager::default();
        mgr.configure(&[LogicalChannelConfig::srb1()]);
        mgr.handle_dl_buffer_state(Lcid::SRB1, 50);
        mgr.handle_mac_ce(10);
        assert_eq!(mgr.pending_bytes(), 60);
        assert_eq!(mgr.allocate(12), 12);
        // CE fully served before SRB1.
        assert_eq!(mgr.pending_bytes(), 48);
        assert_eq!(mgr.pending_bytes_for(Lcid::SRB1), 48);
    }

    #[test]
    fn test_reconfigure_keeps_surviving_buffers() {
        let mut mgr = DlLogicalChannelManager::default();
        mgr.configure(&[LogicalChannelConfig::srb1(), LogicalChannelConfig::drb(Lcid::MIN_DRB)]);
        mgr.handle_dl_buffer_state(Lcid::MIN_DRB, 500);

        // Drop the DRB, keep SRB1.
        mgr.configure(&[LogicalChannelConfig::srb1()]);
        assert_eq!(mgr.pending_bytes_for(Lcid::MIN_DRB), 0);
        assert_eq!(mgr.pending_bytes(), 0);
    }

    #[test]
    fn test_ul_sr_fallback_grant() {
        let mut mgr = UlLogicalChannelManager::default();
        assert_eq!(mgr.pending_newtx_bytes(), 0);
        mgr.handle_sr();
        assert_eq!(mgr.pending_newtx_bytes(), SR_GRANT_BYTES);

        mgr.handle_bsr(LcgId(1), 2000);
        assert_eq!(mgr.pending_newtx_bytes(), 2000);

        mgr.on_ul_grant(500);
        assert!(!mgr.has_sr_pending());
        assert_eq!(mgr.pending_newtx_bytes(), 1500);
    }
}
