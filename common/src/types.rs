//! Common Types for the 5G DU
//!
//! Defines fundamental types used throughout the scheduler and execution fabric

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of UEs a DU instance can hold
pub const MAX_DU_UES: usize = 1024;

/// Maximum number of cells a DU instance can hold
pub const MAX_DU_CELLS: usize = 16;

/// Maximum number of serving cells aggregated per UE
pub const MAX_UE_CELLS: usize = 4;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Largest RNTI value assignable to a C-RNTI, TS 38.321 Table 7.1-1
    pub const MAX_CRNTI: u16 = 0xFFEF;
    /// SI-RNTI used for broadcast scheduling
    pub const SI_RNTI: Self = Self(0xFFFF);

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether the value lies in the C-RNTI range
    pub fn is_crnti(&self) -> bool {
        self.0 > 0 && self.0 <= Self::MAX_CRNTI
    }
}

/// DU-local UE index. Dense, stable for the lifetime of the UE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DuUeIndex(pub u16);

impl DuUeIndex {
    /// Create a new index with range validation
    pub fn new(value: u16) -> Option<Self> {
        if (value as usize) < MAX_DU_UES {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the index value
    pub fn value(&self) -> usize {
        self.0 as usize
    }
}

/// DU-local cell index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DuCellIndex(pub u8);

impl DuCellIndex {
    /// Create a new index with range validation
    pub fn new(value: u8) -> Option<Self> {
        if (value as usize) < MAX_DU_CELLS {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the index value
    pub fn value(&self) -> usize {
        self.0 as usize
    }
}

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-1007)
    pub const MAX: u16 = 1007;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Logical Channel Identifier, TS 38.321
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// SRB0 (CCCH)
    pub const SRB0: Self = Self(0);
    /// SRB1
    pub const SRB1: Self = Self(1);
    /// SRB2
    pub const SRB2: Self = Self(2);
    /// First LCID usable by a DRB
    pub const MIN_DRB: Self = Self(4);
    /// Last LCID usable by a DRB
    pub const MAX_DRB: Self = Self(32);

    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX_DRB.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Whether this LCID identifies a DRB
    pub fn is_drb(&self) -> bool {
        self.0 >= Self::MIN_DRB.0
    }
}

/// Logical Channel Group identifier (0-7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LcgId(pub u8);

impl LcgId {
    /// Create a new LCG id with validation
    pub fn new(value: u8) -> Option<Self> {
        if value < 8 {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// NR operating band, e.g. n78
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NrBand(pub u16);

impl NrBand {
    /// Band n3 (1800 MHz FDD)
    pub const N3: Self = Self(3);
    /// Band n78 (3.5 GHz TDD)
    pub const N78: Self = Self(78);
}

/// 5G QoS Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveQi(pub u8);

impl FiveQi {
    /// Conversational voice
    pub const VOICE: Self = Self(1);
    /// Non-GBR default bearer
    pub const DEFAULT: Self = Self(9);
}

/// RRM slice identifier, DU-local
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceId(pub u8);

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
}

impl SubcarrierSpacing {
    /// Numerology index mu, TS 38.211
    pub fn mu(&self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
        }
    }

    /// Number of slots in a 10ms frame
    pub fn slots_per_frame(&self) -> u32 {
        10 << self.mu()
    }

    /// Number of slots in a 1ms subframe
    pub fn slots_per_subframe(&self) -> u32 {
        1 << self.mu()
    }

    /// Slot duration: the 1ms subframe halves with every numerology step
    pub fn slot_duration(&self) -> Duration {
        Duration::from_micros(1000 >> self.mu())
    }

    /// Build from a numerology index
    pub fn from_mu(mu: u8) -> Option<Self> {
        match mu {
            0 => Some(SubcarrierSpacing::Scs15),
            1 => Some(SubcarrierSpacing::Scs30),
            2 => Some(SubcarrierSpacing::Scs60),
            3 => Some(SubcarrierSpacing::Scs120),
            _ => None,
        }
    }
}

/// Channel bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 20 MHz
    Bw20,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw20 => 20_000_000,
            Bandwidth::Bw40 => 40_000_000,
            Bandwidth::Bw50 => 50_000_000,
            Bandwidth::Bw100 => 100_000_000,
        }
    }

    /// Build from a MHz value
    pub fn from_mhz(mhz: u32) -> Option<Self> {
        match mhz {
            5 => Some(Bandwidth::Bw5),
            10 => Some(Bandwidth::Bw10),
            20 => Some(Bandwidth::Bw20),
            40 => Some(Bandwidth::Bw40),
            50 => Some(Bandwidth::Bw50),
            100 => Some(Bandwidth::Bw100),
            _ => None,
        }
    }

    /// Upper bound on the PRBs a BWP of this width can hold at the given
    /// subcarrier spacing (12 subcarriers per PRB). The configured BWP may
    /// use fewer once the TS 38.104 guard bands are subtracted.
    pub fn max_nof_prbs(&self, scs: SubcarrierSpacing) -> u16 {
        const SUBCARRIERS_PER_PRB: u32 = 12;
        let scs_hz = scs as u32 * 1000;
        (self.as_hz() / scs_hz / SUBCARRIERS_PER_PRB) as u16
    }
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexMode {
    /// Frequency Division Duplex
    Fdd,
    /// Time Division Duplex
    Tdd,
}

/// PDCCH aggregation level in CCEs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AggregationLevel {
    /// 1 CCE
    Al1 = 1,
    /// 2 CCEs
    Al2 = 2,
    /// 4 CCEs
    Al4 = 4,
    /// 8 CCEs
    Al8 = 8,
    /// 16 CCEs
    Al16 = 16,
}

impl AggregationLevel {
    /// All levels, lowest first
    pub const ALL: [AggregationLevel; 5] = [
        AggregationLevel::Al1,
        AggregationLevel::Al2,
        AggregationLevel::Al4,
        AggregationLevel::Al8,
        AggregationLevel::Al16,
    ];

    /// Number of CCEs for this level
    pub fn nof_cces(&self) -> u8 {
        *self as u8
    }
}

/// Tracking Area Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tac(pub u32);

/// PLMN Identity (MCC + MNC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlmnId {
    /// Mobile Country Code
    pub mcc: [u8; 3],
    /// Mobile Network Code (2 or 3 digits)
    pub mnc: [u8; 3],
    /// MNC length (2 or 3)
    pub mnc_len: u8,
}

impl PlmnId {
    /// Create a new PLMN ID
    pub fn new(mcc: [u8; 3], mnc: [u8; 3], mnc_len: u8) -> Option<Self> {
        if mnc_len == 2 || mnc_len == 3 {
            Some(Self { mcc, mnc, mnc_len })
        } else {
            None
        }
    }
}

/// S-NSSAI (Single Network Slice Selection Assistance Information)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SNssai {
    /// Slice/Service Type
    pub sst: u8,
    /// Slice Differentiator (optional)
    pub sd: Option<u32>,
}
