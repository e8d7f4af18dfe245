//! Cell, UE, and bearer configuration (§3 expansion), validated once at
//! `cell_cfg`/`ue_cfg` per the *Configuration inconsistency* rules of §7.

use crate::error::{Result, SchedError};
use crate::MAX_CARRIERS;

/// RBG size `P` (PRBs/group) as a function of cell bandwidth, TS 36.213
/// Table 7.1.6.1-1.
pub fn rbg_size(nof_prb: u32) -> u32 {
    match nof_prb {
        0..=10 => 1,
        11..=26 => 2,
        27..=63 => 3,
        _ => 4,
    }
}

/// One SIB's periodicity/window/length, used for SIB2 and above.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SibCfg {
    pub period_rf: u32,
    pub window_ms: u32,
    pub len: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PucchCfg {
    pub n_pucch_1: u32,
    pub n_pucch_sr: u32,
    pub n_pucch_cqi: u32,
}

/// Cell-wide configuration, validated as a unit by [`CellConfig::validate`].
#[derive(Clone, Debug)]
pub struct CellConfig {
    pub nof_prb: u32,
    pub nrb_pucch: u32,
    pub nof_prach_prb: u32,
    pub prach_offset: u32,
    pub si_window_ms: u32,
    pub sib1_period_rf: u32,
    pub sib1_len: u32,
    pub sibs: Vec<SibCfg>,
    pub pucch_cfg: PucchCfg,
    pub phich_duration_extended: bool,
    pub max_harq_msg3tx: u32,
    pub prach_rar_window: u32,
    pub max_aggr_level: u32,
}

impl CellConfig {
    pub fn nof_rbg(&self) -> u32 {
        crate::bitset::ceil_div(self.nof_prb, self.rbg_size())
    }

    pub fn rbg_size(&self) -> u32 {
        rbg_size(self.nof_prb)
    }

    /// Rejects configurations that would leave the scheduler with no legal
    /// allocation, per §4.12: Msg3 cannot fit beside the PUCCH edges, PRACH
    /// falls outside the cell bandwidth, or a SIB2+ window does not fit
    /// evenly in its period.
    pub fn validate(&self) -> Result<()> {
        if self.nrb_pucch * 2 + 3 > self.nof_prb {
            log::error!(
                "cell config rejected: nrb_pucch={} leaves no room for Msg3 on a {}-PRB cell",
                self.nrb_pucch,
                self.nof_prb
            );
            return Err(SchedError::InvalidCellConfig("nrb_pucch leaves no room for Msg3"));
        }
        if self.prach_offset + self.nof_prach_prb > self.nof_prb {
            log::error!(
                "cell config rejected: PRACH [{}, {}) outside {} PRBs",
                self.prach_offset,
                self.prach_offset + self.nof_prach_prb,
                self.nof_prb
            );
            return Err(SchedError::InvalidCellConfig("PRACH reservation outside cell bandwidth"));
        }
        for sib in &self.sibs {
            if sib.period_rf == 0 || sib.window_ms == 0 || sib.window_ms > sib.period_rf * 10 {
                log::error!("cell config rejected: SIB window {:?} does not fit its period", sib);
                return Err(SchedError::InvalidCellConfig("SIB2+ window does not fit its period"));
            }
        }
        if self.max_aggr_level == 0 {
            return Err(SchedError::InvalidCellConfig("max aggregation level must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Idle,
    Ul,
    Dl,
    Both,
}

impl Direction {
    pub fn has_dl(self) -> bool {
        matches!(self, Direction::Dl | Direction::Both)
    }

    pub fn has_ul(self) -> bool {
        matches!(self, Direction::Ul | Direction::Both)
    }
}

/// Per-bearer configuration (§3): priority, token-bucket parameters, and the
/// logical-channel group used for aggregated UL BSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BearerCfg {
    pub priority: u32,
    /// Prioritised Bit Rate in bytes/s, or `None` for an unthrottled channel.
    pub pbr: Option<u32>,
    pub bsd_ms: u32,
    pub lcg: u8,
    pub direction: Direction,
}

impl BearerCfg {
    pub fn is_infinite_pbr(&self) -> bool {
        self.pbr.is_none()
    }

    /// Bucket ceiling `PBR * BSD`, in bytes.
    pub fn bucket_ceiling(&self) -> u32 {
        match self.pbr {
            Some(pbr) => pbr.saturating_mul(self.bsd_ms) / 1000,
            None => u32::MAX,
        }
    }
}

/// Per-carrier UE configuration (MCS bounds, aggregation cap).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CarrierCfg {
    pub cc_idx: usize,
    pub active: bool,
    pub min_mcs: i32,
    pub max_mcs: i32,
    pub max_aggr_level: u32,
}

impl Default for CarrierCfg {
    fn default() -> Self {
        Self { cc_idx: 0, active: true, min_mcs: 0, max_mcs: 28, max_aggr_level: 8 }
    }
}

/// Per-UE configuration (§3).
#[derive(Clone, Debug)]
pub struct UeCfg {
    pub maintain_time_alignment: bool,
    pub use_tbs_index_alt: bool,
    pub carriers: heapless::Vec<CarrierCfg, MAX_CARRIERS>,
    pub pucch: PucchCfg,
    pub max_msg3_retx: u32,
}

impl UeCfg {
    pub fn pcell(&self) -> &CarrierCfg {
        &self.carriers[0]
    }
}
