//! Per-UE and per-UE-per-carrier state, including the SCell activation FSM
//! (component F, spec.md §3/§4.7).

use heapless::Vec as HVec;

use crate::config::{CarrierCfg, UeCfg};
use crate::error::{Result, SchedError};
use crate::harq::HarqEntity;
use crate::lchan::LchanManager;
use crate::tti::TtiPoint;
use crate::{Rnti, MAX_CARRIERS};

/// Secondary-cell activation state (spec.md §4.7). The primary cell is
/// always `Active`. A tagged enum replaces the CRTP state-machine template
/// style of the original implementation (spec.md §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcState {
    Idle,
    Activating,
    Active,
    Deactivating,
}

impl CcState {
    pub fn is_active(self) -> bool {
        matches!(self, CcState::Active)
    }
}

/// Control-element LCID codes queued into a UE's pending-CE list.
pub const CE_SCELL_ACTIVATION: u8 = 27;
pub const CE_CON_RES_ID: u8 = 28;
pub const CE_TA_CMD: u8 = 29;

/// Per-UE per-carrier state: CQI/RI/PMI, MCS bounds, HARQ entity, activation FSM.
#[derive(Clone, Debug)]
pub struct UeCarrierState {
    pub cc_idx: usize,
    pub cfg: CarrierCfg,
    pub harq_ent: HarqEntity,
    pub dl_cqi: u32,
    pub dl_cqi_tti: TtiPoint,
    pub dl_cqi_rx: bool,
    pub dl_ri: u32,
    pub dl_pmi: u32,
    pub ul_cqi: u32,
    pub ul_cqi_tti: TtiPoint,
    state: CcState,
}

impl UeCarrierState {
    pub fn new(cfg: CarrierCfg, nof_rbgs: usize) -> Self {
        let state = if cfg.cc_idx == 0 {
            CcState::Active
        } else if cfg.active {
            CcState::Activating
        } else {
            CcState::Idle
        };
        Self {
            cc_idx: cfg.cc_idx,
            cfg,
            harq_ent: HarqEntity::new(3, 4, nof_rbgs),
            dl_cqi: 1,
            dl_cqi_tti: TtiPoint::new(0),
            dl_cqi_rx: false,
            dl_ri: 0,
            dl_pmi: 0,
            ul_cqi: 1,
            ul_cqi_tti: TtiPoint::new(0),
            state,
        }
    }

    pub fn state(&self) -> CcState {
        self.state
    }

    /// `Activating -> Active` fires on the first positive DL CQI report for
    /// this carrier (spec.md §4.7).
    pub fn set_dl_cqi(&mut self, tti: TtiPoint, cqi: u32) {
        self.dl_cqi = cqi;
        self.dl_cqi_tti = tti;
        self.dl_cqi_rx = true;
        if self.state == CcState::Activating && cqi >= 1 {
            self.state = CcState::Active;
        }
    }

    /// RRC marks the carrier active/inactive; transitions `Idle -> Activating`
    /// or `Active -> Deactivating`. Deactivation completes (`-> Idle`) once
    /// `finish_deactivation` is called after all outstanding ACKs return.
    /// Returns `true` on either transition, telling the caller to queue a
    /// SCell Activation MAC CE (spec.md §4.7).
    pub fn set_rrc_active(&mut self, active: bool) -> bool {
        match (self.state, active) {
            (CcState::Idle, true) => {
                self.state = CcState::Activating;
                true
            }
            (CcState::Active, false) => {
                self.state = CcState::Deactivating;
                true
            }
            _ => false,
        }
    }

    pub fn finish_deactivation(&mut self) {
        if self.state == CcState::Deactivating {
            self.state = CcState::Idle;
        }
    }
}

/// Per-UE state (spec.md §3): RNTI, per-carrier states, logical-channel
/// manager, SR/CE/PHR bookkeeping.
#[derive(Clone, Debug)]
pub struct UeState {
    pub rnti: Rnti,
    pub cfg: UeCfg,
    pub carriers: Vec<UeCarrierState>,
    pub lch: LchanManager,
    pub sr_pending: bool,
    pub pending_ces: HVec<u8, 8>,
    pub power_headroom: i32,
    pub tpc_pusch: i32,
    pub tpc_pucch: i32,
    pub max_msg3_retx: u32,
}

impl UeState {
    pub fn new(rnti: Rnti, cfg: UeCfg, nof_rbgs: usize) -> Self {
        let carriers: Vec<UeCarrierState> = cfg.carriers.iter().map(|c| UeCarrierState::new(*c, nof_rbgs)).collect();
        let max_msg3_retx = cfg.max_msg3_retx;
        let scell_activating = carriers.iter().any(|c| matches!(c.state(), CcState::Activating | CcState::Deactivating));
        let mut ue = Self {
            rnti,
            cfg,
            carriers,
            lch: LchanManager::new(),
            sr_pending: false,
            pending_ces: HVec::new(),
            power_headroom: 0,
            tpc_pusch: 0,
            tpc_pucch: 0,
            max_msg3_retx,
        };
        if scell_activating {
            ue.queue_ce(CE_SCELL_ACTIVATION);
        }
        ue
    }

    /// RRC-driven SCell activate/deactivate; queues the SCell Activation MAC
    /// CE when the carrier's state actually transitions (spec.md §4.7).
    pub fn set_carrier_active(&mut self, cc_idx: usize, active: bool) -> Result<()> {
        let transitioned = self.carrier_mut(cc_idx)?.set_rrc_active(active);
        if transitioned {
            self.queue_ce(CE_SCELL_ACTIVATION);
        }
        Ok(())
    }

    /// Creates a rach-only UE with SRB0 active, as newly admitted UEs are
    /// constructed before RRC reconfiguration (spec.md §3 lifecycle).
    pub fn new_from_rach(rnti: Rnti, nof_rbgs: usize) -> Self {
        let cfg = UeCfg {
            maintain_time_alignment: true,
            use_tbs_index_alt: false,
            carriers: {
                let mut v: HVec<CarrierCfg, MAX_CARRIERS> = HVec::new();
                let _ = v.push(CarrierCfg::default());
                v
            },
            pucch: crate::config::PucchCfg { n_pucch_1: 0, n_pucch_sr: 0, n_pucch_cqi: 0 },
            max_msg3_retx: 4,
        };
        let mut ue = Self::new(rnti, cfg, nof_rbgs);
        ue.queue_ce(CE_CON_RES_ID);
        ue
    }

    pub fn carrier(&self, cc_idx: usize) -> Result<&UeCarrierState> {
        self.carriers.get(cc_idx).ok_or(SchedError::InvalidCarrier(cc_idx))
    }

    pub fn carrier_mut(&mut self, cc_idx: usize) -> Result<&mut UeCarrierState> {
        self.carriers.get_mut(cc_idx).ok_or(SchedError::InvalidCarrier(cc_idx))
    }

    pub fn pcell(&self) -> &UeCarrierState {
        &self.carriers[0]
    }

    /// Queues a MAC control element, front-inserting ConRes-ID (spec.md §3:
    /// "ConRes-ID is inserted at the front when queued").
    pub fn queue_ce(&mut self, lcid: u8) {
        if self.pending_ces.iter().any(|&c| c == lcid) {
            return;
        }
        if lcid == CE_CON_RES_ID {
            let mut reordered: HVec<u8, 8> = HVec::new();
            let _ = reordered.push(lcid);
            for &c in self.pending_ces.iter() {
                if reordered.push(c).is_err() {
                    log::warn!("rnti {:#06x}: pending CE queue full, dropping CE {}", self.rnti, c);
                    break;
                }
            }
            self.pending_ces = reordered;
        } else if self.pending_ces.push(lcid).is_err() {
            log::warn!("rnti {:#06x}: pending CE queue full, dropping CE {}", self.rnti, lcid);
        }
    }

    pub fn pop_ce(&mut self) -> Option<u8> {
        if self.pending_ces.is_empty() {
            None
        } else {
            Some(self.pending_ces.remove(0))
        }
    }

    /// Looks at the next queued CE without consuming it, so a caller can
    /// check whether it fits the remaining PDU budget before committing.
    pub fn peek_ce(&self) -> Option<u8> {
        self.pending_ces.first().copied()
    }

    pub fn tick(&mut self) {
        self.lch.tick();
    }
}
