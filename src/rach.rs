//! RACH/RAR/Msg3 scheduler (component J, spec.md §4.5).

use heapless::Vec as HVec;

use crate::tti::TtiPoint;
use crate::Rnti;

/// Preamble delay before the RAR window opens (spec.md §4.5: `tti_tx_dl >= prach_tti + 3`).
pub const RAR_DELAY_MS: u32 = 3;
/// PUSCH-for-Msg3 delay relative to the RAR's `tti_tx_dl` (spec.md §4.5).
pub const MSG3_DELAY_MS: u32 = 6;
/// PRBs reserved per Msg3 grant.
pub const MSG3_PRBS: u32 = 3;
/// Bytes per RAR subheader+body.
pub const RAR_GRANT_BYTES: u32 = 7;

/// One coalesced Msg3 grant inside a pending RAR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Msg3Grant {
    pub temp_crnti: Rnti,
    pub preamble_idx: u8,
    pub ta_cmd: u16,
    pub msg3_size: u32,
}

/// A coalesced pending RAR: `(ra_rnti, prach_tti, up to 8 Msg3 grants)`
/// (spec.md §3).
#[derive(Clone, Debug)]
pub struct PendingRar {
    pub ra_rnti: Rnti,
    pub prach_tti: TtiPoint,
    pub grants: HVec<Msg3Grant, 8>,
}

impl PendingRar {
    /// `ra_rnti = 1 + (prach_tti mod 10) + f_id`, `f_id = 0` for FDD (spec.md §4.5).
    pub fn compute_ra_rnti(prach_tti: TtiPoint, f_id: u32) -> Rnti {
        (1 + prach_tti.sf_idx() + f_id) as Rnti
    }

    pub fn pdu_bytes(&self) -> u32 {
        RAR_GRANT_BYTES * self.grants.len() as u32 + 1 // +1 backoff subheader
    }
}

/// FIFO queue of pending RARs, one per distinct `(ra_rnti, prach_tti)`.
#[derive(Clone, Debug, Default)]
pub struct RachScheduler {
    pending: Vec<PendingRar>,
}

impl RachScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a received preamble, coalescing onto an existing pending RAR
    /// for the same `(ra_rnti, prach_tti)` when one exists and has room.
    pub fn handle_preamble(&mut self, prach_tti: TtiPoint, grant: Msg3Grant) {
        let ra_rnti = PendingRar::compute_ra_rnti(prach_tti, 0);
        if let Some(rar) = self.pending.iter_mut().find(|r| r.ra_rnti == ra_rnti && r.prach_tti == prach_tti) {
            if rar.grants.push(grant).is_err() {
                log::warn!("rach: RAR for ra_rnti {:#06x} already has 8 Msg3 grants, dropping preamble", ra_rnti);
            }
            return;
        }
        let mut grants = HVec::new();
        let _ = grants.push(grant);
        self.pending.push(PendingRar { ra_rnti, prach_tti, grants });
    }

    /// Examines the head of the queue against `tti_tx_dl` per spec.md §4.5:
    /// deferred if too early, dropped if the window has passed, otherwise
    /// returned for allocation (with the caller retrying fewer grants on
    /// `RB_COLLISION`, per §4.5 — handled by the caller, not here).
    pub fn head_due(&self, tti_tx_dl: TtiPoint, rar_window_ms: u32) -> Option<RarDecision> {
        let rar = self.pending.first()?;
        let elapsed = tti_tx_dl.distance(rar.prach_tti);
        if elapsed < RAR_DELAY_MS as i32 {
            return Some(RarDecision::Defer);
        }
        if elapsed > (RAR_DELAY_MS + rar_window_ms) as i32 {
            return Some(RarDecision::Expired);
        }
        Some(RarDecision::Ready)
    }

    pub fn pop_head(&mut self) -> Option<PendingRar> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    pub fn drop_head(&mut self) {
        if !self.pending.is_empty() {
            log::info!("rach: RAR window exceeded, dropping pending RAR");
            self.pending.remove(0);
        }
    }

    pub fn requeue_front(&mut self, rar: PendingRar) {
        self.pending.insert(0, rar);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RarDecision {
    Defer,
    Ready,
    Expired,
}

/// Tracks the left-to-right accumulation of Msg3 PRBs within one subframe so
/// successive RAR grants do not overlap (spec.md §4.1/§4.5).
#[derive(Clone, Copy, Debug, Default)]
pub struct Msg3PrbCursor {
    next_prb: u32,
}

impl Msg3PrbCursor {
    pub fn new(start: u32) -> Self {
        Self { next_prb: start }
    }

    /// Reserves the next 3 PRBs for a Msg3 grant, failing if it would exceed
    /// `max_prb` (exclusive upper bound, e.g. the start of the upper PUCCH
    /// edge).
    pub fn reserve(&mut self, max_prb: u32) -> Option<u32> {
        if self.next_prb + MSG3_PRBS > max_prb {
            return None;
        }
        let start = self.next_prb;
        self.next_prb += MSG3_PRBS;
        Some(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(temp_crnti: Rnti) -> Msg3Grant {
        Msg3Grant { temp_crnti, preamble_idx: 5, ta_cmd: 3, msg3_size: 56 }
    }

    #[test]
    fn preambles_on_same_prach_tti_coalesce() {
        let mut s = RachScheduler::new();
        s.handle_preamble(TtiPoint::new(1), grant(0x46));
        s.handle_preamble(TtiPoint::new(1), grant(0x47));
        assert_eq!(s.pending.len(), 1);
        assert_eq!(s.pending[0].grants.len(), 2);
    }

    #[test]
    fn rar_is_deferred_before_window_opens() {
        let mut s = RachScheduler::new();
        s.handle_preamble(TtiPoint::new(1), grant(0x46));
        assert_eq!(s.head_due(TtiPoint::new(2), 10), Some(RarDecision::Defer));
    }

    #[test]
    fn rar_is_ready_inside_window() {
        let mut s = RachScheduler::new();
        s.handle_preamble(TtiPoint::new(1), grant(0x46));
        assert_eq!(s.head_due(TtiPoint::new(4), 10), Some(RarDecision::Ready));
    }

    #[test]
    fn rar_expires_past_window() {
        let mut s = RachScheduler::new();
        s.handle_preamble(TtiPoint::new(1), grant(0x46));
        assert_eq!(s.head_due(TtiPoint::new(20), 10), Some(RarDecision::Expired));
    }

    #[test]
    fn msg3_prbs_accumulate_left_to_right() {
        let mut cursor = Msg3PrbCursor::new(4);
        assert_eq!(cursor.reserve(25), Some(4));
        assert_eq!(cursor.reserve(25), Some(7));
        assert_eq!(cursor.reserve(10), None);
    }

    #[test]
    fn ra_rnti_formula_matches_spec() {
        assert_eq!(PendingRar::compute_ra_rnti(TtiPoint::new(21), 0), 1 + 1);
    }
}
