//! DL/UL HARQ process and HARQ entity (components C, D, §3/§4.3).

use crate::bitset::RbgMask;
use crate::dci::rv_for_retx;
use crate::tti::TtiPoint;
use crate::NOF_HARQ_PROCESSES;

/// A HARQ process whose last (re)transmission is older than this many TTIs
/// is considered abandoned and force-emptied by `reset_pending_data`.
const STALE_TTIS: i32 = 100;

/// TB-level HARQ state (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TbState {
    Empty,
    PendingAck,
    RetxPending,
}

#[derive(Clone, Copy, Debug)]
struct TransportBlock {
    state: TbState,
    ndi: bool,
    tx_count: u32,
    retx_count: u32,
    last_mcs: i32,
    last_tbs: i32,
}

impl Default for TransportBlock {
    fn default() -> Self {
        Self { state: TbState::Empty, ndi: false, tx_count: 0, retx_count: 0, last_mcs: -1, last_tbs: -1 }
    }
}

impl TransportBlock {
    fn is_empty(&self) -> bool {
        matches!(self.state, TbState::Empty)
    }

    fn rv(&self) -> u32 {
        rv_for_retx(self.retx_count)
    }
}

/// Outcome of [`DlHarqProc::set_ack`] / [`UlHarqProc::set_ack`]: which process
/// and how large a transport block was (n)acked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckOutcome {
    pub pid: u32,
    pub tbs: i32,
}

/// One DL HARQ process (up to two transport blocks, spatial multiplexing).
#[derive(Clone, Debug)]
pub struct DlHarqProc {
    id: u32,
    max_retx: u32,
    tbs: [TransportBlock; 2],
    tti: TtiPoint,
    rbg_mask: RbgMask,
    ncce: u32,
}

impl DlHarqProc {
    pub fn new(id: u32, max_retx: u32, nof_rbgs: usize) -> Self {
        Self {
            id,
            max_retx,
            tbs: [TransportBlock::default(), TransportBlock::default()],
            tti: TtiPoint::new(0),
            rbg_mask: RbgMask::new(nof_rbgs),
            ncce: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.tbs.iter().all(|tb| tb.is_empty())
    }

    pub fn is_empty_tb(&self, tb_idx: usize) -> bool {
        self.tbs[tb_idx].is_empty()
    }

    pub fn tti(&self) -> TtiPoint {
        self.tti
    }

    pub fn rbg_mask(&self) -> &RbgMask {
        &self.rbg_mask
    }

    pub fn ncce(&self) -> u32 {
        self.ncce
    }

    pub fn rv(&self, tb_idx: usize) -> u32 {
        self.tbs[tb_idx].rv()
    }

    pub fn ndi(&self, tb_idx: usize) -> bool {
        self.tbs[tb_idx].ndi
    }

    pub fn tbs_bytes(&self, tb_idx: usize) -> i32 {
        self.tbs[tb_idx].last_tbs
    }

    /// A process is eligible for retransmission once its ACK TTI has passed:
    /// `tti_tx_dl >= self.tti + 8` (property 4).
    pub fn has_pending_retx(&self, tb_idx: usize, tti_tx_dl: TtiPoint) -> bool {
        matches!(self.tbs[tb_idx].state, TbState::RetxPending) && tti_tx_dl.distance(self.tti) >= 8
    }

    pub fn new_tx(&mut self, mask: RbgMask, tb_idx: usize, tti: TtiPoint, mcs: i32, tbs: i32, ncce: u32) {
        let tb = &mut self.tbs[tb_idx];
        tb.ndi = !tb.ndi;
        tb.tx_count += 1;
        tb.retx_count = 0;
        tb.last_mcs = mcs;
        tb.last_tbs = tbs;
        tb.state = TbState::PendingAck;
        self.rbg_mask = mask;
        self.tti = tti;
        self.ncce = ncce;
    }

    pub fn new_retx(&mut self, mask: RbgMask, tb_idx: usize, tti: TtiPoint, ncce: u32) {
        let tb = &mut self.tbs[tb_idx];
        tb.tx_count += 1;
        tb.retx_count += 1;
        tb.state = TbState::PendingAck;
        self.rbg_mask = mask;
        self.tti = tti;
        self.ncce = ncce;
    }

    /// Applies an ACK/NACK received for `tb_idx`. On the `max_retx`-th NACK
    /// the process is forcibly emptied (spec.md §3 invariant) and a warning
    /// logged.
    pub fn set_ack(&mut self, tb_idx: usize, ack: bool) -> Option<AckOutcome> {
        let tb = &mut self.tbs[tb_idx];
        if tb.is_empty() {
            log::warn!("dl harq {}: ack for empty tb {}", self.id, tb_idx);
            return None;
        }
        let outcome = AckOutcome { pid: self.id, tbs: tb.last_tbs };
        if ack {
            *tb = TransportBlock::default();
        } else if tb.retx_count >= self.max_retx {
            log::warn!("dl harq {}: max retx ({}) reached, emptying process", self.id, self.max_retx);
            *tb = TransportBlock::default();
        } else {
            tb.state = TbState::RetxPending;
        }
        Some(outcome)
    }

    /// Abandoned processes whose last transmission is more than `STALE_TTIS`
    /// old are force-emptied so a stuck HARQ process doesn't block new
    /// transmissions forever.
    pub fn reset_pending_data(&mut self, tti_rx: TtiPoint) {
        let stale = tti_rx.distance(self.tti) > STALE_TTIS;
        if !stale {
            return;
        }
        for tb in self.tbs.iter_mut() {
            if !tb.is_empty() {
                *tb = TransportBlock::default();
            }
        }
    }
}

/// One UL HARQ process (single transport block, synchronous 8 ms round trip).
#[derive(Clone, Debug)]
pub struct UlHarqProc {
    id: u32,
    max_retx: u32,
    tb: TransportBlock,
    tti: TtiPoint,
    rb_start: u32,
    l_prb: u32,
    is_adaptive: bool,
    pending_ack: Option<bool>,
}

impl UlHarqProc {
    pub fn new(id: u32, max_retx: u32) -> Self {
        Self {
            id,
            max_retx,
            tb: TransportBlock::default(),
            tti: TtiPoint::new(0),
            rb_start: 0,
            l_prb: 0,
            is_adaptive: false,
            pending_ack: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.tb.is_empty()
    }

    pub fn tti(&self) -> TtiPoint {
        self.tti
    }

    pub fn alloc(&self) -> (u32, u32) {
        (self.rb_start, self.l_prb)
    }

    pub fn is_adaptive_retx(&self) -> bool {
        self.is_adaptive
    }

    pub fn rv(&self) -> u32 {
        self.tb.rv()
    }

    pub fn ndi(&self) -> bool {
        self.tb.ndi
    }

    pub fn tbs_bytes(&self) -> i32 {
        self.tb.last_tbs
    }

    /// True once a CRC failure has parked this process waiting for its
    /// synchronous retx slot (spec.md §4.3).
    pub fn needs_retx(&self) -> bool {
        matches!(self.tb.state, TbState::RetxPending)
    }

    pub fn has_pending_ack(&self) -> bool {
        self.pending_ack.is_some()
    }

    pub fn take_pending_ack(&mut self) -> Option<bool> {
        self.pending_ack.take()
    }

    pub fn new_tx(&mut self, tti: TtiPoint, mcs: i32, tbs: i32, rb_start: u32, l_prb: u32) {
        self.tb.ndi = !self.tb.ndi;
        self.tb.tx_count += 1;
        self.tb.retx_count = 0;
        self.tb.last_mcs = mcs;
        self.tb.last_tbs = tbs;
        self.tb.state = TbState::PendingAck;
        self.tti = tti;
        self.rb_start = rb_start;
        self.l_prb = l_prb;
        self.is_adaptive = false;
    }

    /// A CRC failure at `tti_rx` schedules a retx at `tti_rx + 8` on this same
    /// process (spec.md §4.3). `adaptive` is set when the caller chose PRBs
    /// different from the previous transmission.
    pub fn new_retx(&mut self, tti: TtiPoint, rb_start: u32, l_prb: u32) {
        self.tb.tx_count += 1;
        self.tb.retx_count += 1;
        self.tb.state = TbState::PendingAck;
        self.is_adaptive = rb_start != self.rb_start || l_prb != self.l_prb;
        self.tti = tti;
        self.rb_start = rb_start;
        self.l_prb = l_prb;
    }

    /// Applies CRC result; returns whether the process needs a retx and sets
    /// the PHICH ack/nack pending for the following TTI.
    pub fn set_crc(&mut self, ok: bool) -> Option<AckOutcome> {
        if self.tb.is_empty() {
            log::warn!("ul harq {}: crc for empty process", self.id);
            return None;
        }
        self.pending_ack = Some(ok);
        let outcome = AckOutcome { pid: self.id, tbs: self.tb.last_tbs };
        if ok {
            self.tb = TransportBlock::default();
        } else if self.tb.retx_count >= self.max_retx {
            log::warn!("ul harq {}: max retx ({}) reached, emptying process", self.id, self.max_retx);
            self.tb = TransportBlock::default();
        } else {
            self.tb.state = TbState::RetxPending;
        }
        Some(outcome)
    }

    /// Clears a PHICH ack that was never consumed (e.g. the UE was removed
    /// before its next PHICH opportunity) and abandons stuck processes the
    /// same way [`DlHarqProc::reset_pending_data`] does.
    pub fn reset_pending_data(&mut self, tti_rx: TtiPoint) {
        let stale = tti_rx.distance(self.tti) > STALE_TTIS;
        if !stale {
            return;
        }
        self.pending_ack = None;
        if !self.tb.is_empty() {
            self.tb = TransportBlock::default();
        }
    }
}

/// The 8 DL + 8 UL HARQ processes belonging to one UE on one carrier.
#[derive(Clone, Debug)]
pub struct HarqEntity {
    dl: Vec<DlHarqProc>,
    ul: Vec<UlHarqProc>,
}

impl HarqEntity {
    pub fn new(max_retx_dl: u32, max_retx_ul: u32, nof_rbgs: usize) -> Self {
        let dl = (0..NOF_HARQ_PROCESSES as u32).map(|id| DlHarqProc::new(id, max_retx_dl, nof_rbgs)).collect();
        let ul = (0..NOF_HARQ_PROCESSES as u32).map(|id| UlHarqProc::new(id, max_retx_ul)).collect();
        Self { dl, ul }
    }

    /// Async DL HARQ (spec.md §9 Open Question): any empty process may serve
    /// a new transmission.
    pub fn get_empty_dl_harq(&mut self) -> Option<&mut DlHarqProc> {
        self.dl.iter_mut().find(|h| h.is_empty())
    }

    /// Oldest retx-eligible process, preferred over a new tx (spec.md §4.3).
    pub fn get_pending_retx_dl(&mut self, tb_idx: usize, tti_tx_dl: TtiPoint) -> Option<&mut DlHarqProc> {
        self.dl
            .iter_mut()
            .filter(|h| h.has_pending_retx(tb_idx, tti_tx_dl))
            .min_by_key(|h| h.tti().to_u32())
    }

    pub fn set_dl_ack(&mut self, pid: usize, tb_idx: usize, ack: bool) -> Option<AckOutcome> {
        self.dl.get_mut(pid)?.set_ack(tb_idx, ack)
    }

    /// Finds the DL HARQ process an ACK/NACK received at `tti_ack` belongs to
    /// (async DL HARQ has no fixed pid-from-tti mapping, so this matches on
    /// the synchronous 8 ms round trip instead, property 4).
    pub fn dl_harq_for_ack(&mut self, tti_ack: TtiPoint) -> Option<&mut DlHarqProc> {
        self.dl.iter_mut().find(|h| !h.is_empty() && tti_ack.distance(h.tti()) == 8)
    }

    pub fn dl_harq(&self, pid: usize) -> &DlHarqProc {
        &self.dl[pid]
    }

    pub fn dl_harq_mut(&mut self, pid: usize) -> &mut DlHarqProc {
        &mut self.dl[pid]
    }

    /// UL process index is fixed by the synchronous round trip: `tti_tx_ul mod 8`.
    pub fn get_ul_harq(&mut self, tti_tx_ul: TtiPoint) -> &mut UlHarqProc {
        let idx = (tti_tx_ul.to_u32() as usize) % NOF_HARQ_PROCESSES;
        &mut self.ul[idx]
    }

    pub fn set_ul_crc(&mut self, tti_tx_ul: TtiPoint, ok: bool) -> Option<AckOutcome> {
        self.get_ul_harq(tti_tx_ul).set_crc(ok)
    }

    /// Discards abandoned (nacked-but-never-retried) processes; called once
    /// per TTI per carrier.
    pub fn reset_pending_data(&mut self, tti_rx: TtiPoint) {
        for h in self.dl.iter_mut() {
            h.reset_pending_data(tti_rx);
        }
        for h in self.ul.iter_mut() {
            h.reset_pending_data(tti_rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tx_flips_ndi_and_marks_pending_ack() {
        let mut h = DlHarqProc::new(0, 3, 25);
        assert!(h.is_empty());
        h.new_tx(RbgMask::new(25), 0, TtiPoint::new(10), 5, 1000, 3);
        assert!(!h.is_empty());
        assert!(h.ndi(0));
    }

    #[test]
    fn retx_not_eligible_before_eight_ttis() {
        let mut h = DlHarqProc::new(0, 3, 25);
        h.new_tx(RbgMask::new(25), 0, TtiPoint::new(10), 5, 1000, 3);
        h.set_ack(0, false);
        assert!(!h.has_pending_retx(0, TtiPoint::new(15)));
        assert!(h.has_pending_retx(0, TtiPoint::new(18)));
    }

    #[test]
    fn max_retx_empties_process() {
        let mut h = DlHarqProc::new(0, 2, 25);
        h.new_tx(RbgMask::new(25), 0, TtiPoint::new(0), 5, 1000, 3);
        h.set_ack(0, false); // retx_count 0 -> RetxPending
        h.new_retx(RbgMask::new(25), 0, TtiPoint::new(8), 3); // retx_count 1
        h.set_ack(0, false); // retx_count 1 == max_retx(2)? no -> still retx pending
        h.new_retx(RbgMask::new(25), 0, TtiPoint::new(16), 3); // retx_count 2
        h.set_ack(0, false); // retx_count(2) >= max_retx(2) -> emptied
        assert!(h.is_empty_tb(0));
    }

    #[test]
    fn ack_on_empty_process_logs_and_returns_none() {
        let mut h = DlHarqProc::new(0, 3, 25);
        assert!(h.set_ack(0, true).is_none());
    }

    #[test]
    fn ul_harq_index_is_tti_mod_eight() {
        let mut e = HarqEntity::new(3, 4, 25);
        let a = e.get_ul_harq(TtiPoint::new(9)).id();
        let b = e.get_ul_harq(TtiPoint::new(1)).id();
        assert_eq!(a, b);
    }

    #[test]
    fn ul_retx_to_same_prbs_is_non_adaptive() {
        let mut h = UlHarqProc::new(0, 4);
        h.new_tx(TtiPoint::new(10), 10, 500, 2, 6);
        h.set_crc(false);
        h.new_retx(TtiPoint::new(18), 2, 6);
        assert!(!h.is_adaptive_retx());
    }

    #[test]
    fn ul_retx_to_different_prbs_is_adaptive() {
        let mut h = UlHarqProc::new(0, 4);
        h.new_tx(TtiPoint::new(10), 10, 500, 2, 6);
        h.set_crc(false);
        h.new_retx(TtiPoint::new(18), 5, 6);
        assert!(h.is_adaptive_retx());
    }

    #[test]
    fn empty_entity_has_free_dl_harq() {
        let mut e = HarqEntity::new(3, 4, 25);
        assert!(e.get_empty_dl_harq().is_some());
    }

    #[test]
    fn reset_pending_data_abandons_stale_process() {
        let mut h = DlHarqProc::new(0, 4, 25);
        h.new_tx(RbgMask::new(25), 0, TtiPoint::new(0), 5, 1000, 3);
        h.reset_pending_data(TtiPoint::new(50));
        assert!(!h.is_empty_tb(0), "not stale yet");
        h.reset_pending_data(TtiPoint::new(200));
        assert!(h.is_empty_tb(0), "abandoned once stale");
    }

    #[test]
    fn reset_pending_data_clears_unconsumed_pending_ack() {
        let mut h = UlHarqProc::new(0, 4);
        h.new_tx(TtiPoint::new(0), 10, 500, 2, 6);
        h.set_crc(false);
        assert!(h.has_pending_ack());
        h.reset_pending_data(TtiPoint::new(200));
        assert!(!h.has_pending_ack());
    }
}
