//! Top-level FAPI-like scheduler facade (component L, spec.md §4.9),
//! grounded on `scheduler.h`/`scheduler.cc`'s `sched` class: one mutex-guarded
//! UE map plus a per-carrier broadcast/RACH scheduler, wrapping the grid and
//! metric components into `dl_sched`/`ul_sched`.

use std::sync::Mutex;

use heapless::Vec as HVec;

use crate::bcch::BcchScheduler;
use crate::bitset::PrbMask;
use crate::config::{BearerCfg, CellConfig, UeCfg};
use crate::dci::{AggrLevels, DlDataAlloc, PhichEntry, UlDci};
use crate::error::{Result, SchedError};
use crate::grid::{DlCtrlType, SfGrid};
use crate::metric::{DlMetricRr, UlMetricRr};
use crate::pdcch::DciAlloc;
use crate::rach::{Msg3Grant, Msg3PrbCursor, PendingRar, RachScheduler, RarDecision, MSG3_DELAY_MS, MSG3_PRBS};
use crate::tti::TtiPoint;
use crate::ue::UeState;
use crate::{Rnti, P_RNTI, SI_RNTI};

/// Size, in bytes, of a Msg3 RRCConnectionRequest SDU plus subheader: a fixed
/// stand-in, the actual size is carried by the upper layers, not the
/// scheduler (spec.md §4.5 Non-goals).
const MSG3_CCCH_BYTES: u32 = 7;
/// Common search-space aggregation level used for SIB/paging/RAR DCIs: the
/// robust, low end of the CQI-driven range used for UE-specific data
/// (spec.md §4.2).
const COMMON_AGGR: AggrLevels = AggrLevels::L4;

/// One broadcast (SIB) or paging DCI allocation.
#[derive(Clone, Debug)]
pub struct BcAlloc {
    pub dci: DciAlloc,
    pub sib_idx: Option<usize>,
    pub is_paging: bool,
    pub len: u32,
    pub rv: u32,
}

/// One RAR allocation: its PDCCH placement plus the coalesced Msg3 grants it carries.
#[derive(Clone, Debug)]
pub struct RarAlloc {
    pub dci: DciAlloc,
    pub ra_rnti: Rnti,
    pub grants: Vec<Msg3Grant>,
}

/// A Msg3 UL grant realized (embedded in a RAR two subframes earlier).
#[derive(Clone, Copy, Debug)]
pub struct Msg3UlAlloc {
    pub temp_crnti: Rnti,
    pub rb_start: u32,
    pub l_prb: u32,
}

/// Everything scheduled for one DL subframe on one carrier.
#[derive(Clone, Debug, Default)]
pub struct DlSchedResult {
    pub cfi: u32,
    pub bc: Vec<BcAlloc>,
    pub rar: Vec<RarAlloc>,
    pub data: Vec<DlDataAlloc>,
    pub phich: Vec<PhichEntry>,
}

/// Everything scheduled for one UL subframe on one carrier.
#[derive(Clone, Debug, Default)]
pub struct UlSchedResult {
    pub data: Vec<UlDci>,
    pub msg3: Vec<Msg3UlAlloc>,
}

type UeMap = hashbrown::HashMap<Rnti, UeState, ahash::RandomState>;

struct CarrierState {
    cell: CellConfig,
    bcch: BcchScheduler,
    rach: RachScheduler,
}

struct Inner {
    carriers: Vec<CarrierState>,
    ue_db: UeMap,
    pending_msg3: Vec<(TtiPoint, Msg3Grant)>,
    pending_paging: Vec<(TtiPoint, u32)>,
    dl_metric: DlMetricRr,
    ul_metric: UlMetricRr,
    last_tti: Option<TtiPoint>,
    configured: bool,
}

impl Inner {
    fn carrier(&self, cc_idx: usize) -> Result<&CarrierState> {
        self.carriers.get(cc_idx).ok_or(SchedError::InvalidCarrier(cc_idx))
    }

    fn carrier_mut(&mut self, cc_idx: usize) -> Result<&mut CarrierState> {
        self.carriers.get_mut(cc_idx).ok_or(SchedError::InvalidCarrier(cc_idx))
    }

    fn ue_mut(&mut self, rnti: Rnti) -> Result<&mut UeState> {
        self.ue_db.get_mut(&rnti).ok_or(SchedError::UnknownRnti(rnti))
    }

    /// Refills every UE's token buckets once per distinct TTI, regardless of
    /// how many carriers call in (spec.md §4.8).
    fn advance_tti(&mut self, tti: TtiPoint) {
        let is_new = match self.last_tti {
            Some(prev) => tti.distance(prev) > 0,
            None => true,
        };
        if is_new {
            for ue in self.ue_db.values_mut() {
                ue.tick();
            }
            self.last_tti = Some(tti);
        }
    }
}

/// The scheduler facade: thread-safe under one internal mutex, exposing the
/// FAPI-like surface of spec.md §4.9. Everything else in this crate is
/// reachable only through it.
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                carriers: Vec::new(),
                ue_db: UeMap::default(),
                pending_msg3: Vec::new(),
                pending_paging: Vec::new(),
                dl_metric: DlMetricRr::new(),
                ul_metric: UlMetricRr::new(),
                last_tti: None,
                configured: false,
            }),
        }
    }

    /// Validates and installs the per-carrier cell configuration. Carriers
    /// are matched to `cells` by index; carriers no longer present are
    /// dropped.
    pub fn cell_cfg(&self, cells: Vec<CellConfig>) -> Result<()> {
        for cell in &cells {
            cell.validate()?;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.carriers = cells
            .into_iter()
            .map(|cell| CarrierState { bcch: BcchScheduler::new(&cell), rach: RachScheduler::new(), cell })
            .collect();
        inner.configured = true;
        Ok(())
    }

    /// Adds a new UE or updates an existing one's configuration.
    pub fn ue_cfg(&self, rnti: Rnti, cfg: UeCfg) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let nof_rbgs = inner.carrier(0)?.cell.nof_rbg() as usize;
        match inner.ue_db.get_mut(&rnti) {
            Some(ue) => ue.cfg = cfg,
            None => {
                inner.ue_db.insert(rnti, UeState::new(rnti, cfg, nof_rbgs));
            }
        }
        Ok(())
    }

    pub fn ue_rem(&self, rnti: Rnti) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ue_db.remove(&rnti).ok_or(SchedError::UnknownRnti(rnti))?;
        Ok(())
    }

    pub fn ue_exists(&self, rnti: Rnti) -> bool {
        self.inner.lock().unwrap().ue_db.contains_key(&rnti)
    }

    pub fn bearer_ue_cfg(&self, rnti: Rnti, lcid: u8, cfg: BearerCfg) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.lch.configure(lcid, cfg)
    }

    pub fn dl_rlc_buffer_state(&self, rnti: Rnti, lcid: u8, tx_queue: u32, retx_queue: u32) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.lch.set_dl_buffer_state(lcid, tx_queue, retx_queue)
    }

    /// Queues a MAC control element for the next DL PDU built for this UE.
    pub fn mac_buffer_state(&self, rnti: Rnti, ce_lcid: u8) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.queue_ce(ce_lcid);
        Ok(())
    }

    pub fn ul_bsr(&self, rnti: Rnti, lcg: u8, bsr: u32) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.lch.set_ul_bsr(lcg, bsr)
    }

    pub fn ul_sr_info(&self, rnti: Rnti) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.sr_pending = true;
        Ok(())
    }

    pub fn ul_crc_info(&self, tti: u32, rnti: Rnti, cc_idx: usize, crc: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ue = inner.ue_mut(rnti)?;
        ue.carrier_mut(cc_idx)?.harq_ent.set_ul_crc(TtiPoint::new(tti), crc);
        Ok(())
    }

    pub fn dl_ack_info(&self, tti: u32, rnti: Rnti, cc_idx: usize, tb_idx: usize, ack: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ue = inner.ue_mut(rnti)?;
        let carrier = ue.carrier_mut(cc_idx)?;
        if let Some(h) = carrier.harq_ent.dl_harq_for_ack(TtiPoint::new(tti)) {
            h.set_ack(tb_idx, ack);
        }
        Ok(())
    }

    pub fn dl_ri_info(&self, rnti: Rnti, cc_idx: usize, ri: u32) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.carrier_mut(cc_idx)?.dl_ri = ri;
        Ok(())
    }

    pub fn dl_pmi_info(&self, rnti: Rnti, cc_idx: usize, pmi: u32) -> Result<()> {
        self.inner.lock().unwrap().ue_mut(rnti)?.carrier_mut(cc_idx)?.dl_pmi = pmi;
        Ok(())
    }

    pub fn dl_cqi_info(&self, tti: u32, rnti: Rnti, cc_idx: usize, cqi: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ue_mut(rnti)?.carrier_mut(cc_idx)?.set_dl_cqi(TtiPoint::new(tti), cqi);
        Ok(())
    }

    pub fn ul_cqi_info(&self, tti: u32, rnti: Rnti, cc_idx: usize, cqi: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let carrier = inner.ue_mut(rnti)?.carrier_mut(cc_idx)?;
        carrier.ul_cqi = cqi;
        carrier.ul_cqi_tti = TtiPoint::new(tti);
        Ok(())
    }

    /// Enqueues a received RACH preamble onto `cc_idx`'s RAR queue.
    pub fn dl_rach_info(&self, cc_idx: usize, prach_tti: u32, preamble_idx: u8, temp_crnti: Rnti) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let grant = Msg3Grant { temp_crnti, preamble_idx, ta_cmd: 0, msg3_size: MSG3_CCCH_BYTES };
        inner.carrier_mut(cc_idx)?.rach.handle_preamble(TtiPoint::new(prach_tti), grant);
        Ok(())
    }

    /// Queues a paging record of `payload_len` bytes for the next paging
    /// opportunity (spec.md §4.4).
    pub fn dl_paging_info(&self, cc_idx: usize, tti: u32, payload_len: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let _ = inner.carrier(cc_idx)?;
        inner.pending_paging.push((TtiPoint::new(tti), payload_len));
        Ok(())
    }

    /// Computes the DL scheduling decision for `tti_tx_dl` on `cc_idx`:
    /// broadcast/paging, then RAR, then UE data, in that priority order
    /// (spec.md §4.1/§4.9).
    pub fn dl_sched(&self, tti_tx_dl: u32, cc_idx: usize) -> Result<DlSchedResult> {
        let tti = TtiPoint::new(tti_tx_dl);
        let mut inner = self.inner.lock().unwrap();
        if !inner.configured {
            return Ok(DlSchedResult::default());
        }
        inner.advance_tti(tti);

        let cell = inner.carrier(cc_idx)?.cell.clone();
        let mut grid = SfGrid::new(cell.nof_prb, cell.nof_rbg() as usize, cell.rbg_size(), tti.sf_idx(), 3);

        let mut bc = Vec::new();
        let opportunities = inner.carrier_mut(cc_idx)?.bcch.due_at(tti, &cell);
        for op in opportunities {
            let len = if op.sib_idx == 0 { cell.sib1_len } else { cell.sibs[op.sib_idx - 1].len };
            match grid.alloc_dl_ctrl(COMMON_AGGR, DlCtrlType::Bc, Some(SI_RNTI), 1) {
                Ok(dci) => bc.push(BcAlloc { dci, sib_idx: Some(op.sib_idx), is_paging: false, len, rv: op.rv }),
                Err(e) => log::warn!("dl_sched: no room for sib {} ({e:?})", op.sib_idx),
            }
        }
        inner.pending_paging.retain(|&(due, len)| {
            if due != tti {
                return true;
            }
            match grid.alloc_dl_ctrl(COMMON_AGGR, DlCtrlType::Pcch, Some(P_RNTI), 1) {
                Ok(dci) => {
                    bc.push(BcAlloc { dci, sib_idx: None, is_paging: true, len, rv: 0 });
                    false
                }
                Err(e) => {
                    log::warn!("dl_sched: no room for paging record ({e:?})");
                    true
                }
            }
        });

        let mut rar = Vec::new();
        loop {
            let decision = match inner.carrier(cc_idx)?.rach.head_due(tti, cell.prach_rar_window) {
                Some(d) => d,
                None => break,
            };
            match decision {
                RarDecision::Defer => break,
                RarDecision::Expired => {
                    inner.carrier_mut(cc_idx)?.rach.drop_head();
                    continue;
                }
                RarDecision::Ready => {
                    let pending = inner.carrier_mut(cc_idx)?.rach.pop_head().expect("head_due confirmed non-empty");
                    let ra_rnti = pending.ra_rnti;
                    let prach_tti = pending.prach_tti;
                    let total_grants = pending.grants.len();

                    // Shrink the RAR one grant at a time until it fits, matching
                    // alloc_rar's retry loop: a RAR carrying fewer grants needs
                    // fewer RBGs (spec.md §4.5).
                    let mut allocated = None;
                    for nof_grants in (1..=total_grants).rev() {
                        match grid.alloc_dl_ctrl(COMMON_AGGR, DlCtrlType::Rar, Some(ra_rnti), nof_grants as u32) {
                            Ok(dci) => {
                                allocated = Some((dci, nof_grants));
                                break;
                            }
                            Err(_) => continue,
                        }
                    }

                    match allocated {
                        Some((dci, nof_grants)) => {
                            let mut grants: Vec<Msg3Grant> = pending.grants.into_iter().collect();
                            let remainder = grants.split_off(nof_grants);
                            let due = tti.add(MSG3_DELAY_MS);
                            for g in &grants {
                                inner.pending_msg3.push((due, *g));
                            }
                            rar.push(RarAlloc { dci, ra_rnti, grants });
                            if !remainder.is_empty() {
                                log::info!(
                                    "dl_sched: rar {:#06x} shrunk to {} grants, {} requeued",
                                    ra_rnti,
                                    nof_grants,
                                    remainder.len()
                                );
                                let mut requeued_grants = HVec::new();
                                for g in remainder {
                                    let _ = requeued_grants.push(g);
                                }
                                inner.carrier_mut(cc_idx)?.rach.requeue_front(PendingRar {
                                    ra_rnti,
                                    prach_tti,
                                    grants: requeued_grants,
                                });
                            }
                        }
                        None => {
                            log::warn!("dl_sched: no room for rar {:#06x} even at 1 grant", ra_rnti);
                            inner.carrier_mut(cc_idx)?.rach.requeue_front(pending);
                        }
                    }
                    break;
                }
            }
        }

        let data = {
            let Inner { dl_metric, ue_db, .. } = &mut *inner;
            dl_metric.sched_users(ue_db, cc_idx, tti, &mut grid)
        };

        let mut phich = Vec::new();
        let ack_feedback_tti = tti.sub(4);
        for ue in inner.ue_db.values_mut() {
            if cc_idx >= ue.carriers.len() {
                continue;
            }
            let rnti = ue.rnti;
            if let Some(ack) = ue.carriers[cc_idx].harq_ent.get_ul_harq(ack_feedback_tti).take_pending_ack() {
                phich.push(PhichEntry { rnti, ack });
            }
        }

        Ok(DlSchedResult { cfi: grid.pdcch.cfi(), bc, rar, data, phich })
    }

    /// Computes the UL scheduling decision for `tti_tx_ul` on `cc_idx`: any
    /// Msg3 grants due this subframe first, then UE retx/new-tx grants
    /// (spec.md §4.5/§4.6/§4.9).
    pub fn ul_sched(&self, tti_tx_ul: u32, cc_idx: usize) -> Result<UlSchedResult> {
        let tti = TtiPoint::new(tti_tx_ul);
        let mut inner = self.inner.lock().unwrap();
        if !inner.configured {
            return Ok(UlSchedResult::default());
        }

        let cell = inner.carrier(cc_idx)?.cell.clone();
        let mut grid = SfGrid::new(cell.nof_prb, cell.nof_rbg() as usize, cell.rbg_size(), tti.sf_idx(), 3);

        let mut msg3 = Vec::new();
        let mut cursor = Msg3PrbCursor::new(cell.nrb_pucch);
        let max_prb = cell.nof_prb.saturating_sub(cell.nrb_pucch);
        inner.pending_msg3.retain(|&(due, grant)| {
            if due != tti {
                return true;
            }
            match cursor.reserve(max_prb) {
                Some(rb_start) => {
                    let mut mask = PrbMask::new(grid.ul_mask().size());
                    mask.fill(rb_start as usize, (rb_start + MSG3_PRBS) as usize, true);
                    grid.reserve_ul_prbs(&mask, true);
                    msg3.push(Msg3UlAlloc { temp_crnti: grant.temp_crnti, rb_start, l_prb: MSG3_PRBS });
                    false
                }
                None => {
                    log::warn!("ul_sched: no prbs left for msg3 grant to {:#06x}", grant.temp_crnti);
                    false
                }
            }
        });

        let data = {
            let Inner { ul_metric, ue_db, .. } = &mut *inner;
            ul_metric.sched_users(ue_db, cc_idx, tti, &mut grid)
        };
        Ok(UlSchedResult { data, msg3 })
    }

    /// Discards nacked-but-abandoned HARQ processes across all UEs and
    /// carriers; intended to be called once per TTI after both `dl_sched`
    /// and `ul_sched` have run (spec.md §4.3).
    pub fn reset_pending_data(&self, tti_rx: u32) {
        let tti = TtiPoint::new(tti_rx);
        let mut inner = self.inner.lock().unwrap();
        for ue in inner.ue_db.values_mut() {
            for carrier in ue.carriers.iter_mut() {
                carrier.harq_ent.reset_pending_data(tti);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CarrierCfg, Direction, PucchCfg, SibCfg};

    fn cell() -> CellConfig {
        CellConfig {
            nof_prb: 25,
            nrb_pucch: 4,
            nof_prach_prb: 6,
            prach_offset: 2,
            si_window_ms: 20,
            sib1_period_rf: 8,
            sib1_len: 18,
            sibs: vec![SibCfg { period_rf: 16, window_ms: 20, len: 10 }],
            pucch_cfg: PucchCfg { n_pucch_1: 0, n_pucch_sr: 8, n_pucch_cqi: 16 },
            phich_duration_extended: false,
            max_harq_msg3tx: 4,
            prach_rar_window: 10,
            max_aggr_level: 8,
        }
    }

    fn ue_cfg() -> UeCfg {
        let mut carriers: heapless::Vec<CarrierCfg, { crate::MAX_CARRIERS }> = heapless::Vec::new();
        let _ = carriers.push(CarrierCfg::default());
        UeCfg {
            maintain_time_alignment: true,
            use_tbs_index_alt: false,
            carriers,
            pucch: PucchCfg { n_pucch_1: 0, n_pucch_sr: 8, n_pucch_cqi: 16 },
            max_msg3_retx: 4,
        }
    }

    #[test]
    fn sched_is_noop_before_cell_cfg() {
        let s = Scheduler::new();
        let res = s.dl_sched(0, 0).unwrap();
        assert!(res.bc.is_empty());
        assert!(res.data.is_empty());
    }

    #[test]
    fn dl_sched_allocates_sib1_on_schedule() {
        let s = Scheduler::new();
        s.cell_cfg(vec![cell()]).unwrap();
        let res = s.dl_sched(5, 0).unwrap();
        assert_eq!(res.bc.len(), 1);
        assert_eq!(res.bc[0].sib_idx, Some(0));
    }

    #[test]
    fn ue_cfg_then_dl_data_serves_buffered_bytes() {
        let s = Scheduler::new();
        s.cell_cfg(vec![cell()]).unwrap();
        s.ue_cfg(0x46, ue_cfg()).unwrap();
        s.bearer_ue_cfg(0x46, 3, BearerCfg { priority: 1, pbr: None, bsd_ms: 50, lcg: 0, direction: Direction::Both }).unwrap();
        s.dl_rlc_buffer_state(0x46, 3, 500, 0).unwrap();
        s.dl_cqi_info(0, 0x46, 0, 12).unwrap();
        let res = s.dl_sched(10, 0).unwrap();
        assert_eq!(res.data.len(), 1);
        assert_eq!(res.data[0].dci.rnti, 0x46);
    }

    #[test]
    fn rach_preamble_produces_rar_inside_window() {
        let s = Scheduler::new();
        s.cell_cfg(vec![cell()]).unwrap();
        s.dl_rach_info(0, 1, 5, 0x0050).unwrap();
        let res = s.dl_sched(4, 0).unwrap();
        assert_eq!(res.rar.len(), 1);
        assert_eq!(res.rar[0].grants[0].temp_crnti, 0x0050);
    }

    #[test]
    fn unknown_rnti_operations_return_errors() {
        let s = Scheduler::new();
        s.cell_cfg(vec![cell()]).unwrap();
        assert!(matches!(s.ul_bsr(0x46, 0, 10), Err(SchedError::UnknownRnti(0x46))));
    }

    #[test]
    fn ue_rem_then_exists_reports_false() {
        let s = Scheduler::new();
        s.cell_cfg(vec![cell()]).unwrap();
        s.ue_cfg(0x46, ue_cfg()).unwrap();
        assert!(s.ue_exists(0x46));
        s.ue_rem(0x46).unwrap();
        assert!(!s.ue_exists(0x46));
    }
}
