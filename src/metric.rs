//! Round-robin DL/UL scheduling metric (component K, spec.md §4.6), grounded
//! on `scheduler_metric.h`/`.cc`'s `dl_metric_rr`/`ul_metric_rr`.

use smallvec::SmallVec;

use crate::bitset::RbgMask;
use crate::dci::{AggrLevels, DciFormat, DlDataAlloc, DlDci, PduPart, UlDci};
use crate::grid::SfGrid;
use crate::mcs::{self, DL_MCS_TABLE, DL_MCS_TABLE_ALT, McsEntry, UL_MCS_TABLE};
use crate::pdcch::{AllocOutcome, DciAlloc};
use crate::tti::TtiPoint;
use crate::ue::{UeState, CE_CON_RES_ID, CE_SCELL_ACTIVATION, CE_TA_CMD};
use crate::Rnti;

type UeMap = hashbrown::HashMap<Rnti, UeState, ahash::RandomState>;

/// Picks a PDCCH aggregation level from a CQI report (coarser CQI needs more
/// protection), capped to the smallest legal level that still respects the
/// carrier's configured maximum.
fn aggr_for_cqi(cqi: u32, max_aggr_level: u32) -> AggrLevels {
    let wanted = if cqi >= 7 {
        1
    } else if cqi >= 4 {
        2
    } else if cqi >= 1 {
        4
    } else {
        8
    };
    let capped = wanted.max(1).min(max_aggr_level.max(1));
    for l in [1, 2, 4, 8] {
        if l >= capped {
            return AggrLevels::from_cces(l).expect("l is one of the legal aggregation levels");
        }
    }
    AggrLevels::L8
}

fn ce_payload_len(lcid: u8) -> u32 {
    match lcid {
        CE_CON_RES_ID => 6,
        CE_SCELL_ACTIVATION | CE_TA_CMD => 1,
        _ => 0,
    }
}

/// Smallest RBG count whose CQI-capped TBS covers `pending_bytes`, and the
/// full RBG budget as the upper bound (spec.md §4.6).
fn required_dl_rbgs(nof_rbg: u32, rbg_size: u32, cqi: u32, pending_bytes: u32, table: &[McsEntry; 29]) -> (u32, u32) {
    for rbgs in 1..=nof_rbg {
        let prbs = rbgs * rbg_size;
        if let Some((_, bytes)) = mcs::select_mcs_for_bytes(table, prbs, cqi, u32::MAX) {
            if bytes >= pending_bytes {
                return (rbgs, nof_rbg);
            }
        }
    }
    (nof_rbg.max(1), nof_rbg.max(1))
}

fn required_ul_prbs(pending_bytes: u32, cqi: u32, table: &[McsEntry; 29]) -> u32 {
    for l in 1..=crate::bitset::MAX_PRBS as u32 {
        if let Some((_, bytes)) = mcs::select_mcs_for_bytes(table, l, cqi, u32::MAX) {
            if bytes >= pending_bytes {
                return l;
            }
        }
    }
    crate::bitset::MAX_PRBS as u32
}

fn is_valid_ul_prb(l: u32) -> bool {
    let mut n = l;
    for p in [2, 3, 5] {
        while n % p == 0 {
            n /= p;
        }
    }
    n == 1
}

/// Finds up to `max_l` contiguous free UL PRBs, discarding any run that
/// started inside the first 3 PRBs and rounding the result down to a
/// SC-FDMA-valid width (mirrors `ul_metric_rr::find_allocation`).
fn find_ul_allocation(grid: &SfGrid, max_l: u32) -> Option<(u32, u32)> {
    let mask = grid.ul_mask();
    let mut rb_start = 0u32;
    let mut l = 0u32;
    for n in 0..mask.size() as u32 {
        if l >= max_l {
            break;
        }
        if !mask.test(n as usize) {
            if l == 0 {
                rb_start = n;
            }
            l += 1;
        } else if l > 0 {
            if n < 3 {
                rb_start = 0;
                l = 0;
            } else {
                break;
            }
        }
    }
    if l == 0 {
        return None;
    }
    while l > 1 && !is_valid_ul_prb(l) {
        l -= 1;
    }
    Some((rb_start, l))
}

/// Round-robin ordering of a UE map's RNTIs, rotated so the starting UE is
/// `offset mod n` (spec.md §4.6).
fn rotated_rntis(ue_db: &UeMap, offset: u32) -> SmallVec<[Rnti; 16]> {
    let mut rntis: SmallVec<[Rnti; 16]> = ue_db.keys().copied().collect();
    rntis.sort_unstable();
    let n = rntis.len();
    if n == 0 {
        return rntis;
    }
    let start = (offset as usize) % n;
    rntis.rotate_left(start);
    rntis
}

/// Downlink round-robin metric (component K).
#[derive(Clone, Copy, Debug, Default)]
pub struct DlMetricRr;

impl DlMetricRr {
    pub fn new() -> Self {
        Self
    }

    /// Finds the earliest contiguous run of free RBGs whose length is in
    /// `[min_nof_rbg, max_nof_rbg]`, capped at `max_nof_rbg` (mirrors
    /// `SfGrid::find_free_rbg_range`; never returns a non-contiguous mask).
    fn find_allocation(&self, min_nof_rbg: u32, max_nof_rbg: u32, grid: &SfGrid) -> Option<RbgMask> {
        let dl_mask = grid.dl_mask();
        let n = dl_mask.size();
        let min_nof_rbg = (min_nof_rbg.max(1) as usize).min(n.max(1));
        let max_nof_rbg = (max_nof_rbg as usize).max(min_nof_rbg);

        for start in 0..n {
            if dl_mask.test(start) {
                continue;
            }
            let mut end = start;
            while end < n && end - start < max_nof_rbg && !dl_mask.test(end) {
                end += 1;
            }
            if end - start >= min_nof_rbg {
                let mut mask = RbgMask::new(n);
                mask.fill(start, end, true);
                return Some(mask);
            }
        }
        None
    }

    /// Schedules DL (re)transmissions for every UE on `cc_idx`, rotating the
    /// round-robin start point by `tti_tx_dl` (spec.md §4.6).
    pub fn sched_users(&self, ue_db: &mut UeMap, cc_idx: usize, tti_tx_dl: TtiPoint, grid: &mut SfGrid) -> Vec<DlDataAlloc> {
        let mut out = Vec::new();
        let rntis = rotated_rntis(ue_db, tti_tx_dl.to_u32());
        for rnti in rntis {
            if let Some(ue) = ue_db.get_mut(&rnti) {
                if let Some(alloc) = self.allocate_user(ue, cc_idx, tti_tx_dl, grid) {
                    out.push(alloc);
                }
            }
        }
        out
    }

    fn allocate_user(&self, ue: &mut UeState, cc_idx: usize, tti_tx_dl: TtiPoint, grid: &mut SfGrid) -> Option<DlDataAlloc> {
        if cc_idx >= ue.carriers.len() || !ue.carriers[cc_idx].state().is_active() {
            return None;
        }
        let has_ce = !ue.pending_ces.is_empty();
        if !ue.carriers[cc_idx].dl_cqi_rx && !has_ce {
            // No CQI yet and nothing mandatory queued; ConRes/Msg4 UEs still
            // flow through this same path once dl_cqi_rx is set by the
            // fallback DCI-format-1A path upstream.
            return None;
        }
        let rnti = ue.rnti;
        let cqi = ue.carriers[cc_idx].dl_cqi;
        let max_aggr = ue.carriers[cc_idx].cfg.max_aggr_level;
        let aggr = aggr_for_cqi(cqi, max_aggr);

        if let Some(h) = ue.carriers[cc_idx].harq_ent.get_pending_retx_dl(0, tti_tx_dl) {
            let pid = h.id();
            let retx_mask = h.rbg_mask().clone();
            match grid.alloc_dl_data(rnti, &retx_mask, aggr) {
                Ok(dci) => return Some(self.finish_retx(ue, cc_idx, pid, tti_tx_dl, retx_mask, dci)),
                Err(AllocOutcome::DciCollision) => {
                    log::warn!("dl metric: no pdcch space for retx, rnti {rnti:#06x}");
                    return None;
                }
                Err(_) => {
                    let nof_rbg = retx_mask.count() as u32;
                    if nof_rbg > 0 {
                        if let Some(mask) = self.find_allocation(nof_rbg, nof_rbg, grid) {
                            match grid.alloc_dl_data(rnti, &mask, aggr) {
                                Ok(dci) => return Some(self.finish_retx(ue, cc_idx, pid, tti_tx_dl, mask, dci)),
                                Err(AllocOutcome::DciCollision) => {
                                    log::warn!("dl metric: no pdcch space for retx, rnti {rnti:#06x}");
                                    return None;
                                }
                                Err(_) => {} // fall through to a new-tx attempt on another process
                            }
                        }
                    }
                }
            }
        }

        if ue.carriers[cc_idx].harq_ent.get_empty_dl_harq().is_none() {
            return None;
        }
        let pending_bytes = ue.lch.dl_pending_bytes() + if has_ce { 6 } else { 0 };
        if pending_bytes == 0 {
            return None;
        }
        let table = if ue.cfg.use_tbs_index_alt { &DL_MCS_TABLE_ALT } else { &DL_MCS_TABLE };
        let rbg_size = grid.rbg_size();
        let (min_rbg, max_rbg) = required_dl_rbgs(grid.dl_mask().size() as u32, rbg_size, cqi, pending_bytes, table);
        let mask = self.find_allocation(min_rbg, max_rbg, grid)?;
        let nof_prb = mask.count() as u32 * rbg_size;
        match grid.alloc_dl_data(rnti, &mask, aggr) {
            Ok(dci) => Some(self.finish_newtx(ue, cc_idx, tti_tx_dl, mask, nof_prb, cqi, table, dci)),
            Err(AllocOutcome::DciCollision) => {
                log::warn!("dl metric: no pdcch space for new tx, rnti {rnti:#06x}");
                None
            }
            Err(_) => None,
        }
    }

    fn finish_retx(&self, ue: &mut UeState, cc_idx: usize, pid: u32, tti_tx_dl: TtiPoint, mask: RbgMask, dci: DciAlloc) -> DlDataAlloc {
        let rnti = ue.rnti;
        let h = ue.carriers[cc_idx].harq_ent.dl_harq_mut(pid as usize);
        h.new_retx(mask.clone(), 0, tti_tx_dl, dci.ncce);
        let dl_dci = DlDci {
            rnti,
            format: DciFormat::Format1,
            ncce: dci.ncce,
            aggr_level: dci.aggr_l,
            rbg_mask: mask,
            mcs: [-1, -1],
            rv: [h.rv(0), 0],
            ndi: [h.ndi(0), false],
            pid,
            tbs: [h.tbs_bytes(0), -1],
            ue_cc_idx: cc_idx,
        };
        DlDataAlloc { dci: dl_dci, pdu: Vec::new() }
    }

    fn finish_newtx(
        &self,
        ue: &mut UeState,
        cc_idx: usize,
        tti_tx_dl: TtiPoint,
        mask: RbgMask,
        nof_prb: u32,
        cqi: u32,
        table: &[McsEntry; 29],
        dci: DciAlloc,
    ) -> DlDataAlloc {
        let rnti = ue.rnti;
        let pending = ue.lch.dl_pending_bytes();
        let (mcs_idx, tbs_bytes) = mcs::select_mcs_for_bytes(table, nof_prb, cqi, pending.max(1)).unwrap_or((0, 0));

        let h = ue.carriers[cc_idx].harq_ent.get_empty_dl_harq().expect("checked non-empty before calling");
        let pid = h.id();
        h.new_tx(mask.clone(), 0, tti_tx_dl, mcs_idx as i32, tbs_bytes as i32, dci.ncce);
        let rv = h.rv(0);
        let ndi = h.ndi(0);

        let mut pdu = Vec::new();
        let mut remaining = tbs_bytes;
        while let Some(ce) = ue.peek_ce() {
            let nbytes = ce_payload_len(ce);
            if nbytes + 1 > remaining {
                break;
            }
            ue.pop_ce();
            pdu.push(PduPart { lcid: ce, nbytes });
            remaining -= nbytes + 1;
        }
        for (lcid, nbytes) in ue.lch.build_pdu(remaining) {
            pdu.push(PduPart { lcid, nbytes });
        }

        let dl_dci = DlDci {
            rnti,
            format: DciFormat::Format1,
            ncce: dci.ncce,
            aggr_level: dci.aggr_l,
            rbg_mask: mask,
            mcs: [mcs_idx as i32, -1],
            rv: [rv, 0],
            ndi: [ndi, false],
            pid,
            tbs: [tbs_bytes as i32, -1],
            ue_cc_idx: cc_idx,
        };
        DlDataAlloc { dci: dl_dci, pdu }
    }
}

/// Uplink round-robin metric (component K).
#[derive(Clone, Copy, Debug, Default)]
pub struct UlMetricRr;

impl UlMetricRr {
    pub fn new() -> Self {
        Self
    }

    /// Schedules UL (re)transmissions for every UE on `cc_idx`. Retxs are
    /// granted in a first pass, new transmissions in a second, with the
    /// round-robin start interleaved against the DL metric's (spec.md §4.6).
    pub fn sched_users(&self, ue_db: &mut UeMap, cc_idx: usize, tti_tx_ul: TtiPoint, grid: &mut SfGrid) -> Vec<UlDci> {
        let mut out = Vec::new();
        let n = ue_db.len() as u32;
        let offset = tti_tx_ul.to_u32().wrapping_add(n / 2);
        let rntis = rotated_rntis(ue_db, offset);

        for &rnti in &rntis {
            if let Some(ue) = ue_db.get_mut(&rnti) {
                if let Some(dci) = self.allocate_retx(ue, cc_idx, tti_tx_ul, grid) {
                    out.push(dci);
                }
            }
        }
        for &rnti in &rntis {
            if let Some(ue) = ue_db.get_mut(&rnti) {
                if let Some(dci) = self.allocate_newtx(ue, cc_idx, tti_tx_ul, grid) {
                    out.push(dci);
                }
            }
        }
        out
    }

    fn allocate_retx(&self, ue: &mut UeState, cc_idx: usize, tti_tx_ul: TtiPoint, grid: &mut SfGrid) -> Option<UlDci> {
        if cc_idx >= ue.carriers.len() || !ue.carriers[cc_idx].state().is_active() {
            return None;
        }
        let rnti = ue.rnti;
        let max_aggr = ue.carriers[cc_idx].cfg.max_aggr_level;
        let cqi = ue.carriers[cc_idx].ul_cqi;
        let aggr = aggr_for_cqi(cqi, max_aggr);

        let needs_retx = ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul).needs_retx();
        if !needs_retx {
            return None;
        }
        let (prev_start, prev_l) = ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul).alloc();

        // Same PRBs: non-adaptive, no PDCCH required.
        if let Ok(None) = grid.alloc_ul_data(rnti, prev_start, prev_l, false, aggr) {
            let h = ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul);
            h.new_retx(tti_tx_ul, prev_start, prev_l);
            return Some(build_ul_retx_dci(rnti, h, prev_start, prev_l, None));
        }

        // Different PRBs of the same width: adaptive retx, needs PDCCH.
        if let Some((rb_start, l)) = find_ul_allocation(grid, prev_l) {
            if l == prev_l {
                if let Ok(Some(dci)) = grid.alloc_ul_data(rnti, rb_start, l, true, aggr) {
                    let h = ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul);
                    h.new_retx(tti_tx_ul, rb_start, l);
                    return Some(build_ul_retx_dci(rnti, h, rb_start, l, Some(dci)));
                }
            }
        }
        None
    }

    fn allocate_newtx(&self, ue: &mut UeState, cc_idx: usize, tti_tx_ul: TtiPoint, grid: &mut SfGrid) -> Option<UlDci> {
        if cc_idx >= ue.carriers.len() || !ue.carriers[cc_idx].state().is_active() {
            return None;
        }
        let rnti = ue.rnti;
        let bsr = ue.lch.total_ul_bsr();
        let sr = ue.sr_pending;
        if bsr == 0 && !sr {
            return None;
        }
        if !ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul).is_empty() {
            return None;
        }
        let max_aggr = ue.carriers[cc_idx].cfg.max_aggr_level;
        let cqi = ue.carriers[cc_idx].ul_cqi;
        let aggr = aggr_for_cqi(cqi, max_aggr);

        if bsr > 0 {
            let wanted_prb = required_ul_prbs(bsr, cqi, &UL_MCS_TABLE);
            let (rb_start, l) = find_ul_allocation(grid, wanted_prb)?;
            if l == 0 {
                return None;
            }
            let (mcs_idx, tbs_bytes) = mcs::select_mcs_for_bytes(&UL_MCS_TABLE, l, cqi, bsr).unwrap_or((0, 0));
            let dci = match grid.alloc_ul_data(rnti, rb_start, l, true, aggr) {
                Ok(Some(d)) => d,
                _ => return None,
            };
            let h = ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul);
            h.new_tx(tti_tx_ul, mcs_idx as i32, tbs_bytes as i32, rb_start, l);
            return Some(UlDci {
                rnti,
                needs_pdcch: true,
                ncce: dci.ncce,
                aggr_level: dci.aggr_l,
                rb_start,
                l_prb: l,
                mcs: mcs_idx as i32,
                rv: h.rv(),
                ndi: h.ndi(),
                tbs: tbs_bytes as i32,
                cqi_request: false,
            });
        }

        // SR-only grant: up to 4 PRBs of UCI, no transport-block data.
        let (rb_start, l) = find_ul_allocation(grid, 4)?;
        if l == 0 {
            return None;
        }
        let dci = match grid.alloc_ul_data(rnti, rb_start, l, true, aggr) {
            Ok(Some(d)) => d,
            _ => return None,
        };
        let h = ue.carriers[cc_idx].harq_ent.get_ul_harq(tti_tx_ul);
        h.new_tx(tti_tx_ul, mcs::UCI_ONLY_MCS as i32, 0, rb_start, l);
        ue.sr_pending = false;
        Some(UlDci {
            rnti,
            needs_pdcch: true,
            ncce: dci.ncce,
            aggr_level: dci.aggr_l,
            rb_start,
            l_prb: l,
            mcs: mcs::UCI_ONLY_MCS as i32,
            rv: 0,
            ndi: h.ndi(),
            tbs: 0,
            cqi_request: true,
        })
    }
}

fn build_ul_retx_dci(rnti: Rnti, h: &crate::harq::UlHarqProc, rb_start: u32, l_prb: u32, dci: Option<DciAlloc>) -> UlDci {
    UlDci {
        rnti,
        needs_pdcch: dci.is_some(),
        ncce: dci.as_ref().map(|d| d.ncce).unwrap_or(0),
        aggr_level: dci.as_ref().map(|d| d.aggr_l).unwrap_or(0),
        rb_start,
        l_prb,
        mcs: mcs::non_adaptive_retx_mcs(h.rv()) as i32,
        rv: h.rv(),
        ndi: h.ndi(),
        tbs: h.tbs_bytes(),
        cqi_request: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CarrierCfg, PucchCfg, UeCfg};

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

    fn ue_db_with(rntis: &[Rnti]) -> UeMap {
        let mut db = UeMap::default();
        for &r in rntis {
            let mut ue = UeState::new(r, ue_cfg(), 7);
            ue.carriers[0].set_dl_cqi(TtiPoint::new(0), 10);
            ue.carriers[0].ul_cqi = 10;
            ue.lch.set_dl_buffer_state(3, 200, 0).unwrap();
            ue.lch.set_ul_bsr(0, 100).unwrap();
            db.insert(r, ue);
        }
        db
    }

    #[test]
    fn aggr_level_tightens_with_better_cqi() {
        assert_eq!(aggr_for_cqi(15, 8), AggrLevels::L1);
        assert_eq!(aggr_for_cqi(0, 8), AggrLevels::L8);
    }

    #[test]
    fn dl_metric_allocates_every_ue_with_cqi() {
        let mut db = ue_db_with(&[0x46, 0x47, 0x48]);
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        let metric = DlMetricRr::new();
        let allocs = metric.sched_users(&mut db, 0, TtiPoint::new(10), &mut grid);
        assert!(!allocs.is_empty());
        assert!(allocs.len() <= 3);
    }

    #[test]
    fn dl_metric_round_robin_rotates_start() {
        let db = ue_db_with(&[0x46, 0x47, 0x48]);
        let first = rotated_rntis(&db, 0);
        let second = rotated_rntis(&db, 1);
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn ul_metric_grants_newtx_for_ue_with_bsr() {
        let mut db = ue_db_with(&[0x46]);
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        let metric = UlMetricRr::new();
        let dcis = metric.sched_users(&mut db, 0, TtiPoint::new(10), &mut grid);
        assert_eq!(dcis.len(), 1);
        assert!(dcis[0].l_prb > 0);
    }

    #[test]
    fn ul_metric_sr_only_grant_uses_uci_mcs() {
        let mut db = ue_db_with(&[0x46]);
        db.get_mut(&0x46).unwrap().lch.set_ul_bsr(0, 0).unwrap();
        db.get_mut(&0x46).unwrap().sr_pending = true;
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        let metric = UlMetricRr::new();
        let dcis = metric.sched_users(&mut db, 0, TtiPoint::new(10), &mut grid);
        assert_eq!(dcis.len(), 1);
        assert_eq!(dcis[0].mcs, mcs::UCI_ONLY_MCS as i32);
        assert_eq!(dcis[0].tbs, 0);
    }

    #[test]
    fn valid_ul_prb_rejects_prime_widths() {
        assert!(is_valid_ul_prb(12));
        assert!(!is_valid_ul_prb(7));
        assert!(!is_valid_ul_prb(11));
    }
}
