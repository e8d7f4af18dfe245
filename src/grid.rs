//! Subframe resource grid: DL RBG mask + UL PRB mask + PDCCH allocator per
//! TTI (component H, spec.md §4.1).

use smallvec::SmallVec;

use crate::bitset::{ceil_div, PrbMask, RbgMask};
use crate::dci::AggrLevels;
use crate::pdcch::{AllocOutcome, DciAlloc, PdcchAllocator};
use crate::Rnti;

/// Fixed allocation sizes for broadcast/paging/RAR control DCIs, expressed
/// in RBGs for an RBG size `p` (spec.md §4.1).
pub fn bc_pcch_nof_rbg(p: u32) -> u32 {
    ceil_div(4, p)
}

/// RAR PDU size grows with the number of coalesced Msg3 grants it carries;
/// 3 PRBs cover up to 4 grants, +3 PRBs for each additional 4 (spec.md §4.5,
/// `PendingRar::pdu_bytes`). A caller that fails to allocate the full count
/// retries with fewer grants before giving up.
pub fn rar_nof_rbg(p: u32, nof_grants: u32) -> u32 {
    let prb_budget = 3 + 3 * (nof_grants.saturating_sub(1) / 4);
    ceil_div(prb_budget, p)
}

/// Type of DL control allocation for [`SfGrid::alloc_dl_ctrl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DlCtrlType {
    Bc,
    Pcch,
    Rar,
}

/// Per-TTI scratch: the DL RBG mask, UL PRB mask, and PDCCH allocator for
/// one carrier. Constructed fresh at the top of `dl_sched`/`ul_sched` and
/// dropped on return (spec.md §9 "Scoped resources for TTI").
#[derive(Clone, Debug)]
pub struct SfGrid {
    rbg_size: u32,
    dl_mask: RbgMask,
    ul_mask: PrbMask,
    pub pdcch: PdcchAllocator,
    next_free_rbg: usize,
}

impl SfGrid {
    pub fn new(nof_prb: u32, nof_rbgs: usize, rbg_size: u32, sf_idx: u32, max_cfi: u32) -> Self {
        Self {
            rbg_size,
            dl_mask: RbgMask::new(nof_rbgs),
            ul_mask: PrbMask::new(nof_prb as usize),
            pdcch: PdcchAllocator::new(nof_prb, sf_idx, max_cfi),
            next_free_rbg: 0,
        }
    }

    pub fn dl_mask(&self) -> &RbgMask {
        &self.dl_mask
    }

    pub fn rbg_size(&self) -> u32 {
        self.rbg_size
    }

    pub fn ul_mask(&self) -> &PrbMask {
        &self.ul_mask
    }

    /// Reserves `[start, end)` DL RBGs, failing if any bit is already set.
    pub fn reserve_dl_rbgs(&mut self, start: usize, end: usize) -> bool {
        if end > self.dl_mask.size() || self.dl_mask.any_in(start, end) {
            return false;
        }
        self.dl_mask.fill(start, end, true);
        true
    }

    /// Reserves arbitrary UL PRBs. In `strict` mode fails on any collision;
    /// otherwise merges (used for non-exclusive reservations like PUCCH
    /// edges recomputed every TTI).
    pub fn reserve_ul_prbs(&mut self, mask: &PrbMask, strict: bool) -> bool {
        if strict && !self.ul_mask.disjoint(mask) {
            return false;
        }
        self.ul_mask.bitor_assign(mask);
        true
    }

    /// Finds and reserves the next free contiguous RBG range of the given
    /// size, used for broadcast/paging/RAR control allocations.
    fn find_free_rbg_range(&self, size: u32) -> Option<(usize, usize)> {
        let size = size as usize;
        let n = self.dl_mask.size();
        let mut start = self.next_free_rbg;
        while start + size <= n {
            if !self.dl_mask.any_in(start, start + size) {
                return Some((start, start + size));
            }
            start += 1;
        }
        // wrap once from the beginning in case next_free_rbg skipped a gap
        let mut start = 0;
        while start + size <= self.next_free_rbg.min(n) {
            if !self.dl_mask.any_in(start, start + size) {
                return Some((start, start + size));
            }
            start += 1;
        }
        None
    }

    /// `nof_grants` only matters for [`DlCtrlType::Rar`] (ignored otherwise):
    /// the number of Msg3 grants the RAR PDU is being sized for.
    pub fn alloc_dl_ctrl(
        &mut self,
        aggr: AggrLevels,
        ctrl_type: DlCtrlType,
        rnti: Option<Rnti>,
        nof_grants: u32,
    ) -> Result<DciAlloc, AllocOutcome> {
        let size = match ctrl_type {
            DlCtrlType::Bc | DlCtrlType::Pcch => bc_pcch_nof_rbg(self.rbg_size),
            DlCtrlType::Rar => rar_nof_rbg(self.rbg_size, nof_grants),
        };
        let (start, end) = self.find_free_rbg_range(size).ok_or(AllocOutcome::RbCollision)?;
        let dci = self.pdcch.alloc_dci(rnti, aggr)?;
        self.dl_mask.fill(start, end, true);
        self.next_free_rbg = end;
        Ok(dci)
    }

    /// Reserves a caller-supplied RBG mask for UE data and allocates a
    /// matching PDCCH candidate.
    pub fn alloc_dl_data(&mut self, rnti: Rnti, mask: &RbgMask, aggr: AggrLevels) -> Result<DciAlloc, AllocOutcome> {
        if mask.size() != self.dl_mask.size() {
            return Err(AllocOutcome::NofRbInvalid);
        }
        if !self.dl_mask.disjoint(mask) {
            return Err(AllocOutcome::RbCollision);
        }
        let dci = self.pdcch.alloc_dci(Some(rnti), aggr)?;
        self.dl_mask.bitor_assign(mask);
        Ok(dci)
    }

    /// Reserves PUSCH PRBs `[rb_start, rb_start+l_prb)` and, when
    /// `needs_pdcch`, a PDCCH candidate.
    pub fn alloc_ul_data(
        &mut self,
        rnti: Rnti,
        rb_start: u32,
        l_prb: u32,
        needs_pdcch: bool,
        aggr: AggrLevels,
    ) -> Result<Option<DciAlloc>, AllocOutcome> {
        if rb_start + l_prb > self.ul_mask.size() as u32 {
            return Err(AllocOutcome::NofRbInvalid);
        }
        if self.ul_mask.any_in(rb_start as usize, (rb_start + l_prb) as usize) {
            return Err(AllocOutcome::RbCollision);
        }
        let dci = if needs_pdcch {
            Some(self.pdcch.alloc_dci(Some(rnti), aggr)?)
        } else {
            None
        };
        self.ul_mask.fill(rb_start as usize, (rb_start + l_prb) as usize, true);
        Ok(dci)
    }
}

/// Per-TTI scratch lists for the four DL allocation kinds plus UL, sized for
/// the common case of a handful of allocations (spec.md §3 "Subframe
/// scheduling result").
#[derive(Clone, Debug, Default)]
pub struct SfAllocLists {
    pub bc: SmallVec<[DciAlloc; 4]>,
    pub rar: SmallVec<[DciAlloc; 4]>,
    pub dl_data: SmallVec<[DciAlloc; 8]>,
    pub ul_data: SmallVec<[DciAlloc; 8]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dl_data_rejects_colliding_mask() {
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        let mut m = RbgMask::new(7);
        m.fill(0, 3, true);
        assert!(grid.alloc_dl_data(0x46, &m, AggrLevels::L2).is_ok());
        let mut m2 = RbgMask::new(7);
        m2.fill(2, 4, true);
        assert_eq!(grid.alloc_dl_data(0x47, &m2, AggrLevels::L2), Err(AllocOutcome::RbCollision));
    }

    #[test]
    fn ul_data_reserves_and_detects_collision() {
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        assert!(grid.alloc_ul_data(0x46, 0, 5, true, AggrLevels::L1).unwrap().is_some());
        assert_eq!(grid.alloc_ul_data(0x47, 3, 5, true, AggrLevels::L1), Err(AllocOutcome::RbCollision));
    }

    #[test]
    fn ctrl_alloc_advances_watermark() {
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        let r1 = grid.alloc_dl_ctrl(AggrLevels::L2, DlCtrlType::Bc, None, 1);
        assert!(r1.is_ok());
        assert!(grid.dl_mask().any());
    }

    #[test]
    fn dl_rbg_union_never_exceeds_bounds() {
        let mut grid = SfGrid::new(25, 7, 4, 3, 3);
        let mut m = RbgMask::new(7);
        m.fill(0, 7, true);
        let _ = grid.alloc_dl_data(0x46, &m, AggrLevels::L2);
        assert_eq!(grid.dl_mask().count(), 7);
        assert!(grid.dl_mask().all());
    }
}
