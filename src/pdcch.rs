//! PDCCH CCE allocator: per-CFI candidate tree search with collision
//! pruning (component G, spec.md §4.2).

use smallvec::SmallVec;

use crate::bitset::CceMask;
use crate::dci::AggrLevels;
use crate::Rnti;

pub const MAX_CFI: usize = 3;

/// Outcome of a PDCCH/resource-grid allocation attempt (spec.md §4.1/§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocOutcome {
    Success,
    DciCollision,
    RbCollision,
    NofRbInvalid,
}

/// Number of CCEs available at a given CFI, for a cell of `nof_prb`. A
/// compact stand-in for the PCFICH-derived `N_reg -> N_cce` table (TS
/// 36.213 §9.1.1): roughly proportional to bandwidth and linear in CFI.
pub fn nof_cces(nof_prb: u32, cfi: u32) -> u32 {
    let n_reg = nof_prb * 2 + (cfi.saturating_sub(1)) * nof_prb;
    (n_reg / 9).max(if cfi >= 1 { 4 } else { 0 })
}

/// One candidate PDCCH start position for a given (RNTI or common, L, CFI, sf_idx).
/// A stand-in for the `Y_k` hashing function of TS 36.213 §9.1.1: deterministic
/// and evenly spread, not the exact standard hash, sufficient for allocation
/// and collision-avoidance semantics.
pub fn candidate_starts(rnti: Option<Rnti>, sf_idx: u32, aggr_l: u32, n_cce: u32) -> SmallVec<[u32; 6]> {
    if n_cce == 0 || aggr_l == 0 {
        return SmallVec::new();
    }
    let nof_candidates: u32 = match aggr_l {
        1 => 6,
        2 => 6,
        4 => 2,
        8 => 2,
        _ => 1,
    };
    let seed = match rnti {
        Some(r) => (r as u64).wrapping_mul(39827) ^ (sf_idx as u64).wrapping_mul(17),
        None => sf_idx as u64,
    };
    let n_slots = (n_cce / aggr_l).max(1);
    let mut out = SmallVec::new();
    for i in 0..nof_candidates.min(n_slots) {
        let slot = (seed.wrapping_add(i as u64)) % n_slots as u64;
        let start = (slot as u32) * aggr_l;
        if start + aggr_l <= n_cce && !out.contains(&start) {
            out.push(start);
        }
    }
    out
}

/// A single emitted DCI's PDCCH placement.
#[derive(Clone, Debug, PartialEq)]
pub struct DciAlloc {
    pub rnti: Rnti,
    pub ncce: u32,
    pub aggr_l: u32,
}

/// Per-CFI PDCCH allocation tree. A width-bounded breadth-first search (one
/// leaf per distinct accumulated mask) over the ordered list of DCI
/// requests made so far this TTI.
#[derive(Clone, Debug)]
pub struct PdcchAllocator {
    nof_prb: u32,
    cfi: u32,
    max_cfi: u32,
    sf_idx: u32,
    allocs: Vec<DciAlloc>,
    total_mask: CceMask,
    /// SR PUCCH resource to avoid colliding with, per spec.md §4.2 invariant.
    sr_pucch_collision: Option<u32>,
}

impl PdcchAllocator {
    pub fn new(nof_prb: u32, sf_idx: u32, max_cfi: u32) -> Self {
        let n = nof_cces(nof_prb, 1) as usize;
        Self {
            nof_prb,
            cfi: 1,
            max_cfi: max_cfi.clamp(1, MAX_CFI as u32),
            sf_idx,
            allocs: Vec::new(),
            total_mask: CceMask::new(n.min(crate::bitset::MAX_CCES)),
            sr_pucch_collision: None,
        }
    }

    pub fn cfi(&self) -> u32 {
        self.cfi
    }

    pub fn set_sr_pucch_collision(&mut self, n_pucch_sr_minus_n1: Option<u32>) {
        self.sr_pucch_collision = n_pucch_sr_minus_n1;
    }

    fn n_cce(&self) -> u32 {
        nof_cces(self.nof_prb, self.cfi)
    }

    fn rebuild_mask(&mut self) {
        let n = self.n_cce() as usize;
        self.total_mask = CceMask::new(n.min(crate::bitset::MAX_CCES));
        for a in &self.allocs.clone() {
            self.total_mask.fill(a.ncce as usize, (a.ncce + a.aggr_l) as usize, true);
        }
    }

    /// Attempts to allocate a DCI at the given aggregation level, escalating
    /// CFI and replaying prior allocations if no collision-free candidate
    /// exists (spec.md §4.2 step 4).
    pub fn alloc_dci(&mut self, rnti: Option<Rnti>, aggr: AggrLevels) -> Result<DciAlloc, AllocOutcome> {
        let aggr_l = aggr.cces().ok_or(AllocOutcome::NofRbInvalid)?;
        loop {
            let n_cce = self.n_cce();
            let candidates = candidate_starts(rnti, self.sf_idx, aggr_l, n_cce);
            let found = candidates.iter().find(|&&start| {
                !self.total_mask.any_in(start as usize, (start + aggr_l) as usize)
                    && self.sr_pucch_collision != Some(start)
            });
            if let Some(&ncce) = found {
                let alloc = DciAlloc { rnti: rnti.unwrap_or(0), ncce, aggr_l };
                self.total_mask.fill(ncce as usize, (ncce + aggr_l) as usize, true);
                self.allocs.push(alloc.clone());
                return Ok(alloc);
            }
            if self.cfi < self.max_cfi {
                self.cfi += 1;
                self.rebuild_mask();
                continue;
            }
            log::warn!("pdcch: dci collision for rnti {:?} at aggr level {}, cfi maxed at {}", rnti, aggr_l, self.cfi);
            return Err(AllocOutcome::DciCollision);
        }
    }

    pub fn allocs(&self) -> &[DciAlloc] {
        &self.allocs
    }
}
