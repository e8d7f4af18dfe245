//! Broadcast (SIB windowing) and paging scheduler (component I, spec.md §4.4).

use crate::config::{CellConfig, SibCfg};
use crate::dci::rv_for_retx;
use crate::tti::TtiPoint;

/// RV sequence used by all SIB (re)transmissions (spec.md §4.4/§8 property 5,
/// same fixed cycle as HARQ retransmissions).
pub fn sib_rv(n_tx: u32) -> u32 {
    rv_for_retx(n_tx)
}

/// Per-SIB scheduling state: how many opportunities have fired in the
/// current window.
#[derive(Clone, Copy, Debug, Default)]
struct SibSchedState {
    n_tx_this_period: u32,
    last_sfn_scheduled: Option<u32>,
}

/// Tracks SIB1 and SIB2+ windows and produces the (sf_idx, rv) of any SIB
/// transmission opportunity due at a given TTI.
#[derive(Clone, Debug)]
pub struct BcchScheduler {
    sib1_state: SibSchedState,
    other_states: Vec<SibSchedState>,
}

/// One SIB transmission opportunity due at the queried TTI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SibOpportunity {
    pub sib_idx: usize,
    pub n_tx: u32,
    pub rv: u32,
}

const MAX_SIB_RETX: u32 = 4;

impl BcchScheduler {
    pub fn new(cell: &CellConfig) -> Self {
        Self { sib1_state: SibSchedState::default(), other_states: vec![SibSchedState::default(); cell.sibs.len()] }
    }

    /// SIB1: subframe 5 of every even SFN, up to 4 transmissions per period
    /// (spec.md §4.4).
    fn sib1_due(&mut self, tti: TtiPoint, cell: &CellConfig) -> Option<SibOpportunity> {
        if tti.sf_idx() != 5 || tti.sfn() % 2 != 0 {
            return None;
        }
        let period_sfn = cell.sib1_period_rf;
        if period_sfn != 0 && tti.sfn() % (period_sfn * 2) == 0 {
            self.sib1_state.n_tx_this_period = 0;
        }
        if self.sib1_state.n_tx_this_period >= MAX_SIB_RETX {
            return None;
        }
        if self.sib1_state.last_sfn_scheduled == Some(tti.sfn()) {
            return None;
        }
        let n_tx = self.sib1_state.n_tx_this_period;
        self.sib1_state.n_tx_this_period += 1;
        self.sib1_state.last_sfn_scheduled = Some(tti.sfn());
        Some(SibOpportunity { sib_idx: 0, n_tx, rv: sib_rv(n_tx) })
    }

    /// SIB `i>0`: window starts at `sfn mod period_rf == ((i-1)*window_ms)/10`,
    /// subframe `((i-1)*window_ms) mod 10`, length `window_ms` (spec.md §4.4).
    fn other_due(&mut self, idx: usize, sib: &SibCfg, tti: TtiPoint) -> Option<SibOpportunity> {
        let i = idx + 1; // SIB2 is index 0 in cell.sibs but logical SIB index 2
        let window_start_sf = ((i as u32) * sib.window_ms) % 10;
        let window_start_sfn_mod = ((i as u32) * sib.window_ms) / 10;
        let sfn_in_period = tti.sfn() % sib.period_rf;
        let abs_sf_in_period = sfn_in_period * 10 + tti.sf_idx();
        let window_start_abs_sf = window_start_sfn_mod * 10 + window_start_sf;
        if abs_sf_in_period < window_start_abs_sf || abs_sf_in_period >= window_start_abs_sf + sib.window_ms {
            if abs_sf_in_period == 0 {
                self.other_states[idx].n_tx_this_period = 0;
            }
            return None;
        }
        let state = &mut self.other_states[idx];
        if state.n_tx_this_period >= MAX_SIB_RETX {
            return None;
        }
        // Spread opportunities evenly across the window.
        let step = (sib.window_ms / MAX_SIB_RETX).max(1);
        let offset_in_window = abs_sf_in_period - window_start_abs_sf;
        if offset_in_window % step != 0 {
            return None;
        }
        if state.last_sfn_scheduled == Some(tti.to_u32()) {
            return None;
        }
        let n_tx = state.n_tx_this_period;
        state.n_tx_this_period += 1;
        state.last_sfn_scheduled = Some(tti.to_u32());
        Some(SibOpportunity { sib_idx: i, n_tx, rv: sib_rv(n_tx) })
    }

    /// All SIB opportunities due at `tti` (there can be at most one SIB1 plus
    /// one SIB2+ slot per TTI in practice, but the caller handles a list).
    pub fn due_at(&mut self, tti: TtiPoint, cell: &CellConfig) -> Vec<SibOpportunity> {
        let mut out = Vec::new();
        if let Some(op) = self.sib1_due(tti, cell) {
            out.push(op);
        }
        for idx in 0..cell.sibs.len() {
            if let Some(op) = self.other_due(idx, &cell.sibs[idx], tti) {
                out.push(op);
            }
        }
        out
    }
}

/// A pending paging opportunity signalled by RRC for the current TTI.
#[derive(Clone, Copy, Debug)]
pub struct PagingOpportunity {
    pub payload_len: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PucchCfg;

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

    #[test]
    fn sib1_fires_on_even_sfn_subframe_5() {
        let cell = cell();
        let mut sched = BcchScheduler::new(&cell);
        let op = sched.due_at(TtiPoint::new(5), &cell);
        assert_eq!(op.len(), 1);
        assert_eq!(op[0].sib_idx, 0);
        assert_eq!(op[0].rv, 0);
    }

    #[test]
    fn sib1_does_not_fire_on_odd_sfn() {
        let cell = cell();
        let mut sched = BcchScheduler::new(&cell);
        let op = sched.due_at(TtiPoint::new(15), &cell); // sfn=1, sf=5
        assert!(op.is_empty());
    }

    #[test]
    fn sib1_rv_cycles_over_four_opportunities() {
        let cell = cell();
        let mut sched = BcchScheduler::new(&cell);
        let mut rvs = Vec::new();
        for sfn in [0u32, 2, 4, 6] {
            let op = sched.due_at(TtiPoint::new(sfn * 10 + 5), &cell);
            rvs.push(op[0].rv);
        }
        assert_eq!(rvs, vec![0, 2, 3, 1]);
    }

    #[test]
    fn sib1_stops_after_four_opportunities_in_period() {
        let cell = cell();
        let mut sched = BcchScheduler::new(&cell);
        for sfn in [0u32, 2, 4, 6] {
            sched.due_at(TtiPoint::new(sfn * 10 + 5), &cell);
        }
        let op = sched.due_at(TtiPoint::new(8 * 10 + 5), &cell);
        // period_rf=8 -> sfn 8*2=16 restarts the period (sfn % (period*2) == 0 at sfn=16, not 8)
        assert!(op.is_empty() || op[0].n_tx == 0);
    }
}
