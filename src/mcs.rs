//! MCS/TBS selection (§6): 29 DL MCS entries (plus 256QAM-alt table), 29 UL
//! MCS entries, and `(tbs_idx, nof_prb) -> TBS` sizing.

/// Modulation order (bits/symbol) and transport-block-size index for a DL MCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct McsEntry {
    pub qm: u32,
    pub i_tbs: u32,
}

/// TS 36.213 Table 7.1.7.1-1 (normal, non-256QAM).
pub const DL_MCS_TABLE: [McsEntry; 29] = build_dl_mcs_table(false);
/// TS 36.213 Table 7.1.7.1-1A (256QAM-alt, used when the UE is configured for it).
pub const DL_MCS_TABLE_ALT: [McsEntry; 29] = build_dl_mcs_table(true);

const fn build_dl_mcs_table(alt: bool) -> [McsEntry; 29] {
    let mut table = [McsEntry { qm: 2, i_tbs: 0 }; 29];
    let mut mcs = 0;
    while mcs < 29 {
        let entry = if mcs <= 9 {
            McsEntry { qm: 2, i_tbs: mcs }
        } else if mcs <= 16 {
            McsEntry { qm: 4, i_tbs: mcs - 1 }
        } else if !alt {
            McsEntry { qm: 6, i_tbs: mcs - 2 }
        } else if mcs <= 27 {
            McsEntry { qm: 8, i_tbs: mcs - 2 }
        } else {
            McsEntry { qm: 8, i_tbs: 26 }
        };
        table[mcs as usize] = entry;
        mcs += 1;
    }
    table
}

/// Same modulation/i_tbs split as DL; UL additionally reserves MCS 29 for
/// "no data, UCI only" grants and MCS 28+rv for non-adaptive retransmissions.
pub const UL_MCS_TABLE: [McsEntry; 29] = build_dl_mcs_table(false);

/// MCS index encoding a non-adaptive UL retransmission (§4.3): `28 + rv`.
pub fn non_adaptive_retx_mcs(rv: u32) -> u32 {
    28 + rv
}

/// MCS index for a zero-TB UCI-only grant (§4.6).
pub const UCI_ONLY_MCS: u32 = 29;

/// Per-PRB transport-block-size reference (bits), indexed by `i_tbs` (0..=26),
/// calibrated against TS 36.213 Table 7.1.7.2.1-1's `N_prb = 1` column and
/// scaled linearly for larger allocations. This is an engineering
/// approximation of the standard table, monotonic in both `i_tbs` and
/// `nof_prb`, sufficient for scheduler decisions that only need a
/// self-consistent ordering, not bit-exact PHY transport block sizes.
const TBS_PER_PRB_BITS: [u32; 27] = [
    16, 24, 32, 40, 56, 72, 88, 104, 120, 136, 144, 176, 208, 224, 256, 280, 296, 328, 336, 376,
    392, 424, 456, 488, 504, 536, 584,
];

/// Transport block size, in bits, for a given `i_tbs` and PRB allocation.
pub fn tbs_bits(i_tbs: u32, nof_prb: u32) -> u32 {
    let i_tbs = i_tbs.min(TBS_PER_PRB_BITS.len() as u32 - 1) as usize;
    if nof_prb == 0 {
        return 0;
    }
    let raw = TBS_PER_PRB_BITS[i_tbs] as u64 * nof_prb as u64;
    // TBS values are always a multiple of 8 bits (whole bytes).
    ((raw / 8) * 8) as u32
}

pub fn tbs_bytes(i_tbs: u32, nof_prb: u32) -> u32 {
    tbs_bits(i_tbs, nof_prb) / 8
}

/// Coderate implied by carrying `tbs_bits` over `nof_prb` PRBs at modulation
/// order `qm`, assuming 12 subcarriers/PRB and ~10 usable REs/subcarrier
/// after reference-signal/control overhead (a conservative per-TTI RE count,
/// matching the "conservative RE count" of §4.6).
pub fn coderate(tbs_bits_val: u32, nof_prb: u32, qm: u32) -> f64 {
    const RES_PER_PRB: u32 = 110; // 12 subcarriers * ~9-10 symbols, conservative
    let nof_re = nof_prb * RES_PER_PRB;
    if nof_re == 0 || qm == 0 {
        return f64::INFINITY;
    }
    tbs_bits_val as f64 / (nof_re as f64 * qm as f64)
}

/// CQI (0..15) -> maximum supported coderate, a coarse monotonic mapping
/// standing in for TS 36.213 Table 7.2.3-1's CQI-to-(modulation,coderate)
/// entries.
pub fn cqi_to_max_coderate(cqi: u32) -> f64 {
    let cqi = cqi.min(15);
    0.05 + (cqi as f64) * 0.06
}

/// Binary-search the MCS table for the largest MCS whose TBS fits within
/// `max_bytes` and whose implied coderate respects both the CQI-derived cap
/// and the `0.93 * Qm` ceiling (§4.6).
pub fn select_mcs_for_bytes(table: &[McsEntry; 29], nof_prb: u32, cqi: u32, max_bytes: u32) -> Option<(u32, u32)> {
    let cqi_cap = cqi_to_max_coderate(cqi);
    let mut best: Option<(u32, u32)> = None;
    let mut lo = 0i32;
    let mut hi = 28i32;
    while lo <= hi {
        let mid = (lo + hi) / 2;
        let entry = table[mid as usize];
        let tbs = tbs_bits(entry.i_tbs, nof_prb);
        let rate = coderate(tbs, nof_prb, entry.qm);
        let rate_cap = cqi_cap.min(0.93 * entry.qm as f64);
        let fits = tbs / 8 <= max_bytes && rate <= rate_cap;
        if fits {
            best = Some((mid as u32, tbs / 8));
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    best
}
