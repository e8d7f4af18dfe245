//! MAC PDU subheader/control-element wire format (§6), grounded on
//! `lib/include/srslte/mac/pdu.h`'s `dl_sch_lcid`/`ul_sch_lcid` tables.

use bit_field::BitField;

use crate::Rnti;

/// 3GPP 36.321 Table 6.2.1-1 (DL-SCH).
pub mod dl_lcid {
    pub const CCCH: u8 = 0;
    pub const SCELL_ACTIVATION: u8 = 27;
    pub const CON_RES_ID: u8 = 28;
    pub const TA_CMD: u8 = 29;
    pub const DRX_CMD: u8 = 30;
    pub const PADDING: u8 = 31;
}

/// 3GPP 36.321 Table 6.2.1-2 (UL-SCH).
pub mod ul_lcid {
    pub const CCCH: u8 = 0;
    pub const PHR: u8 = 26;
    pub const CRNTI: u8 = 27;
    pub const TRUNC_BSR: u8 = 28;
    pub const SHORT_BSR: u8 = 29;
    pub const LONG_BSR: u8 = 30;
    pub const PADDING: u8 = 31;
}

/// Subheader length in bytes for an SDU of `sdu_len` bytes: 2 when the
/// length fits in 7 bits (≤127... spec.md uses the ≤128 boundary), 3
/// otherwise (second length byte for the 15-bit form).
pub fn subheader_len(sdu_len: u32, is_last: bool) -> u32 {
    if is_last {
        return 1; // last subheader omits the length field
    }
    if sdu_len <= 128 {
        2
    } else {
        3
    }
}

/// Packs a short/long MAC subheader: `R R E LCID F L(7)`, with a second
/// length byte appended when `sdu_len > 128` (F=1). The last subheader in a
/// PDU has no length field at all (handled by the caller, not encoded here).
pub fn pack_subheader(lcid: u8, sdu_len: u32, has_next: bool) -> heapless::Vec<u8, 3> {
    let mut out: heapless::Vec<u8, 3> = heapless::Vec::new();
    let e_bit = if has_next { 1u8 } else { 0u8 };
    let long_form = sdu_len > 128;

    let mut first = 0u8;
    first.set_bits(5..6, e_bit);
    first.set_bit(6, long_form);
    first.set_bits(0..5, lcid & 0x1F);
    let _ = out.push(first);

    if long_form {
        let _ = out.push(((sdu_len >> 8) & 0x7F) as u8);
        let _ = out.push((sdu_len & 0xFF) as u8);
    } else {
        let _ = out.push((sdu_len as u8) & 0x7F);
    }
    out
}

/// Timing Advance Command CE: 1 byte, `R R TAC(6)`.
pub fn pack_ta_cmd(tac: u8) -> u8 {
    let mut b = 0u8;
    b.set_bits(0..6, tac & 0x3F);
    b
}

/// SCell Activation CE: 1-byte bitmap, bit `i` = SCell with `ue_cc_idx = i`.
pub fn pack_scell_activation(active_ccs: &[usize]) -> u8 {
    let mut b = 0u8;
    for &cc in active_ccs {
        if cc < 8 {
            b.set_bit(cc, true);
        }
    }
    b
}

/// ConRes-ID CE: 6 raw bytes, no length field beyond the LCID itself.
pub fn pack_con_res_id(ue_identity: u64) -> [u8; 6] {
    let bytes = ue_identity.to_be_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&bytes[2..8]);
    out
}

/// TS 36.321 Table 6.1.3.1-1 buffer-size index levels (bytes), a fixed
/// protocol constant reused verbatim: `BSR_TABLE[i]` is the lower bound of
/// index `i`'s range.
pub const BSR_TABLE: [u32; 64] = [
    0, 10, 12, 14, 17, 19, 22, 26, 31, 36, 42, 49, 57, 67, 78, 91, 107, 125, 146, 171, 200, 234,
    274, 321, 376, 440, 515, 603, 706, 826, 967, 1132, 1326, 1552, 1817, 2127, 2490, 2915, 3413,
    3995, 4677, 5476, 6411, 7505, 8787, 10287, 12043, 14099, 16507, 19325, 22624, 26487, 31009,
    36304, 42502, 49759, 58255, 68201, 79846, 93479, 109439, 128125, 150000, 150001,
];

pub fn bsr_index_for_bytes(bytes: u32) -> u8 {
    match BSR_TABLE.iter().rposition(|&v| v <= bytes) {
        Some(idx) => idx as u8,
        None => 0,
    }
}

/// Short/Truncated BSR CE: 1 byte, `LCG(2) BufferSize(6)`.
pub fn pack_short_bsr(lcg: u8, bytes: u32) -> u8 {
    let mut b = 0u8;
    b.set_bits(6..8, lcg & 0x3);
    b.set_bits(0..6, bsr_index_for_bytes(bytes) & 0x3F);
    b
}

/// Long BSR CE: 3 bytes, one 6-bit buffer-size index per LCG.
pub fn pack_long_bsr(per_lcg_bytes: [u32; 4]) -> [u8; 3] {
    let idx: Vec<u8> = per_lcg_bytes.iter().map(|&b| bsr_index_for_bytes(b)).collect();
    let packed: u32 = (idx[0] as u32) << 18 | (idx[1] as u32) << 12 | (idx[2] as u32) << 6 | idx[3] as u32;
    [(packed >> 16) as u8, (packed >> 8) as u8, packed as u8]
}

/// RAR body: `{R(1), TA(11), UL_grant(20), Temp_C-RNTI(16)}`, 48 bits packed
/// into 6 bytes (§6; combined with its 1-byte subheader this is the "7
/// bytes per grant" of [`crate::rach::RAR_GRANT_BYTES`]).
pub fn pack_rar_body(ta: u16, ul_grant_riv: u32, temp_crnti: Rnti) -> [u8; 6] {
    let mut bits: u64 = 0;
    bits.set_bits(31..47, temp_crnti as u64);
    bits.set_bits(11..31, (ul_grant_riv & 0xF_FFFF) as u64);
    bits.set_bits(0..11, (ta & 0x7FF) as u64);
    let be = bits.to_be_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&be[2..8]);
    out
}

pub fn unpack_rar_body(bytes: &[u8; 6]) -> (u16, u32, Rnti) {
    let mut padded = [0u8; 8];
    padded[2..8].copy_from_slice(bytes);
    let bits = u64::from_be_bytes(padded);
    let ta = bits.get_bits(0..11) as u16;
    let ul_grant = bits.get_bits(11..31) as u32;
    let temp_crnti = bits.get_bits(31..47) as Rnti;
    (ta, ul_grant, temp_crnti)
}

/// Type-2 resource indication value for an UL grant `(rb_start, l_prb)` over
/// a cell of `nof_prb` PRBs (TS 36.213 §8.1.1 compact RIV formula, reused
/// for both UL grants and the RAR's embedded UL grant).
pub fn riv(nof_prb: u32, rb_start: u32, l_prb: u32) -> u32 {
    let l = l_prb.max(1) - 1;
    if l <= nof_prb / 2 {
        nof_prb * l + rb_start
    } else {
        nof_prb * (nof_prb - l - 1) + (nof_prb - 1 - rb_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rar_body_roundtrips() {
        let packed = pack_rar_body(0x123, 0x4_5678, 0xBEEF);
        let (ta, grant, crnti) = unpack_rar_body(&packed);
        assert_eq!(ta, 0x123);
        assert_eq!(grant, 0x4_5678);
        assert_eq!(crnti, 0xBEEF);
    }

    #[test]
    fn con_res_id_is_six_bytes() {
        let id = pack_con_res_id(0x0102_0304_0506_0708);
        assert_eq!(id, [0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn scell_activation_sets_correct_bits() {
        let b = pack_scell_activation(&[1, 3]);
        assert_eq!(b, 0b0000_1010);
    }

    #[test]
    fn ta_cmd_masks_to_six_bits() {
        assert_eq!(pack_ta_cmd(0xFF), 0x3F);
    }

    #[test]
    fn riv_is_symmetric_for_small_and_large_allocations() {
        let r1 = riv(25, 0, 5);
        let r2 = riv(25, 20, 5);
        assert_ne!(r1, r2);
    }

    #[test]
    fn bsr_index_is_monotonic() {
        assert!(bsr_index_for_bytes(1000) >= bsr_index_for_bytes(10));
    }
}
