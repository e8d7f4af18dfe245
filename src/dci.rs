//! DCI record types and PDCCH aggregation-level bookkeeping (§6).

use bitflags::bitflags;

use crate::bitset::RbgMask;
use crate::Rnti;

/// DCI format carried by a PDCCH candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DciFormat {
    /// UL grant.
    Format0,
    /// DL grant, compact (used for RAR/BC/PCCH and fallback DL data).
    Format1A,
    /// DL grant, full (normal DL data, single codeword).
    Format1,
    /// DL grant, two codewords (spatial multiplexing).
    Format2,
    Format2A,
}

bitflags! {
    /// Which PDCCH aggregation levels (in CCEs) are legal to search.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AggrLevels: u8 {
        const L1 = 0b0001;
        const L2 = 0b0010;
        const L4 = 0b0100;
        const L8 = 0b1000;
    }
}

impl AggrLevels {
    pub const ALL: AggrLevels = AggrLevels::L1.union(AggrLevels::L2).union(AggrLevels::L4).union(AggrLevels::L8);

    /// Aggregation level as a CCE count (`2^L_idx`).
    pub fn cces(self) -> Option<u32> {
        match self {
            AggrLevels::L1 => Some(1),
            AggrLevels::L2 => Some(2),
            AggrLevels::L4 => Some(4),
            AggrLevels::L8 => Some(8),
            _ => None,
        }
    }

    pub fn from_cces(l: u32) -> Option<Self> {
        match l {
            1 => Some(AggrLevels::L1),
            2 => Some(AggrLevels::L2),
            4 => Some(AggrLevels::L4),
            8 => Some(AggrLevels::L8),
            _ => None,
        }
    }
}

/// DCI format size in bits, dependent only on cell bandwidth and format.
///
/// Values follow TS 36.212 §5.3.3 sizing (rounded and padding-aligned), used
/// only to size downstream buffers; the scheduler itself never serializes to
/// air-interface bits.
pub fn dci_format_size_bits(nof_prb: u32, format: DciFormat) -> u32 {
    let riv_bits = (32 - (nof_prb * (nof_prb + 1) / 2).leading_zeros()).max(1);
    match format {
        DciFormat::Format1A | DciFormat::Format0 => riv_bits + 20,
        DciFormat::Format1 => riv_bits + 10 + nof_prb.div_ceil(4),
        DciFormat::Format2 => riv_bits + 20 + nof_prb.div_ceil(4),
        DciFormat::Format2A => riv_bits + 18 + nof_prb.div_ceil(4),
    }
}

/// One emitted DL DCI plus the PDU descriptors it schedules.
#[derive(Clone, Debug)]
pub struct DlDci {
    pub rnti: Rnti,
    pub format: DciFormat,
    pub ncce: u32,
    pub aggr_level: u32,
    pub rbg_mask: RbgMask,
    pub mcs: [i32; 2],
    pub rv: [u32; 2],
    pub ndi: [bool; 2],
    pub pid: u32,
    pub tbs: [i32; 2],
    pub ue_cc_idx: usize,
}

/// PDU descriptor: an LCID (possibly a control-element code) plus byte count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PduPart {
    pub lcid: u8,
    pub nbytes: u32,
}

/// A DL data allocation: its DCI plus the PDU layout chosen for it.
#[derive(Clone, Debug)]
pub struct DlDataAlloc {
    pub dci: DlDci,
    pub pdu: Vec<PduPart>,
}

#[derive(Clone, Debug)]
pub struct UlDci {
    pub rnti: Rnti,
    pub needs_pdcch: bool,
    pub ncce: u32,
    pub aggr_level: u32,
    pub rb_start: u32,
    pub l_prb: u32,
    pub mcs: i32,
    pub rv: u32,
    pub ndi: bool,
    pub tbs: i32,
    pub cqi_request: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhichEntry {
    pub rnti: Rnti,
    pub ack: bool,
}

/// RV cycle used for the k-th transmission of a transport block (spec.md §3/§8 property 5).
pub const RV_CYCLE: [u32; 4] = [0, 2, 3, 1];

pub fn rv_for_retx(retx_count: u32) -> u32 {
    RV_CYCLE[(retx_count as usize) % RV_CYCLE.len()]
}
