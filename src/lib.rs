//! MAC-layer downlink/uplink scheduler for a single LTE eNodeB cell.
//!
//! [`Scheduler`] is the public facade (component L): it owns the UE map and
//! the per-carrier sub-schedulers and exposes a FAPI-like API, thread-safe
//! under one internal mutex. Everything else in this crate is reachable only
//! through it.

pub mod bcch;
pub mod bitset;
pub mod config;
pub mod dci;
pub mod error;
pub mod grid;
pub mod harq;
pub mod lchan;
pub mod mcs;
pub mod pdcch;
pub mod pdu;
pub mod rach;
pub mod metric;
pub mod sched;
pub mod tti;
pub mod ue;

pub use config::{BearerCfg, CarrierCfg, CellConfig, Direction, PucchCfg, UeCfg};
pub use error::{Result, SchedError};
pub use sched::{DlSchedResult, Scheduler, UlSchedResult};
pub use tti::TtiPoint;

/// Radio Network Temporary Identifier (16-bit UE id).
pub type Rnti = u16;

/// System Information RNTI.
pub const SI_RNTI: Rnti = 0xFFFF;
/// Paging RNTI.
pub const P_RNTI: Rnti = 0xFFFE;
/// Lowest value reserved for use as a Random-Access RNTI (`1 + sf_idx + f_id`).
pub const RA_RNTI_MIN: Rnti = 0x0001;
pub const RA_RNTI_MAX: Rnti = 0x0010;
/// Lowest assignable Temporary/C-RNTI, chosen to never collide with the
/// fixed/reserved RNTI ranges above.
pub const CRNTI_START: Rnti = 0x0046;

/// Max DL and UL HARQ processes per UE per carrier.
pub const NOF_HARQ_PROCESSES: usize = 8;
/// Max logical-channel groups for UL BSR aggregation.
pub const NOF_LCGS: usize = 4;
/// Max logical channels (LCID 0..10 inclusive, 11 entries) plus reserved LCIDs.
pub const NOF_LCHANS: usize = 11;
/// Max carriers per UE (PCell + one SCell when the `ca` feature is enabled).
#[cfg(feature = "ca")]
pub const MAX_CARRIERS: usize = 2;
#[cfg(not(feature = "ca"))]
pub const MAX_CARRIERS: usize = 1;

/// Minimum MAC SDU size worth scheduling (§4.8 rule 5).
pub const MIN_MAC_SDU_SIZE: u32 = 5;
