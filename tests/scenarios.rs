//! End-to-end scheduling scenarios driven entirely through the public
//! [`Scheduler`] facade, one test per named scenario.

use enb_mac_sched::config::{BearerCfg, CarrierCfg, Direction, PucchCfg, SibCfg};
use enb_mac_sched::{CellConfig, Scheduler, UeCfg};

fn cell(nof_prb: u32) -> CellConfig {
    CellConfig {
        nof_prb,
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
    let mut carriers: heapless::Vec<CarrierCfg, { enb_mac_sched::MAX_CARRIERS }> = heapless::Vec::new();
    let _ = carriers.push(CarrierCfg::default());
    UeCfg {
        maintain_time_alignment: true,
        use_tbs_index_alt: false,
        carriers,
        pucch: PucchCfg { n_pucch_1: 0, n_pucch_sr: 8, n_pucch_cqi: 16 },
        max_msg3_retx: 4,
    }
}

/// S1 — PRACH -> RAR -> Msg3 -> Msg4 -> data.
#[test]
fn s1_prach_rar_msg3_msg4_data() {
    let s = Scheduler::new();
    s.cell_cfg(vec![cell(25)]).unwrap();
    s.dl_rach_info(0, 1, 5, 0x0046).unwrap();

    let mut rar_tti = None;
    for tti in 1..=14u32 {
        let dl = s.dl_sched(tti, 0).unwrap();
        if let Some(r) = dl.rar.first() {
            assert!((4..=14).contains(&tti), "rar must land inside [4, 4+rar_window]");
            assert_eq!(r.grants[0].temp_crnti, 0x0046);
            rar_tti = Some(tti);
            break;
        }
    }
    let rar_tti = rar_tti.expect("a RAR must be scheduled within the window");

    let msg3_tti = rar_tti + 6;
    let ul = s.ul_sched(msg3_tti, 0).unwrap();
    assert_eq!(ul.msg3.len(), 1);
    assert_eq!(ul.msg3[0].temp_crnti, 0x0046);
    assert_eq!(ul.msg3[0].l_prb, 3);

    // Msg4 contention resolution: admit the UE under its assigned C-RNTI and
    // verify the first DL data DCI carries the ConRes-ID CE.
    s.ue_cfg(0x0046, ue_cfg()).unwrap();
    s.mac_buffer_state(0x0046, enb_mac_sched::ue::CE_CON_RES_ID).unwrap();
    s.bearer_ue_cfg(0x0046, 3, BearerCfg { priority: 1, pbr: None, bsd_ms: 50, lcg: 0, direction: Direction::Both })
        .unwrap();
    s.dl_rlc_buffer_state(0x0046, 3, 200, 0).unwrap();
    s.dl_cqi_info(msg3_tti, 0x0046, 0, 10).unwrap();

    let dl4 = s.dl_sched(msg3_tti + 4, 0).unwrap();
    assert_eq!(dl4.data.len(), 1);
    assert!(dl4.data[0].pdu.iter().any(|p| p.lcid == enb_mac_sched::ue::CE_CON_RES_ID));
}

/// S2 — SIB1 periodicity: 4 opportunities per period, rv cycling 0,2,3,1.
#[test]
fn s2_sib1_periodicity() {
    let s = Scheduler::new();
    s.cell_cfg(vec![cell(25)]).unwrap();

    let mut rvs = Vec::new();
    for sfn in [0u32, 2, 4, 6] {
        let dl = s.dl_sched(sfn * 10 + 5, 0).unwrap();
        let sib1 = dl.bc.iter().find(|b| b.sib_idx == Some(0)).expect("sib1 must fire on every even sfn");
        rvs.push(sib1.rv);
    }
    assert_eq!(rvs, vec![0, 2, 3, 1]);
}

/// S3 — DL HARQ retx reuses the same RBG mask and pid after a NACK.
#[test]
fn s3_dl_harq_retx_reuses_mask_and_pid() {
    let s = Scheduler::new();
    s.cell_cfg(vec![cell(25)]).unwrap();
    s.ue_cfg(0x46, ue_cfg()).unwrap();
    s.bearer_ue_cfg(0x46, 3, BearerCfg { priority: 1, pbr: None, bsd_ms: 50, lcg: 0, direction: Direction::Both }).unwrap();
    s.dl_rlc_buffer_state(0x46, 3, 1000, 0).unwrap();
    s.dl_cqi_info(0, 0x46, 0, 5).unwrap();

    let first = s.dl_sched(10, 0).unwrap();
    assert_eq!(first.data.len(), 1);
    let pid = first.data[0].dci.pid;
    let mask_bits: Vec<bool> = (0..7).map(|i| first.data[0].dci.rbg_mask.test(i)).collect();
    let ndi = first.data[0].dci.ndi[0];

    s.dl_ack_info(18, 0x46, 0, 0, false).unwrap();
    let retx = s.dl_sched(18, 0).unwrap();
    assert_eq!(retx.data.len(), 1);
    assert_eq!(retx.data[0].dci.pid, pid);
    assert_eq!(retx.data[0].dci.rv[0], 2);
    assert_eq!(retx.data[0].dci.ndi[0], ndi);
    let retx_bits: Vec<bool> = (0..7).map(|i| retx.data[0].dci.rbg_mask.test(i)).collect();
    assert_eq!(retx_bits, mask_bits);
}

/// S4 — UL non-adaptive retx keeps the same PRBs and needs no PDCCH.
#[test]
fn s4_ul_non_adaptive_retx() {
    let s = Scheduler::new();
    s.cell_cfg(vec![cell(25)]).unwrap();
    s.ue_cfg(0x46, ue_cfg()).unwrap();
    s.ul_bsr(0x46, 0, 500).unwrap();
    s.ul_cqi_info(0, 0x46, 0, 10).unwrap();

    let first = s.ul_sched(10, 0).unwrap();
    assert_eq!(first.data.len(), 1);
    let (rb_start, l_prb) = (first.data[0].rb_start, first.data[0].l_prb);

    s.ul_crc_info(10, 0x46, 0, false).unwrap();
    let retx = s.ul_sched(18, 0).unwrap();
    assert_eq!(retx.data.len(), 1);
    assert_eq!(retx.data[0].rb_start, rb_start);
    assert_eq!(retx.data[0].l_prb, l_prb);
    assert!(!retx.data[0].needs_pdcch);
    assert_eq!(retx.data[0].mcs, 30);
}

/// S6 — PDCCH CFI escalation: no two issued DCIs ever share a CCE.
#[test]
fn s6_pdcch_cfi_escalation_avoids_cce_collision() {
    let s = Scheduler::new();
    s.cell_cfg(vec![cell(6)]).unwrap();
    for i in 0..8u16 {
        let rnti = 0x46 + i;
        s.ue_cfg(rnti, ue_cfg()).unwrap();
        s.bearer_ue_cfg(rnti, 3, BearerCfg { priority: 1, pbr: None, bsd_ms: 50, lcg: 0, direction: Direction::Both }).unwrap();
        s.dl_rlc_buffer_state(rnti, 3, 100, 0).unwrap();
        s.dl_cqi_info(0, rnti, 0, 1).unwrap();
    }
    let dl = s.dl_sched(10, 0).unwrap();
    let mut spans: Vec<(u32, u32)> = Vec::new();
    for d in &dl.data {
        let ncce = d.dci.ncce;
        let end = ncce + d.dci.aggr_level;
        for &(s0, e0) in &spans {
            assert!(ncce >= e0 || end <= s0, "two DCIs share a CCE");
        }
        spans.push((ncce, end));
    }
}

#[cfg(feature = "ca")]
#[test]
fn s5_scell_activation_waits_for_cqi() {
    use enb_mac_sched::config::CarrierCfg;

    let s = Scheduler::new();
    s.cell_cfg(vec![cell(25), cell(25)]).unwrap();

    let mut carriers: heapless::Vec<CarrierCfg, { enb_mac_sched::MAX_CARRIERS }> = heapless::Vec::new();
    let _ = carriers.push(CarrierCfg { cc_idx: 0, active: true, ..Default::default() });
    let _ = carriers.push(CarrierCfg { cc_idx: 1, active: true, ..Default::default() });
    let cfg = UeCfg {
        maintain_time_alignment: true,
        use_tbs_index_alt: false,
        carriers,
        pucch: PucchCfg { n_pucch_1: 0, n_pucch_sr: 8, n_pucch_cqi: 16 },
        max_msg3_retx: 4,
    };
    s.ue_cfg(0x46, cfg).unwrap();
    s.bearer_ue_cfg(0x46, 3, BearerCfg { priority: 1, pbr: None, bsd_ms: 50, lcg: 0, direction: Direction::Both }).unwrap();
    s.dl_rlc_buffer_state(0x46, 3, 100, 0).unwrap();
    s.dl_cqi_info(0, 0x46, 0, 5).unwrap();

    let before = s.dl_sched(10, 1).unwrap();
    assert!(before.data.is_empty(), "scell must not be scheduled before its cqi arrives");

    // Activating a carrier queues a SCell Activation CE, served on the
    // pcell (cc0) in the very next DL allocation.
    let cc0 = s.dl_sched(11, 0).unwrap();
    assert_eq!(cc0.data.len(), 1);
    assert!(cc0.data[0].pdu.iter().any(|p| p.lcid == enb_mac_sched::ue::CE_SCELL_ACTIVATION));

    s.dl_cqi_info(10, 0x46, 1, 3).unwrap();
    let after = s.dl_sched(20, 1).unwrap();
    assert!(!after.data.is_empty(), "scell becomes schedulable once active");
}
