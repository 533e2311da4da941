mod common;

use common::{Guest, CODE0, CODE3, DATA0, DATA3};
use protcore_cpu::descriptor::{kind, Descriptor};
use protcore_cpu::{Exception, Fault, SegReg};

#[test]
fn data_load_through_a_more_privileged_code_segment_is_refused() {
    let mut g = Guest::new();
    g.enter_ring3(0x1_0000);
    let before = *g.cpu.segs.get(SegReg::Ds);
    // CODE0 is readable non-conforming code at DPL 0, below max(CPL, RPL) = 3.
    let fault = g.cpu.set_seg_general(&mut g.bus, SegReg::Ds, CODE0 | 3).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(CODE0)));
    assert_eq!(*g.cpu.segs.get(SegReg::Ds), before);
}

#[test]
fn readable_code_may_be_loaded_into_a_data_register() {
    let mut g = Guest::new();
    g.enter_ring3(0x1_0000);
    g.cpu.set_seg_general(&mut g.bus, SegReg::Es, CODE3).unwrap();
    assert_eq!(g.cpu.selector(SegReg::Es), CODE3);
}

#[test]
fn null_data_selector_loads_but_null_ss_faults() {
    let mut g = Guest::new();
    g.cpu.set_seg_general(&mut g.bus, SegReg::Ds, 0).unwrap();
    assert_eq!(g.cpu.selector(SegReg::Ds), 0);
    let fault = g.cpu.set_seg_general(&mut g.bus, SegReg::Ss, 0).unwrap_err();
    assert_eq!(fault, Fault::gp0());
    assert_eq!(g.cpu.selector(SegReg::Ss), DATA0);
}

#[test]
fn ss_needs_matching_privilege() {
    let mut g = Guest::new();
    let fault = g.cpu.set_seg_general(&mut g.bus, SegReg::Ss, DATA3).unwrap_err();
    assert_eq!(fault.exception, Exception::GeneralProtection);
    assert_eq!(fault.error_code, u32::from(DATA3 & !3));
}

#[test]
fn not_present_segments_raise_np_or_ss() {
    let mut g = Guest::new();
    let mut d = Descriptor::segment(0, 0xffff, kind::DATA_EU_RW_A, 0, false, false);
    d.set_present(false);
    g.set_gdt_entry(common::DATA16, d);
    let ds = g.cpu.set_seg_general(&mut g.bus, SegReg::Ds, common::DATA16).unwrap_err();
    assert_eq!(ds.exception, Exception::SegmentNotPresent);
    let ss = g.cpu.set_seg_general(&mut g.bus, SegReg::Ss, common::DATA16).unwrap_err();
    assert_eq!(ss.exception, Exception::StackFault);
}

#[test]
fn selector_past_the_gdt_limit_is_gp() {
    let mut g = Guest::new();
    let fault = g.cpu.set_seg_general(&mut g.bus, SegReg::Ds, 0x0200).unwrap_err();
    assert_eq!(fault, Fault::gp(0x0200));
}

#[test]
fn mov_to_cs_is_undefined() {
    let mut g = Guest::new();
    assert_eq!(g.cpu.set_seg_general(&mut g.bus, SegReg::Cs, CODE0), Err(Fault::ud()));
}

#[test]
fn real_mode_loads_shift_the_selector() {
    let mut g = Guest::new();
    g.cpu.pmode = false;
    g.cpu.set_seg_general(&mut g.bus, SegReg::Ds, 0x1234).unwrap();
    assert_eq!(g.cpu.seg_base(SegReg::Ds), 0x12340);
}

#[test]
fn pop_seg_leaves_esp_alone_on_fault() {
    let mut g = Guest::new();
    g.cpu.push32(&mut g.bus, 0x0200).unwrap();
    let esp = g.cpu.esp();
    assert!(g.cpu.pop_seg(&mut g.bus, SegReg::Ds, true).is_err());
    assert_eq!(g.cpu.esp(), esp);
    g.cpu.push32(&mut g.bus, u32::from(DATA0)).unwrap();
    g.cpu.pop_seg(&mut g.bus, SegReg::Es, true).unwrap();
    assert_eq!(g.cpu.esp(), esp);
}
