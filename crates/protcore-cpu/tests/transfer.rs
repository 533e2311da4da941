mod common;

use common::{Guest, CODE0, CODE3, DATA0, DATA3, LDT_BASE, LDT_SEL, RING0_STACK, RING3_STACK};
use protcore_cpu::descriptor::kind;
use protcore_cpu::{Descriptor, Fault, SegReg};

const TARGET: u32 = 0x1_3000;
/// LDT slot 1, RPL 3.
const GATE_SEL: u16 = 0x0f;

fn with_call_gate(params: u8) -> Guest {
    let mut g = Guest::new();
    Descriptor::gate(CODE0, TARGET, kind::CALL_GATE_386, 3, params)
        .save(&mut g.bus, LDT_BASE + 8)
        .unwrap();
    g.cpu.lldt(&mut g.bus, LDT_SEL).unwrap();
    g.enter_ring3(0x1_0000);
    g
}

#[test]
fn direct_jmp_to_another_privilege_level_is_gp() {
    let mut g = Guest::new();
    let fault = g.cpu.jmp_far(&mut g.bus, true, CODE3, TARGET, 0).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(CODE3 & !3)));
    assert_eq!(g.cpu.selector(SegReg::Cs), CODE0);
}

#[test]
fn ring3_cannot_jmp_or_call_straight_into_ring0_code() {
    let mut g = Guest::new();
    g.enter_ring3(0x1_0000);
    let esp = g.cpu.esp();

    let fault = g.cpu.jmp_far(&mut g.bus, true, CODE0, TARGET, 0x1_0007).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(CODE0)));
    assert_eq!(g.cpu.selector(SegReg::Cs), CODE3);
    assert_eq!(g.cpu.cpl, 3);

    let fault = g.cpu.call_far(&mut g.bus, true, CODE0, TARGET, 0x1_0007).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(CODE0)));
    assert_eq!(g.cpu.selector(SegReg::Cs), CODE3);
    assert_eq!(g.cpu.cpl, 3);
    assert_eq!(g.cpu.esp(), esp);
}

#[test]
fn jmp_to_a_non_code_segment_is_gp() {
    let mut g = Guest::new();
    let fault = g.cpu.jmp_far(&mut g.bus, true, DATA0, TARGET, 0).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(DATA0)));
}

#[test]
fn same_level_call_and_ret_release_parameters() {
    let mut g = Guest::new();
    g.cpu.push32(&mut g.bus, 0xdead).unwrap();
    g.cpu.call_far(&mut g.bus, true, CODE0, TARGET, 0x1_0007).unwrap();
    assert_eq!(g.cpu.regs.eip, TARGET);
    assert_eq!(g.cpu.esp(), 0x8000 - 12);
    assert_eq!(g.cpu.peek32(&mut g.bus, 0).unwrap(), 0x1_0007);
    assert_eq!(g.cpu.peek32(&mut g.bus, 4).unwrap(), u32::from(CODE0));

    g.cpu.ret_far(&mut g.bus, true, 4).unwrap();
    assert_eq!(g.cpu.regs.eip, 0x1_0007);
    assert_eq!(g.cpu.esp(), 0x8000);
}

#[test]
fn call_gate_to_ring0_copies_parameters_to_the_inner_stack() {
    let mut g = with_call_gate(2);
    g.cpu.push32(&mut g.bus, 0xaaaa).unwrap();
    g.cpu.push32(&mut g.bus, 0xbbbb).unwrap();

    g.cpu.call_far(&mut g.bus, true, GATE_SEL, 0, 0x1_0009).unwrap();
    assert_eq!(g.cpu.cpl, 0);
    assert_eq!((g.cpu.selector(SegReg::Cs), g.cpu.regs.eip), (CODE0, TARGET));
    assert_eq!(g.cpu.selector(SegReg::Ss), DATA0);
    assert_eq!(g.cpu.esp(), RING0_STACK - 24);
    let frame: Vec<u32> = (0..6).map(|i| g.cpu.peek32(&mut g.bus, i * 4).unwrap()).collect();
    assert_eq!(
        frame,
        vec![0x1_0009, u32::from(CODE3), 0xbbbb, 0xaaaa, RING3_STACK - 8, u32::from(DATA3)]
    );

    // A ring-0 data selector left in DS is dropped on the way out.
    g.cpu.set_seg_general(&mut g.bus, SegReg::Ds, DATA0).unwrap();
    g.cpu.ret_far(&mut g.bus, true, 8).unwrap();
    assert_eq!(g.cpu.cpl, 3);
    assert_eq!(g.cpu.regs.eip, 0x1_0009);
    assert_eq!(g.cpu.selector(SegReg::Ss), DATA3);
    assert_eq!(g.cpu.esp(), RING3_STACK);
    assert_eq!(g.cpu.selector(SegReg::Ds), 0);
    assert_eq!(g.cpu.selector(SegReg::Es), DATA3);
}

#[test]
fn faulting_inner_stack_push_rolls_the_call_back() {
    let mut g = with_call_gate(0);
    g.bus.unmap(0x6000..0x7000);
    let fault = g.cpu.call_far(&mut g.bus, true, GATE_SEL, 0, 0x1_0009).unwrap_err();
    assert_eq!(fault.address, Some(RING0_STACK - 4));
    assert_eq!(g.cpu.cpl, 3);
    assert_eq!(g.cpu.selector(SegReg::Cs), CODE3);
    assert_eq!(g.cpu.selector(SegReg::Ss), DATA3);
    assert_eq!(g.cpu.esp(), RING3_STACK);
    assert_eq!(g.cpu.regs.eip, 0x1_0000);
}

#[test]
fn jmp_through_a_call_gate_never_raises_privilege() {
    let mut g = with_call_gate(0);
    let fault = g.cpu.jmp_far(&mut g.bus, true, GATE_SEL, 0, 0).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(CODE0)));
}

#[test]
fn call_gate_dpl_is_checked_against_cpl_and_rpl() {
    let mut g = Guest::new();
    Descriptor::gate(CODE0, TARGET, kind::CALL_GATE_386, 0, 0)
        .save(&mut g.bus, LDT_BASE + 8)
        .unwrap();
    g.cpu.lldt(&mut g.bus, LDT_SEL).unwrap();
    g.enter_ring3(0x1_0000);
    let fault = g.cpu.call_far(&mut g.bus, true, GATE_SEL, 0, 0).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(GATE_SEL & !3)));
}

#[test]
fn ret_to_a_more_privileged_level_is_gp() {
    let mut g = Guest::new();
    g.enter_ring3(0x1_0000);
    g.cpu.push32(&mut g.bus, u32::from(CODE0)).unwrap();
    g.cpu.push32(&mut g.bus, TARGET).unwrap();
    let fault = g.cpu.ret_far(&mut g.bus, true, 0).unwrap_err();
    assert_eq!(fault, Fault::gp(u32::from(CODE0)));
    assert_eq!(g.cpu.cpl, 3);
}
