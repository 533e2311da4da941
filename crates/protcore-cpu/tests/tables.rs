mod common;

use common::{Guest, LDT_BASE, LDT_SEL};
use proptest::prelude::*;
use protcore_cpu::descriptor::{kind, Descriptor};
use protcore_cpu::{Exception, SegReg};

proptest! {
    #[test]
    fn lookup_succeeds_exactly_below_the_routed_limit(sel in any::<u16>()) {
        let mut g = Guest::new();
        g.cpu.lldt(&mut g.bus, LDT_SEL).unwrap();
        let offset = u32::from(sel & !7);
        let limit = if sel & 4 != 0 { g.cpu.gdt.ldt_limit() } else { g.cpu.gdt.table.limit };
        let found = g.cpu.gdt.descriptor(&mut g.bus, u32::from(sel)).unwrap();
        prop_assert_eq!(found.is_some(), offset < limit);
    }
}

#[test]
fn lldt_null_always_clears() {
    let mut g = Guest::new();
    g.cpu.lldt(&mut g.bus, LDT_SEL).unwrap();
    assert_eq!(g.cpu.gdt.ldt_base(), LDT_BASE);
    g.cpu.lldt(&mut g.bus, 0).unwrap();
    assert_eq!((g.cpu.gdt.ldt_base(), g.cpu.gdt.ldt_limit(), g.cpu.sldt()), (0, 0, 0));
}

#[test]
fn lldt_of_a_data_descriptor_is_gp_with_the_selector() {
    let mut g = Guest::new();
    let fault = g.cpu.lldt(&mut g.bus, common::DATA0).unwrap_err();
    assert_eq!(fault.exception, Exception::GeneralProtection);
    assert_eq!(fault.error_code, u32::from(common::DATA0));
}

#[test]
fn lldt_needs_ring_zero() {
    let mut g = Guest::new();
    g.enter_ring3(0x1_0000);
    let fault = g.cpu.lldt(&mut g.bus, LDT_SEL).unwrap_err();
    assert_eq!(fault, protcore_cpu::Fault::gp0());
}

#[test]
fn ldt_selectors_load_through_the_cached_ldt() {
    let mut g = Guest::new();
    Descriptor::segment(0x5000, 0xfff, kind::DATA_EU_RW_A, 0, false, false)
        .save(&mut g.bus, LDT_BASE + 8)
        .unwrap();
    g.cpu.lldt(&mut g.bus, LDT_SEL).unwrap();
    g.cpu.set_seg_general(&mut g.bus, SegReg::Fs, 0x0c).unwrap();
    assert_eq!(g.cpu.seg_base(SegReg::Fs), 0x5000);

    // Rewriting the LDT descriptor in the GDT changes nothing until the next LLDT.
    g.set_gdt_entry(LDT_SEL, Descriptor::segment(0x9000, 0x0f, kind::LDT, 0, false, false));
    assert_eq!(g.cpu.gdt.ldt_base(), LDT_BASE);
}
