use proptest::prelude::*;
use protcore_cpu::descriptor::{kind, Descriptor};
use protcore_cpu::{CpuBus, FlatTestBus};

proptest! {
    #[test]
    fn load_then_save_preserves_every_bit(raw in any::<u64>(), slot in 0u32..64) {
        let mut bus = FlatTestBus::new(0x400);
        let addr = slot * 8;
        bus.write_u32(addr, raw as u32).unwrap();
        bus.write_u32(addr + 4, (raw >> 32) as u32).unwrap();

        let desc = Descriptor::load(&mut bus, addr).unwrap();
        prop_assert_eq!(desc.raw(), raw);
        desc.save(&mut bus, addr).unwrap();
        let expected = raw.to_le_bytes();
        prop_assert_eq!(bus.slice(addr, 8), &expected[..]);
    }

    #[test]
    fn granular_limits_fill_the_low_page_bits(raw_limit in 0u32..=0xfffff) {
        let page = Descriptor::segment(0, raw_limit, kind::DATA_EU_RW_A, 0, false, true);
        prop_assert_eq!(page.limit(), (raw_limit << 12) | 0xfff);
        let byte = Descriptor::segment(0, raw_limit, kind::DATA_EU_RW_A, 0, false, false);
        prop_assert_eq!(byte.limit(), raw_limit);
    }

    #[test]
    fn segment_fields_survive_packing(
        base in any::<u32>(),
        raw_limit in 0u32..=0xfffff,
        ty in 0x10u8..=0x1f,
        dpl in 0u8..4,
        big in any::<bool>(),
        granular in any::<bool>(),
    ) {
        let d = Descriptor::segment(base, raw_limit, ty, dpl, big, granular);
        prop_assert_eq!(d.base(), base);
        prop_assert_eq!(d.raw_limit(), raw_limit);
        prop_assert_eq!(d.kind(), ty);
        prop_assert_eq!(d.dpl(), dpl);
        prop_assert_eq!(d.big(), big);
        prop_assert_eq!(d.granular(), granular);
        prop_assert!(d.present());
    }
}

#[test]
fn page_granular_limit_of_one_is_two_pages_minus_one() {
    let d = Descriptor::segment(0, 0x001, kind::DATA_EU_RW_A, 0, false, true);
    assert_eq!(d.limit(), 0x1fff);
}

#[test]
fn system_type_values_are_bit_exact() {
    assert_eq!(kind::TSS_286_AVAILABLE, 1);
    assert_eq!(kind::LDT, 2);
    assert_eq!(kind::TSS_286_BUSY, 3);
    assert_eq!(kind::CALL_GATE_286, 4);
    assert_eq!(kind::TASK_GATE, 5);
    assert_eq!(kind::INT_GATE_286, 6);
    assert_eq!(kind::TRAP_GATE_286, 7);
    assert_eq!(kind::TSS_386_AVAILABLE, 9);
    assert_eq!(kind::TSS_386_BUSY, 0xb);
    assert_eq!(kind::CALL_GATE_386, 0xc);
    assert_eq!(kind::INT_GATE_386, 0xe);
    assert_eq!(kind::TRAP_GATE_386, 0xf);
}
