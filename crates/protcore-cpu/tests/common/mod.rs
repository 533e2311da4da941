#![allow(dead_code)]

use protcore_cpu::descriptor::{kind, Descriptor};
use protcore_cpu::tss::tss32;
use protcore_cpu::{Cpu, CpuBus, CpuConfig, FlatTestBus, SegReg};
use tracing_subscriber::EnvFilter;

pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x2000;
pub const TSS_A: u32 = 0x3000;
pub const TSS_B: u32 = 0x3100;
pub const TSS_286: u32 = 0x3200;
pub const LDT_BASE: u32 = 0x4000;

pub const CODE0: u16 = 0x08;
pub const DATA0: u16 = 0x10;
pub const CODE1: u16 = 0x19;
pub const DATA1: u16 = 0x21;
pub const CODE3: u16 = 0x2b;
pub const DATA3: u16 = 0x33;
pub const TSS_A_SEL: u16 = 0x38;
pub const TSS_B_SEL: u16 = 0x40;
pub const LDT_SEL: u16 = 0x48;
pub const TSS_286_SEL: u16 = 0x50;
pub const CODE16: u16 = 0x58;
pub const DATA16: u16 = 0x60;

pub const RING0_STACK: u32 = 0x7000;
pub const RING1_STACK: u32 = 0x6000;
pub const RING3_STACK: u32 = 0xc000;

/// Translator tests skip on hosts without executable memory unless
/// `PROTCORE_REQUIRE_DYNCORE` is set.
pub fn skip(test_name: &str) {
    if std::env::var_os("PROTCORE_REQUIRE_DYNCORE").is_some() {
        panic!(
            "PROTCORE_REQUIRE_DYNCORE is set but {test_name} cannot run: no executable code cache"
        );
    }
    eprintln!("skipping {test_name}: host cannot execute generated code");
}

/// Route crate logs to the test output; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn flat(kind: u8, dpl: u8) -> Descriptor {
    Descriptor::segment(0, 0xfffff, kind, dpl, true, true)
}

pub fn gdt_entries() -> Vec<Descriptor> {
    vec![
        Descriptor::default(),
        flat(kind::CODE_XR_NC_A, 0),
        flat(kind::DATA_EU_RW_A, 0),
        flat(kind::CODE_XR_NC_A, 1),
        flat(kind::DATA_EU_RW_A, 1),
        flat(kind::CODE_XR_NC_A, 3),
        flat(kind::DATA_EU_RW_A, 3),
        // I/O bitmap at 0x68 covers ports 0..=255.
        Descriptor::segment(TSS_A, 0x88, kind::TSS_386_AVAILABLE, 0, false, false),
        Descriptor::segment(TSS_B, 0x67, kind::TSS_386_AVAILABLE, 0, false, false),
        Descriptor::segment(LDT_BASE, 0x0f, kind::LDT, 0, false, false),
        Descriptor::segment(TSS_286, 0x2b, kind::TSS_286_AVAILABLE, 0, false, false),
        Descriptor::segment(0, 0xffff, kind::CODE_XR_NC_A, 0, false, false),
        Descriptor::segment(0, 0xffff, kind::DATA_EU_RW_A, 0, false, false),
    ]
}

/// A ring-0 flat protected-mode CPU with TSS A loaded.
pub struct Guest {
    pub cpu: Cpu,
    pub bus: FlatTestBus,
}

impl Guest {
    pub fn new() -> Self {
        Self::with_config(&CpuConfig::default())
    }

    pub fn with_config(config: &CpuConfig) -> Self {
        init_tracing();
        let mut bus = FlatTestBus::new(0x2_0000);
        let entries = gdt_entries();
        for (i, d) in entries.iter().enumerate() {
            d.save(&mut bus, GDT_BASE + i as u32 * 8).unwrap();
        }
        bus.write_u32(TSS_A + tss32::ESP0, RING0_STACK).unwrap();
        bus.write_u16(TSS_A + tss32::SS0, DATA0).unwrap();
        bus.write_u32(TSS_A + tss32::ESP0 + 8, RING1_STACK).unwrap();
        bus.write_u16(TSS_A + tss32::SS0 + 8, DATA1).unwrap();
        bus.write_u16(TSS_A + tss32::IO_MAP_BASE, 0x68).unwrap();

        let mut cpu = Cpu::new(config);
        cpu.lgdt(entries.len() as u16 * 8 - 1, GDT_BASE).unwrap();
        cpu.lidt(0x7ff, IDT_BASE).unwrap();
        cpu.write_cr0(&mut bus, 1);
        cpu.jmp_far(&mut bus, true, CODE0, 0x1_0000, 0).unwrap();
        for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
            cpu.set_seg_general(&mut bus, seg, DATA0).unwrap();
        }
        cpu.set_esp(0x8000);
        cpu.ltr(&mut bus, TSS_A_SEL).unwrap();
        Self { cpu, bus }
    }

    pub fn set_gate(&mut self, vector: u8, sel: u16, offset: u32, kind: u8, dpl: u8) {
        Descriptor::gate(sel, offset, kind, dpl, 0)
            .save(&mut self.bus, IDT_BASE + u32::from(vector) * 8)
            .unwrap();
    }

    pub fn gdt_entry(&mut self, sel: u16) -> Descriptor {
        Descriptor::load(&mut self.bus, GDT_BASE + u32::from(sel & !7)).unwrap()
    }

    pub fn set_gdt_entry(&mut self, sel: u16, desc: Descriptor) {
        desc.save(&mut self.bus, GDT_BASE + u32::from(sel & !7)).unwrap();
    }

    /// Fill a 32-bit TSS image with flat ring-0 segments and code selector `cs`.
    pub fn prepare_task32(&mut self, base: u32, eip: u32, cs: u16, esp: u32) {
        let bus = &mut self.bus;
        bus.write_u32(base.wrapping_add(tss32::EIP), eip).unwrap();
        bus.write_u32(base.wrapping_add(tss32::EFLAGS), 0x2).unwrap();
        bus.write_u32(base.wrapping_add(tss32::GPRS), 0xb0b).unwrap();
        bus.write_u32(base.wrapping_add(tss32::GPRS + 4 * 4), esp).unwrap();
        // ES, CS, SS, DS, FS, GS
        for (i, sel) in [DATA0, cs, DATA0, DATA0, 0, 0].into_iter().enumerate() {
            bus.write_u16(base.wrapping_add(tss32::SEGS + 4 * i as u32), sel).unwrap();
        }
    }

    /// Drop to ring 3 at `eip` with a RETF to an outer level.
    pub fn enter_ring3(&mut self, eip: u32) {
        let cpu = &mut self.cpu;
        let bus = &mut self.bus;
        cpu.push32(bus, u32::from(DATA3)).unwrap();
        cpu.push32(bus, RING3_STACK).unwrap();
        cpu.push32(bus, u32::from(CODE3)).unwrap();
        cpu.push32(bus, eip).unwrap();
        cpu.ret_far(bus, true, 0).unwrap();
        cpu.set_seg_general(bus, SegReg::Ds, DATA3).unwrap();
        cpu.set_seg_general(bus, SegReg::Es, DATA3).unwrap();
        assert_eq!(cpu.cpl, 3);
    }
}
