//! The per-guest CPU context.
//!
//! Every operation in this crate takes `&mut Cpu` (plus a bus) explicitly; there
//! is no global CPU state. One `Cpu` exists per emulated processor for the
//! lifetime of the VM.

use crate::arch::CpuArch;
use crate::control::CR0_FPU_PRESENT;
use crate::descriptor::Descriptor;
use crate::exec::Decoder;
use crate::flags::{FLAG_IF, FLAG_RESERVED1};
use crate::interrupts::{EventState, NmiState};
use crate::mem::CpuBus;
use crate::regs::{RegisterFile, SegReg, SegmentCache, SegmentRegisters};
use crate::stack::StackAttrs;
use crate::tables::{DescriptorTable, Gdt};
use crate::tss::TaskStateSegment;
use crate::CpuConfig;

/// Where a halted CPU resumes and which core it resumes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltSnapshot {
    pub cs: u16,
    pub eip: u32,
    pub resume: Decoder,
}

/// The most recently raised exception, as recorded for delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub which: u8,
    pub error: u32,
}

/// Behaviour switches taken from [`CpuConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuOptions {
    pub double_fault: bool,
    pub reset_on_triple_fault: bool,
    pub always_report_double_fault: bool,
    pub realbig16: bool,
    pub segment_limits: bool,
}

impl From<&CpuConfig> for CpuOptions {
    fn from(config: &CpuConfig) -> Self {
        Self {
            double_fault: config.double_fault,
            reset_on_triple_fault: config.reset_on_triple_fault,
            always_report_double_fault: config.always_report_double_fault,
            realbig16: config.realbig16,
            segment_limits: config.segment_limits,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub regs: RegisterFile,
    pub segs: SegmentRegisters,
    pub cpl: u8,
    /// Privilege used for supervisor accesses to system tables.
    pub mpl: u8,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub pmode: bool,
    pub gdt: Gdt,
    pub idt: DescriptorTable,
    pub tss: TaskStateSegment,
    pub stack: StackAttrs,
    pub code_big: bool,
    pub hlt: Option<HaltSnapshot>,
    pub exception: ExceptionRecord,
    pub(crate) direction: i32,
    /// Suppresses the single-step trap after the current instruction.
    pub trap_skip: bool,
    pub drx: [u32; 8],
    pub trx: [u32; 8],
    pub nmi: NmiState,
    pub events: EventState,
    pub arch: CpuArch,
    pub options: CpuOptions,
    /// Set when CR0.PE is first turned on; the `auto` core watches it.
    pub(crate) entered_pmode: bool,
}

impl Cpu {
    pub fn new(config: &CpuConfig) -> Self {
        let mut cpu = Self {
            regs: RegisterFile::default(),
            segs: SegmentRegisters::default(),
            cpl: 0,
            mpl: 0,
            cr0: CR0_FPU_PRESENT,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            pmode: false,
            gdt: Gdt::default(),
            idt: DescriptorTable::new(0, 0x3ff),
            tss: TaskStateSegment::default(),
            stack: StackAttrs::default(),
            code_big: false,
            hlt: None,
            exception: ExceptionRecord::default(),
            direction: 1,
            trap_skip: false,
            drx: [0; 8],
            trx: [0; 8],
            nmi: NmiState::default(),
            events: EventState::default(),
            arch: config.cputype.arch,
            options: CpuOptions::from(config),
            entered_pmode: false,
        };
        cpu.init_registers();
        cpu
    }

    fn init_registers(&mut self) {
        let limit = self.real_limit();
        for seg in SegReg::ALL {
            self.segs.set(seg, SegmentCache::real(0, limit));
        }
        self.regs = RegisterFile::default();
        self.regs.flags = FLAG_IF | FLAG_RESERVED1;
        self.direction = 1;
        self.stack = StackAttrs::default();
        self.code_big = false;
        self.idt = DescriptorTable::new(0, 0x3ff);
        self.gdt = Gdt::default();
        self.tss = TaskStateSegment::default();
        self.drx = [0; 8];
        self.drx[6] = if self.arch >= CpuArch::Pentium { 0xffff_0ff0 } else { 0xffff_1ff0 };
        self.drx[7] = 0x0000_0400;
        self.trx = [0; 8];
        self.hlt = None;
        self.nmi = NmiState::default();
        self.events = EventState::default();
        self.exception = ExceptionRecord::default();
        self.trap_skip = false;
    }

    /// Hardware reset: clear protection state and jump to the reset vector.
    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        self.init_registers();
        self.set_cpl(bus, 0);
        self.mpl = 0;
        self.cr0 = 0xffff_ffff;
        // Rebuilding CR0 through the write path also drops paging.
        self.write_cr0(bus, 0);
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.entered_pmode = false;

        if self.arch >= CpuArch::I386 {
            self.segs.set(
                SegReg::Cs,
                SegmentCache {
                    selector: 0xf000,
                    base: 0xffff_0000,
                    limit: 0xffff,
                    expand_down: false,
                    big: false,
                },
            );
            self.regs.eip = 0xfff0;
        } else if self.arch == CpuArch::I286 {
            self.segs.set(SegReg::Cs, SegmentCache::real(0xf000, 0xffff));
            self.regs.eip = 0xfff0;
        } else {
            self.segs.set(SegReg::Cs, SegmentCache::real(0xffff, 0xffff));
            self.regs.eip = 0;
        }
    }

    /// Segment limit used for real-mode and virtual-8086 loads.
    pub(crate) fn real_limit(&self) -> u32 {
        if self.options.segment_limits {
            0xffff
        } else {
            0xffff_ffff
        }
    }

    pub(crate) fn desc_limit(&self, desc: &Descriptor) -> u32 {
        if self.options.segment_limits {
            desc.limit()
        } else {
            0xffff_ffff
        }
    }

    pub fn set_cpl<B: CpuBus>(&mut self, bus: &mut B, cpl: u8) {
        if cpl != self.cpl {
            if (self.cpl == 3) != (cpl == 3) {
                bus.set_user_mode(cpl == 3);
            }
            self.cpl = cpl;
        }
    }

    pub fn selector(&self, seg: SegReg) -> u16 {
        self.segs.selector(seg)
    }

    pub fn seg_base(&self, seg: SegReg) -> u32 {
        self.segs.base(seg)
    }

    /// Linear address of `seg:offset`.
    pub fn linear(&self, seg: SegReg, offset: u32) -> u32 {
        self.segs.base(seg).wrapping_add(offset)
    }

    pub fn eip(&self) -> u32 {
        self.regs.eip
    }

    /// Load a segment register with real-mode semantics (`base = sel << 4`).
    pub fn set_seg_real(&mut self, seg: SegReg, sel: u16) {
        let limit = self.real_limit();
        let mut cache = SegmentCache::real(sel, limit);
        if seg == SegReg::Ss {
            self.stack.set_big(false);
        }
        if seg == SegReg::Cs {
            if !self.options.realbig16 {
                self.code_big = false;
            }
            cache.big = self.code_big;
        }
        self.segs.set(seg, cache);
    }

    /// Commit CS from a validated code descriptor. RPL is replaced by CPL.
    pub(crate) fn load_cs(&mut self, sel: u16, desc: &Descriptor) {
        let limit = self.desc_limit(desc);
        self.code_big = desc.big();
        self.segs.set(
            SegReg::Cs,
            SegmentCache {
                selector: (sel & 0xfffc) | u16::from(self.cpl),
                base: desc.base(),
                limit,
                expand_down: false,
                big: desc.big(),
            },
        );
    }

    /// Commit SS from a validated writable data descriptor.
    pub(crate) fn load_ss(&mut self, sel: u16, desc: &Descriptor) {
        let limit = self.desc_limit(desc);
        self.stack.set_big(desc.big());
        self.segs.set(
            SegReg::Ss,
            SegmentCache {
                selector: sel,
                base: desc.base(),
                limit,
                expand_down: desc.expand_down(),
                big: desc.big(),
            },
        );
    }

    pub(crate) fn load_data_seg(&mut self, seg: SegReg, sel: u16, desc: &Descriptor) {
        let limit = self.desc_limit(desc);
        self.segs.set(
            seg,
            SegmentCache {
                selector: sel,
                base: desc.base(),
                limit,
                expand_down: desc.expand_down(),
                big: desc.big(),
            },
        );
    }

    pub(crate) fn null_seg(&mut self, seg: SegReg, sel: u16) {
        self.segs.set(
            seg,
            SegmentCache {
                selector: sel,
                base: 0,
                limit: 0,
                expand_down: false,
                big: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::Cpu;
    use crate::arch::CpuArch;
    use crate::mem::FlatTestBus;
    use crate::regs::SegReg;
    use crate::CpuConfig;

    #[test]
    fn reset_vector_depends_on_generation() {
        let mut bus = FlatTestBus::new(16);
        let mut cpu = Cpu::new(&CpuConfig::default());

        cpu.arch = CpuArch::I386;
        cpu.reset(&mut bus);
        assert_eq!(cpu.linear(SegReg::Cs, cpu.eip()), 0xffff_fff0);

        cpu.arch = CpuArch::I286;
        cpu.reset(&mut bus);
        assert_eq!(cpu.linear(SegReg::Cs, cpu.eip()), 0x000f_fff0);

        cpu.arch = CpuArch::I8086;
        cpu.reset(&mut bus);
        assert_eq!((cpu.selector(SegReg::Cs), cpu.eip()), (0xffff, 0));
    }

    #[test]
    fn reset_leaves_real_mode_with_fpu_present() {
        let mut bus = FlatTestBus::new(16);
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.reset(&mut bus);
        assert!(!cpu.pmode);
        assert_eq!(cpu.cr0 & 0x10, 0x10);
        assert!(!bus.paging);
        assert_eq!(cpu.drx[7], 0x400);
    }
}
