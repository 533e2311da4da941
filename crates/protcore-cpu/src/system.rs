//! Descriptor-table registers, selector probes and the IF/EFLAGS
//! instructions.
//!
//! The probe instructions (LAR, LSL, VERR, VERW, ARPL) report success in ZF
//! and never fault on a bad selector; only memory errors while reading the
//! descriptor propagate.

use tracing::{debug, warn};

use crate::descriptor::{kind, Descriptor};
use crate::exec::{Decoder, DispatchError};
use crate::flags::{FLAG_IF, FLAG_IOPL, FLAG_ZF, FMASK_ALL};
use crate::mem::CpuBus;
use crate::regs::SegReg;
use crate::selector;
use crate::state::{Cpu, HaltSnapshot};
use crate::tables::DescriptorTable;
use crate::Fault;

impl Cpu {
    fn require_ring0(&self) -> Result<(), Fault> {
        if self.pmode && self.cpl > 0 {
            Err(Fault::gp0())
        } else {
            Ok(())
        }
    }

    pub fn lgdt(&mut self, limit: u16, base: u32) -> Result<(), Fault> {
        self.require_ring0()?;
        debug!(base, limit, "gdt");
        self.gdt.table = DescriptorTable::new(base, u32::from(limit));
        Ok(())
    }

    pub fn lidt(&mut self, limit: u16, base: u32) -> Result<(), Fault> {
        self.require_ring0()?;
        debug!(base, limit, "idt");
        self.idt = DescriptorTable::new(base, u32::from(limit));
        Ok(())
    }

    /// `(limit, base)` of the GDT.
    pub fn sgdt(&self) -> (u16, u32) {
        (self.gdt.table.limit as u16, self.gdt.table.base)
    }

    pub fn sidt(&self) -> (u16, u32) {
        (self.idt.limit as u16, self.idt.base)
    }

    pub fn sldt(&self) -> u16 {
        self.gdt.sldt()
    }

    pub fn lldt<B: CpuBus>(&mut self, bus: &mut B, value: u16) -> Result<(), Fault> {
        self.require_ring0()?;
        self.gdt.lldt(bus, value).inspect_err(|fault| {
            warn!(selector = value, ?fault, "lldt failed");
        })
    }

    pub fn str(&self) -> u16 {
        self.tss.selector
    }

    /// Load the task register. The target must be an available TSS in the
    /// GDT; it is marked busy.
    pub fn ltr<B: CpuBus>(&mut self, bus: &mut B, value: u16) -> Result<(), Fault> {
        self.require_ring0()?;
        if selector::is_null(value) {
            self.tss.set_selector(bus, &self.gdt, 0)?;
            return Ok(());
        }
        let code = u32::from(value);
        if selector::uses_ldt(value) {
            return Err(Fault::gp(code));
        }
        let desc = self.gdt.descriptor(bus, code)?.ok_or(Fault::gp(code))?;
        if !matches!(desc.kind(), kind::TSS_286_AVAILABLE | kind::TSS_386_AVAILABLE) {
            debug!(selector = value, kind = desc.kind(), "ltr of non-available tss");
            return Err(Fault::gp(code));
        }
        if !desc.present() {
            return Err(Fault::np(code));
        }
        let mut tss = self.tss;
        if !tss.set_selector(bus, &self.gdt, value)? {
            return Err(Fault::gp(code));
        }
        tss.desc.set_tss_busy(true);
        self.gdt.set_descriptor(bus, code, &tss.desc)?;
        self.tss = tss;
        Ok(())
    }

    /// Descriptor a probe instruction may look at, if any.
    fn probe<B: CpuBus>(&self, bus: &mut B, sel: u16) -> Result<Option<Descriptor>, Fault> {
        if sel == 0 {
            return Ok(None);
        }
        self.gdt.descriptor(bus, u32::from(sel))
    }

    fn visible_at(&self, sel: u16, desc: &Descriptor) -> bool {
        desc.conforming() || (desc.dpl() >= self.cpl && desc.dpl() >= selector::rpl(sel))
    }

    fn report(&mut self, ok: bool) -> bool {
        self.set_flag(FLAG_ZF, ok);
        ok
    }

    /// LAR: access rights (bits 8..23 of the high dword) or `None`.
    pub fn lar<B: CpuBus>(&mut self, bus: &mut B, sel: u16) -> Result<Option<u32>, Fault> {
        let found = self.probe(bus, sel)?.filter(|desc| {
            let listed = desc.is_segment()
                || matches!(
                    desc.kind(),
                    kind::LDT
                        | kind::TASK_GATE
                        | kind::TSS_286_AVAILABLE
                        | kind::TSS_286_BUSY
                        | kind::CALL_GATE_286
                        | kind::TSS_386_AVAILABLE
                        | kind::TSS_386_BUSY
                        | kind::CALL_GATE_386
                );
            listed && self.visible_at(sel, desc)
        });
        self.report(found.is_some());
        Ok(found.map(|desc| desc.access_rights()))
    }

    /// LSL: byte-granular limit or `None`.
    pub fn lsl<B: CpuBus>(&mut self, bus: &mut B, sel: u16) -> Result<Option<u32>, Fault> {
        let found = self.probe(bus, sel)?.filter(|desc| {
            let listed = desc.is_segment() || desc.kind() == kind::LDT || desc.is_tss();
            listed && self.visible_at(sel, desc)
        });
        self.report(found.is_some());
        Ok(found.map(|desc| desc.limit()))
    }

    pub fn verr<B: CpuBus>(&mut self, bus: &mut B, sel: u16) -> Result<bool, Fault> {
        let ok = self
            .probe(bus, sel)?
            .is_some_and(|desc| desc.readable() && self.visible_at(sel, &desc));
        Ok(self.report(ok))
    }

    pub fn verw<B: CpuBus>(&mut self, bus: &mut B, sel: u16) -> Result<bool, Fault> {
        let ok = self.probe(bus, sel)?.is_some_and(|desc| {
            desc.writable() && desc.dpl() >= self.cpl && desc.dpl() >= selector::rpl(sel)
        });
        Ok(self.report(ok))
    }

    /// ARPL: raise `dest`'s RPL to `src`'s. ZF reports whether it changed.
    pub fn arpl(&mut self, dest: u16, src: u16) -> u16 {
        if selector::rpl(dest) < selector::rpl(src) {
            self.report(true);
            selector::with_rpl(dest, selector::rpl(src))
        } else {
            self.report(false);
            dest
        }
    }

    fn if_denied(&self) -> bool {
        self.pmode && ((!self.v86() && self.iopl() < self.cpl) || (self.v86() && self.iopl() < 3))
    }

    pub fn cli(&mut self) -> Result<(), Fault> {
        if self.if_denied() {
            return Err(Fault::gp0());
        }
        self.set_flag(FLAG_IF, false);
        Ok(())
    }

    /// STI. Enabling IF holds maskable interrupts off for one instruction.
    pub fn sti(&mut self) -> Result<(), Fault> {
        if self.if_denied() {
            return Err(Fault::gp0());
        }
        if !self.flag(FLAG_IF) {
            self.events.interrupt_shadow = true;
        }
        self.set_flag(FLAG_IF, true);
        Ok(())
    }

    pub fn pushf<B: CpuBus>(&mut self, bus: &mut B, use32: bool) -> Result<(), Fault> {
        if self.pmode && self.v86() && self.iopl() != 3 {
            return Err(Fault::gp0());
        }
        if use32 {
            // VM and RF always read as clear.
            self.push32(bus, self.regs.flags & 0x00fc_ffff)
        } else {
            self.push16(bus, self.regs.flags as u16)
        }
    }

    pub fn popf<B: CpuBus>(&mut self, bus: &mut B, use32: bool) -> Result<(), Fault> {
        if self.pmode && self.v86() && self.iopl() != 3 {
            return Err(Fault::gp0());
        }
        let mut mask = FMASK_ALL;
        if self.pmode && self.cpl > 0 {
            mask &= !FLAG_IOPL;
        }
        if self.pmode && !self.v86() && self.iopl() < self.cpl {
            mask &= !FLAG_IF;
        }
        if use32 {
            let word = self.pop32(bus)?;
            self.set_flags(word, mask);
        } else {
            let word = self.pop16(bus)?;
            self.set_flags(u32::from(word), mask & 0xffff);
        }
        Ok(())
    }

    /// HLT: park at `old_eip` until an interrupt moves CS:EIP.
    pub fn hlt(&mut self, old_eip: u32, resume: Decoder) -> Result<(), DispatchError> {
        if self.hlt.is_some() || resume == Decoder::Halt {
            return Err(DispatchError::AlreadyHalted);
        }
        self.regs.eip = old_eip;
        self.hlt = Some(HaltSnapshot {
            cs: self.selector(SegReg::Cs),
            eip: old_eip,
            resume,
        });
        Ok(())
    }

    /// HLT privilege check, separate from entering the halt state.
    pub fn check_hlt(&self) -> Result<(), Fault> {
        self.require_ring0()
    }
}

#[cfg(test)]
mod tests {
    use crate::descriptor::{kind, Descriptor};
    use crate::flags::{FLAG_IF, FLAG_IOPL, FLAG_ZF};
    use crate::mem::FlatTestBus;
    use crate::state::Cpu;
    use crate::tables::DescriptorTable;
    use crate::{CpuConfig, Exception};

    fn protected(entries: &[Descriptor]) -> (Cpu, FlatTestBus) {
        let mut bus = FlatTestBus::new(0x1_0000);
        for (i, d) in entries.iter().enumerate() {
            d.save(&mut bus, 0x800 + i as u32 * 8).unwrap();
        }
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.pmode = true;
        cpu.gdt.table = DescriptorTable::new(0x800, entries.len() as u32 * 8 - 1);
        (cpu, bus)
    }

    #[test]
    fn lar_hides_interrupt_gates_and_more_privileged_data() {
        let (mut cpu, mut bus) = protected(&[
            Descriptor::default(),
            Descriptor::gate(0x8, 0, kind::INT_GATE_386, 3, 0),
            Descriptor::segment(0, 0xffff, kind::DATA_EU_RW_A, 0, false, false),
            Descriptor::segment(0, 0xffff, kind::DATA_EU_RW_A, 3, false, false),
        ]);
        cpu.cpl = 3;
        assert_eq!(cpu.lar(&mut bus, 0x0b).unwrap(), None);
        assert!(!cpu.flag(FLAG_ZF));
        assert_eq!(cpu.lar(&mut bus, 0x13).unwrap(), None);
        let ar = cpu.lar(&mut bus, 0x1b).unwrap().unwrap();
        assert_eq!(ar, 0x0000_f300);
        assert!(cpu.flag(FLAG_ZF));
    }

    #[test]
    fn lsl_scales_page_granular_limits() {
        let (mut cpu, mut bus) = protected(&[
            Descriptor::default(),
            Descriptor::segment(0, 0xf, kind::DATA_EU_RW_A, 0, true, true),
        ]);
        assert_eq!(cpu.lsl(&mut bus, 0x08).unwrap(), Some(0xffff));
        assert_eq!(cpu.lsl(&mut bus, 0).unwrap(), None);
    }

    #[test]
    fn verw_rejects_code_and_read_only_data() {
        let (mut cpu, mut bus) = protected(&[
            Descriptor::default(),
            Descriptor::segment(0, 0xffff, kind::CODE_XR_NC_A, 0, false, false),
            Descriptor::segment(0, 0xffff, kind::DATA_EU_RO_A, 0, false, false),
            Descriptor::segment(0, 0xffff, kind::DATA_EU_RW_A, 0, false, false),
        ]);
        assert!(cpu.verr(&mut bus, 0x08).unwrap());
        assert!(!cpu.verw(&mut bus, 0x08).unwrap());
        assert!(!cpu.verw(&mut bus, 0x10).unwrap());
        assert!(cpu.verw(&mut bus, 0x18).unwrap());
    }

    #[test]
    fn arpl_raises_rpl_only_upward() {
        let mut cpu = Cpu::new(&CpuConfig::default());
        assert_eq!(cpu.arpl(0x0008, 0x0003), 0x000b);
        assert!(cpu.flag(FLAG_ZF));
        assert_eq!(cpu.arpl(0x000b, 0x0001), 0x000b);
        assert!(!cpu.flag(FLAG_ZF));
    }

    #[test]
    fn ltr_marks_tss_busy_and_rejects_busy_tss() {
        let (mut cpu, mut bus) = protected(&[
            Descriptor::default(),
            Descriptor::segment(0x2000, 0x67, kind::TSS_386_AVAILABLE, 0, false, false),
        ]);
        cpu.ltr(&mut bus, 0x08).unwrap();
        assert_eq!(cpu.str(), 0x08);
        let stored = Descriptor::load(&mut bus, 0x808).unwrap();
        assert_eq!(stored.kind(), kind::TSS_386_BUSY);
        let err = cpu.ltr(&mut bus, 0x08).unwrap_err();
        assert_eq!((err.exception, err.error_code), (Exception::GeneralProtection, 0x08));
    }

    #[test]
    fn cli_needs_iopl_in_protected_mode() {
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.pmode = true;
        cpu.cpl = 3;
        assert!(cpu.cli().is_err());
        cpu.regs.flags |= FLAG_IOPL;
        cpu.cli().unwrap();
        assert!(!cpu.flag(FLAG_IF));
    }

    #[test]
    fn sti_opens_an_interrupt_shadow() {
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.cli().unwrap();
        cpu.sti().unwrap();
        assert!(cpu.events.interrupt_shadow);
    }

    #[test]
    fn popf_at_ring3_cannot_change_iopl() {
        let mut bus = FlatTestBus::new(0x1_0000);
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.set_esp(0x100);
        cpu.push32(&mut bus, FLAG_IOPL | FLAG_IF).unwrap();
        cpu.pmode = true;
        cpu.cpl = 3;
        cpu.popf(&mut bus, true).unwrap();
        assert_eq!(cpu.iopl(), 0);
        // IOPL 0 < CPL 3 also pins IF.
        assert!(cpu.flag(FLAG_IF));
    }
}
