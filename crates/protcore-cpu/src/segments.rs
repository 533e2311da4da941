//! Selector validation and segment register loads.
//!
//! Checks follow the architectural priority order: null selector, table
//! limit, type, privilege, then presence.

use crate::mem::CpuBus;
use crate::regs::SegReg;
use crate::selector;
use crate::state::Cpu;
use crate::Fault;

impl Cpu {
    /// Load a data or stack segment register (MOV Sreg, POP Sreg, LDS...).
    ///
    /// Real and virtual-8086 mode loads never fault. On any fault the register
    /// keeps its previous contents.
    pub fn set_seg_general<B: CpuBus>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        value: u16,
    ) -> Result<(), Fault> {
        if !self.pmode || self.v86() {
            self.set_seg_real(seg, value);
            return Ok(());
        }
        match seg {
            SegReg::Cs => Err(Fault::ud()),
            SegReg::Ss => self.load_stack_segment(bus, value),
            _ => self.load_data_segment(bus, seg, value),
        }
    }

    fn load_stack_segment<B: CpuBus>(&mut self, bus: &mut B, value: u16) -> Result<(), Fault> {
        if selector::is_null(value) {
            return Err(Fault::gp0());
        }
        let code = selector::error_code(value);
        let desc = self.gdt.descriptor(bus, u32::from(value))?.ok_or(Fault::gp(code))?;
        if !desc.writable() {
            return Err(Fault::gp(code));
        }
        if selector::rpl(value) != self.cpl || desc.dpl() != self.cpl {
            return Err(Fault::gp(code));
        }
        if !desc.present() {
            return Err(Fault::ss(code));
        }
        self.load_ss(value, &desc);
        Ok(())
    }

    fn load_data_segment<B: CpuBus>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        value: u16,
    ) -> Result<(), Fault> {
        if selector::is_null(value) {
            self.null_seg(seg, value);
            return Ok(());
        }
        let code = selector::error_code(value);
        let desc = self.gdt.descriptor(bus, u32::from(value))?.ok_or(Fault::gp(code))?;
        if !desc.readable() {
            return Err(Fault::gp(code));
        }
        if !desc.conforming() {
            let rpl = selector::rpl(value);
            if rpl > desc.dpl() || self.cpl > desc.dpl() {
                return Err(Fault::gp(code));
            }
        }
        if !desc.present() {
            return Err(Fault::np(code));
        }
        self.load_data_seg(seg, value, &desc);
        Ok(())
    }

    /// POP into a segment register. ESP only moves if the load succeeds.
    pub fn pop_seg<B: CpuBus>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        use32: bool,
    ) -> Result<(), Fault> {
        let value = self.peek16(bus, 0)?;
        self.set_seg_general(bus, seg, value)?;
        let esp = self.stack.step(self.esp(), if use32 { 4 } else { 2 });
        self.set_esp(esp);
        Ok(())
    }

    /// After a return to an outer privilege level, null data segment
    /// registers the new CPL may not use.
    pub fn check_segments<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), Fault> {
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let sel = self.selector(seg);
            let invalid = match self.gdt.descriptor(bus, u32::from(sel))? {
                None => true,
                Some(desc) => {
                    (desc.is_data() || (desc.is_code() && !desc.conforming()))
                        && self.cpl > desc.dpl()
                }
            };
            if invalid {
                self.null_seg(seg, 0);
            }
        }
        Ok(())
    }
}
