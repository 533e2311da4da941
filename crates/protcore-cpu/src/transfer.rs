//! Far JMP, CALL and RET, including call gates and task switches.

use tracing::debug;

use crate::descriptor::{kind, Descriptor};
use crate::mem::CpuBus;
use crate::regs::{Reg32, SegReg, SegmentCache};
use crate::selector;
use crate::stack::StackAttrs;
use crate::state::Cpu;
use crate::tss::TaskSwitch;
use crate::Fault;

/// Architectural state a far CALL may have half-written when a push faults.
#[derive(Clone, Copy)]
struct TransferSnapshot {
    cs: SegmentCache,
    ss: SegmentCache,
    stack: StackAttrs,
    esp: u32,
    eip: u32,
    cpl: u8,
    code_big: bool,
}

impl Cpu {
    fn snapshot_transfer(&self) -> TransferSnapshot {
        TransferSnapshot {
            cs: *self.segs.get(SegReg::Cs),
            ss: *self.segs.get(SegReg::Ss),
            stack: self.stack,
            esp: self.esp(),
            eip: self.regs.eip,
            cpl: self.cpl,
            code_big: self.code_big,
        }
    }

    fn restore_transfer<B: CpuBus>(&mut self, bus: &mut B, snap: TransferSnapshot) {
        self.segs.set(SegReg::Cs, snap.cs);
        self.segs.set(SegReg::Ss, snap.ss);
        self.stack = snap.stack;
        self.set_esp(snap.esp);
        self.regs.eip = snap.eip;
        self.set_cpl(bus, snap.cpl);
        self.code_big = snap.code_big;
    }

    fn far_target<B: CpuBus>(&self, bus: &mut B, sel: u16) -> Result<Descriptor, Fault> {
        if selector::is_null(sel) {
            return Err(Fault::gp0());
        }
        self.gdt
            .descriptor(bus, u32::from(sel))?
            .ok_or(Fault::gp(selector::error_code(sel)))
    }

    /// Privilege and presence checks for a direct far transfer to a code
    /// segment at the current privilege level.
    fn check_direct_code(&self, sel: u16, desc: &Descriptor) -> Result<(), Fault> {
        let code = selector::error_code(sel);
        if desc.conforming() {
            if desc.dpl() > self.cpl {
                return Err(Fault::gp(code));
            }
        } else if selector::rpl(sel) > self.cpl || desc.dpl() != self.cpl {
            return Err(Fault::gp(code));
        }
        if !desc.present() {
            return Err(Fault::np(code));
        }
        Ok(())
    }

    /// System descriptors reached by JMP/CALL must be at least as privileged
    /// as both CPL and RPL and present.
    fn check_system_target(&self, sel: u16, desc: &Descriptor) -> Result<(), Fault> {
        let code = selector::error_code(sel);
        if desc.dpl() < self.cpl || desc.dpl() < selector::rpl(sel) {
            return Err(Fault::gp(code));
        }
        if !desc.present() {
            return Err(Fault::np(code));
        }
        Ok(())
    }

    /// Code segment named by a call gate.
    fn gate_target<B: CpuBus>(
        &self,
        bus: &mut B,
        gate: &Descriptor,
    ) -> Result<(u16, Descriptor), Fault> {
        let sel = gate.selector();
        if selector::is_null(sel) {
            return Err(Fault::gp0());
        }
        let code = selector::error_code(sel);
        let desc = self.gdt.descriptor(bus, u32::from(sel))?.ok_or(Fault::gp(code))?;
        if !desc.is_code() || desc.dpl() > self.cpl {
            return Err(Fault::gp(code));
        }
        if !desc.present() {
            return Err(Fault::np(code));
        }
        Ok((sel, desc))
    }

    fn enter_code(&mut self, sel: u16, desc: &Descriptor, offset: u32, use32: bool) {
        self.load_cs(sel, desc);
        self.regs.eip = if use32 { offset } else { offset & 0xffff };
    }

    /// JMP ptr16:16/32.
    pub fn jmp_far<B: CpuBus>(
        &mut self,
        bus: &mut B,
        use32: bool,
        sel: u16,
        offset: u32,
        old_eip: u32,
    ) -> Result<(), Fault> {
        if !self.pmode || self.v86() {
            self.regs.eip = if use32 { offset } else { offset & 0xffff };
            self.set_seg_real(SegReg::Cs, sel);
            return Ok(());
        }
        let desc = self.far_target(bus, sel)?;
        if desc.is_code() {
            self.check_direct_code(sel, &desc)?;
            self.enter_code(sel, &desc, offset, use32);
            return Ok(());
        }
        match desc.kind() {
            kind::TSS_286_AVAILABLE
            | kind::TSS_386_AVAILABLE
            | kind::TSS_286_BUSY
            | kind::TSS_386_BUSY => {
                self.check_system_target(sel, &desc)?;
                debug!(selector = sel, "jmp to tss");
                self.switch_task(bus, sel, TaskSwitch::Jmp, old_eip)
            }
            kind::TASK_GATE => {
                self.check_system_target(sel, &desc)?;
                self.switch_task(bus, desc.selector(), TaskSwitch::Jmp, old_eip)
            }
            kind::CALL_GATE_286 | kind::CALL_GATE_386 => {
                self.check_system_target(sel, &desc)?;
                let (cs, cs_desc) = self.gate_target(bus, &desc)?;
                // JMP never changes privilege.
                if !cs_desc.conforming() && cs_desc.dpl() != self.cpl {
                    return Err(Fault::gp(selector::error_code(cs)));
                }
                let gate32 = desc.is_gate32();
                self.enter_code(cs, &cs_desc, desc.offset(), gate32);
                Ok(())
            }
            _ => Err(Fault::gp(selector::error_code(sel))),
        }
    }

    /// CALL ptr16:16/32.
    pub fn call_far<B: CpuBus>(
        &mut self,
        bus: &mut B,
        use32: bool,
        sel: u16,
        offset: u32,
        old_eip: u32,
    ) -> Result<(), Fault> {
        if !self.pmode || self.v86() {
            let snap = self.snapshot_transfer();
            let cs = self.selector(SegReg::Cs);
            let pushed = self
                .push(bus, use32, u32::from(cs))
                .and_then(|()| self.push(bus, use32, old_eip));
            if let Err(fault) = pushed {
                self.restore_transfer(bus, snap);
                return Err(fault);
            }
            self.regs.eip = if use32 { offset } else { offset & 0xffff };
            self.set_seg_real(SegReg::Cs, sel);
            return Ok(());
        }

        let desc = self.far_target(bus, sel)?;
        if desc.is_code() {
            self.check_direct_code(sel, &desc)?;
            self.push_return(bus, use32, old_eip)?;
            self.enter_code(sel, &desc, offset, use32);
            return Ok(());
        }
        match desc.kind() {
            kind::CALL_GATE_286 | kind::CALL_GATE_386 => {
                self.check_system_target(sel, &desc)?;
                self.call_gate(bus, &desc, old_eip)
            }
            kind::TSS_286_AVAILABLE
            | kind::TSS_386_AVAILABLE
            | kind::TSS_286_BUSY
            | kind::TSS_386_BUSY => {
                self.check_system_target(sel, &desc)?;
                debug!(selector = sel, "call to tss");
                self.switch_task(bus, sel, TaskSwitch::CallInt, old_eip)
            }
            kind::TASK_GATE => {
                self.check_system_target(sel, &desc)?;
                self.switch_task(bus, desc.selector(), TaskSwitch::CallInt, old_eip)
            }
            _ => Err(Fault::gp(selector::error_code(sel))),
        }
    }

    /// Push CS:EIP for a same-privilege far call, leaving ESP untouched on
    /// failure.
    fn push_return<B: CpuBus>(
        &mut self,
        bus: &mut B,
        use32: bool,
        old_eip: u32,
    ) -> Result<(), Fault> {
        let esp = self.esp();
        let cs = self.selector(SegReg::Cs);
        let pushed = self
            .push(bus, use32, u32::from(cs))
            .and_then(|()| self.push(bus, use32, old_eip));
        if pushed.is_err() {
            self.set_esp(esp);
        }
        pushed
    }

    fn call_gate<B: CpuBus>(
        &mut self,
        bus: &mut B,
        gate: &Descriptor,
        old_eip: u32,
    ) -> Result<(), Fault> {
        let (cs, cs_desc) = self.gate_target(bus, gate)?;
        let gate32 = gate.is_gate32();
        let offset = gate.offset();

        if cs_desc.conforming() || cs_desc.dpl() == self.cpl {
            self.push_return(bus, gate32, old_eip)?;
            self.enter_code(cs, &cs_desc, offset, gate32);
            return Ok(());
        }

        // More privileged non-conforming target: switch to the inner stack.
        let dpl = cs_desc.dpl();
        let (n_ss, n_esp) = self.tss.get_ss_esp(bus, dpl)?;
        if selector::is_null(n_ss) {
            return Err(Fault::ts(0));
        }
        let ss_code = selector::error_code(n_ss);
        let ss_desc = self.gdt.descriptor(bus, u32::from(n_ss))?.ok_or(Fault::ts(ss_code))?;
        if selector::rpl(n_ss) != dpl || ss_desc.dpl() != dpl || !ss_desc.writable() {
            return Err(Fault::ts(ss_code));
        }
        if !ss_desc.present() {
            return Err(Fault::ss(ss_code));
        }

        // Read the parameters off the caller's stack before committing.
        let count = u32::from(gate.param_count());
        let mut params = Vec::with_capacity(count as usize);
        for i in 0..count {
            let value = if gate32 {
                self.peek32(bus, i * 4)?
            } else {
                u32::from(self.peek16(bus, i * 2)?)
            };
            params.push(value);
        }

        let snap = self.snapshot_transfer();
        let old_ss = self.selector(SegReg::Ss);
        let old_esp = self.esp();
        let old_cs = self.selector(SegReg::Cs);

        self.load_ss(n_ss, &ss_desc);
        if ss_desc.big() {
            self.set_esp(n_esp);
        } else {
            self.regs.set16(Reg32::Esp, n_esp as u16);
        }
        self.set_cpl(bus, dpl);
        self.enter_code(cs, &cs_desc, offset, gate32);

        let pushed = (|| {
            self.push(bus, gate32, u32::from(old_ss))?;
            self.push(bus, gate32, old_esp)?;
            for &value in params.iter().rev() {
                self.push(bus, gate32, value)?;
            }
            self.push(bus, gate32, u32::from(old_cs))?;
            self.push(bus, gate32, old_eip)
        })();
        if let Err(fault) = pushed {
            self.restore_transfer(bus, snap);
            return Err(fault);
        }
        debug!(cs, cpl = dpl, params = count, "call gate to inner level");
        Ok(())
    }

    /// RETF [imm16]. `bytes` extra parameter bytes are released.
    pub fn ret_far<B: CpuBus>(
        &mut self,
        bus: &mut B,
        use32: bool,
        bytes: u16,
    ) -> Result<(), Fault> {
        let width: u32 = if use32 { 4 } else { 2 };
        let read = |cpu: &Self, bus: &mut B, index: u32| -> Result<u32, Fault> {
            if use32 {
                cpu.peek32(bus, index * 4)
            } else {
                cpu.peek16(bus, index * 2).map(u32::from)
            }
        };

        if !self.pmode || self.v86() {
            let ip = read(self, bus, 0)?;
            let cs = read(self, bus, 1)? as u16;
            let esp = self.stack.step(self.esp(), (2 * width + u32::from(bytes)) as i32);
            self.set_esp(esp);
            self.set_seg_real(SegReg::Cs, cs);
            self.regs.eip = ip;
            return Ok(());
        }

        let offset = read(self, bus, 0)?;
        let sel = read(self, bus, 1)? as u16;
        let code = selector::error_code(sel);
        let rpl = selector::rpl(sel);
        if rpl < self.cpl {
            return Err(Fault::gp(code));
        }
        let desc = self.far_target(bus, sel)?;
        if !desc.is_code() {
            return Err(Fault::gp(code));
        }
        if (desc.conforming() && desc.dpl() > rpl) || (!desc.conforming() && desc.dpl() != rpl) {
            return Err(Fault::gp(code));
        }
        if !desc.present() {
            return Err(Fault::np(code));
        }

        if rpl == self.cpl {
            let esp = self.stack.step(self.esp(), (2 * width + u32::from(bytes)) as i32);
            self.set_esp(esp);
            self.load_cs(sel, &desc);
            self.regs.eip = offset;
            return Ok(());
        }

        // Return to an outer level: the caller's SS:ESP sit above the
        // released parameters.
        let above = 2 * width + u32::from(bytes);
        let (n_esp, n_ss) = if use32 {
            (self.peek32(bus, above)?, self.peek32(bus, above + 4)? as u16)
        } else {
            (u32::from(self.peek16(bus, above)?), self.peek16(bus, above + 2)?)
        };
        if selector::is_null(n_ss) {
            return Err(Fault::gp0());
        }
        let ss_code = selector::error_code(n_ss);
        let ss_desc = self.gdt.descriptor(bus, u32::from(n_ss))?.ok_or(Fault::gp(ss_code))?;
        if selector::rpl(n_ss) != rpl || ss_desc.dpl() != rpl || !ss_desc.writable() {
            return Err(Fault::gp(ss_code));
        }
        if !ss_desc.present() {
            return Err(Fault::ss(ss_code));
        }

        self.set_cpl(bus, rpl);
        self.load_cs(sel, &desc);
        self.regs.eip = offset;
        self.load_ss(n_ss, &ss_desc);
        if ss_desc.big() {
            self.set_esp(n_esp.wrapping_add(u32::from(bytes)));
        } else {
            self.regs.set16(Reg32::Esp, (n_esp as u16).wrapping_add(bytes));
        }
        self.check_segments(bus)
    }
}
