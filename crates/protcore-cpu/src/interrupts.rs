//! Interrupt and exception delivery (IVT/IDT), fault escalation, NMI latching
//! and IRET.
//!
//! Every event (software `INT n`, an external vector, a CPU-detected
//! exception, NMI) enters through [`Cpu::interrupt`] or [`Cpu::exception`].
//! While an event is being delivered it sits on the in-flight stack in
//! [`EventState`]; a fault raised by the delivery itself is judged against the
//! innermost in-flight event to decide between serial delivery, #DF and a
//! triple fault.

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::descriptor::{kind, Descriptor};
use crate::flags::{FLAG_IF, FLAG_NT, FLAG_TF, FLAG_VM, FMASK_ALL, FMASK_NORMAL};
use crate::mem::CpuBus;
use crate::regs::{Reg32, SegReg};
use crate::selector;
use crate::state::{Cpu, ExceptionRecord};
use crate::tss::TaskSwitch;
use crate::{CpuExit, DispatchError, Exception, Fault};

bitflags! {
    /// Origin and delivery options of an interrupt request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptFlags: u8 {
        const SOFTWARE = 0x1;
        const EXCEPTION = 0x2;
        const HAS_ERROR = 0x4;
        const NO_IOPL_CHECK = 0x8;
    }
}

/// External interrupt controller interface.
pub trait InterruptController {
    /// Returns the next pending external interrupt vector, if any.
    fn poll_interrupt(&mut self) -> Option<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmiState {
    /// NMIs are accepted only while the gate is open.
    pub gate: bool,
    /// An NMI handler is running; cleared by IRET.
    pub active: bool,
    pub pending: bool,
}

impl Default for NmiState {
    fn default() -> Self {
        Self {
            gate: true,
            active: false,
            pending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    ExceptionPending,
    Delivering,
    DoubleFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    fn of(vector: u8) -> Self {
        match Exception::from_vector(vector) {
            Some(Exception::PageFault) => Self::PageFault,
            Some(Exception::DoubleFault) => Self::DoubleFault,
            Some(
                Exception::DivideError
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection,
            ) => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

fn should_double_fault(first: u8, second: u8) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory | C::PageFault)
            | (C::PageFault, C::Contributory | C::PageFault)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    vector: u8,
    exception: bool,
    /// Gate checks passed and the CPU started building the handler frame.
    frame_started: bool,
}

/// Delivery bookkeeping that is not architecturally visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventState {
    levels: [u8; 32],
    in_progress: Vec<u8>,
    in_flight: Vec<InFlight>,
    pending: Option<ExceptionRecord>,
    /// Maskable interrupts are held off for one instruction (STI, MOV SS).
    pub interrupt_shadow: bool,
    reported_double_fault: bool,
    /// A triple fault left the CPU in shutdown until the next reset.
    pub shutdown: bool,
}

impl EventState {
    pub fn level(&self, vector: u8) -> u8 {
        self.levels.get(vector as usize).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> Option<ExceptionRecord> {
        self.pending
    }

    /// Call after every retired instruction.
    pub fn retire_instruction(&mut self) {
        self.interrupt_shadow = false;
    }
}

const DF: u8 = Exception::DoubleFault.vector();

impl Cpu {
    pub fn dispatch_state(&self) -> DispatchState {
        let in_df = self.events.level(DF) != 0
            || self.events.in_flight.iter().any(|f| f.exception && f.vector == DF);
        if in_df {
            DispatchState::DoubleFault
        } else if !self.events.in_flight.is_empty() {
            DispatchState::Delivering
        } else if self.events.pending.is_some() {
            DispatchState::ExceptionPending
        } else {
            DispatchState::Idle
        }
    }

    /// Record an exception for delivery at the next [`Cpu::run_exception`]. A
    /// second non-benign exception before delivery becomes #DF.
    pub fn prepare_exception(&mut self, which: u8, error: u32) -> Result<(), CpuExit> {
        let record = match self.events.pending {
            Some(prev) if prev.which == DF => return self.triple_fault(),
            Some(prev) if should_double_fault(prev.which, which) => {
                self.report_double_fault(prev.which, which);
                ExceptionRecord { which: DF, error: 0 }
            }
            // Benign pairs are handled serially; the second one recurs.
            Some(prev) => prev,
            None => ExceptionRecord { which, error },
        };
        self.events.pending = Some(record);
        self.exception = record;
        Ok(())
    }

    /// Deliver the exception recorded by [`Cpu::prepare_exception`], if any.
    pub fn run_exception<B: CpuBus>(&mut self, bus: &mut B) -> Result<bool, CpuExit> {
        let Some(record) = self.events.pending.take() else {
            return Ok(false);
        };
        self.exception(bus, record.which, record.error)?;
        Ok(true)
    }

    /// Deliver a fault returned by an instruction or memory access.
    pub fn deliver_fault<B: CpuBus>(&mut self, bus: &mut B, fault: Fault) -> Result<(), CpuExit> {
        if let Some(addr) = fault.address {
            self.cr2 = addr;
        }
        self.exception(bus, fault.vector(), fault.error_code)
    }

    /// Raise CPU exception `which` with `error` at the current EIP.
    pub fn exception<B: CpuBus>(
        &mut self,
        bus: &mut B,
        which: u8,
        error: u32,
    ) -> Result<(), CpuExit> {
        let (which, error) = self.escalate(which, error)?;
        let tracked = self.options.double_fault && (which as usize) < self.events.levels.len();
        if tracked {
            self.events.levels[which as usize] += 1;
            self.events.in_progress.push(which);
        }
        self.exception = ExceptionRecord { which, error };

        let mut flags = InterruptFlags::EXCEPTION;
        if Exception::from_vector(which).is_some_and(Exception::pushes_error_code) {
            flags |= InterruptFlags::HAS_ERROR;
        }
        let eip = self.regs.eip;
        let result = self.dispatch(bus, which, flags, eip, error, true);

        if tracked
            && matches!(
                Exception::from_vector(which),
                Some(Exception::PageFault | Exception::GeneralProtection)
            )
        {
            self.unwind_level(which);
        }
        result
    }

    /// #DB with the given DR6 trigger bits (B0..B3, BS).
    pub fn debug_exception<B: CpuBus>(
        &mut self,
        bus: &mut B,
        triggers: u32,
    ) -> Result<(), CpuExit> {
        self.drx[6] = (self.drx[6] & 0xffff_1ff0) | (triggers & 0xe00f);
        self.exception(bus, Exception::Debug.vector(), 0)
    }

    /// Single entry point for software, hardware and CPU-raised events.
    pub fn interrupt<B: CpuBus>(
        &mut self,
        bus: &mut B,
        num: u8,
        flags: InterruptFlags,
        old_eip: u32,
    ) -> Result<(), CpuExit> {
        let error = self.exception.error;
        let is_exception = flags.contains(InterruptFlags::EXCEPTION);
        self.dispatch(bus, num, flags, old_eip, error, is_exception)
    }

    pub fn sw_interrupt<B: CpuBus>(
        &mut self,
        bus: &mut B,
        num: u8,
        old_eip: u32,
    ) -> Result<(), CpuExit> {
        self.interrupt(bus, num, InterruptFlags::SOFTWARE, old_eip)
    }

    /// Software interrupt that bypasses the virtual-8086 IOPL check (INT3,
    /// INTO, ICEBP).
    pub fn sw_interrupt_no_iopl_check<B: CpuBus>(
        &mut self,
        bus: &mut B,
        num: u8,
        old_eip: u32,
    ) -> Result<(), CpuExit> {
        self.interrupt(bus, num, InterruptFlags::SOFTWARE | InterruptFlags::NO_IOPL_CHECK, old_eip)
    }

    /// Vector raised by a device through the interrupt controller.
    pub fn hw_interrupt<B: CpuBus>(&mut self, bus: &mut B, num: u8) -> Result<(), CpuExit> {
        let eip = self.regs.eip;
        self.interrupt(bus, num, InterruptFlags::empty(), eip)
    }

    /// Poll `ctrl` and deliver one external interrupt if IF allows it.
    pub fn poll_and_deliver_external_interrupt<B: CpuBus, C: InterruptController>(
        &mut self,
        bus: &mut B,
        ctrl: &mut C,
    ) -> Result<bool, CpuExit> {
        if !self.flag(FLAG_IF) || self.events.interrupt_shadow || self.events.pending.is_some() {
            return Ok(false);
        }
        let Some(vector) = ctrl.poll_interrupt() else {
            return Ok(false);
        };
        self.hw_interrupt(bus, vector)?;
        Ok(true)
    }

    pub fn raise_nmi<B: CpuBus>(&mut self, bus: &mut B) -> Result<bool, CpuExit> {
        self.nmi.pending = true;
        self.check_nmi(bus)
    }

    /// Deliver a latched NMI if the gate is open, no NMI handler is running
    /// and no other event is being delivered.
    pub fn check_nmi<B: CpuBus>(&mut self, bus: &mut B) -> Result<bool, CpuExit> {
        if self.nmi.active || !self.nmi.gate || !self.nmi.pending {
            return Ok(false);
        }
        if !self.events.in_flight.is_empty() || self.events.pending.is_some() {
            return Ok(false);
        }
        self.nmi.pending = false;
        match self.deliver_nmi(bus) {
            Ok(delivered) => delivered.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Enter the NMI handler unconditionally.
    ///
    /// The outer error is a host bug: the caller did not wait for the
    /// running NMI handler to IRET.
    pub fn deliver_nmi<B: CpuBus>(
        &mut self,
        bus: &mut B,
    ) -> Result<Result<(), CpuExit>, DispatchError> {
        if self.nmi.active {
            return Err(DispatchError::NmiActive);
        }
        self.nmi.active = true;
        let eip = self.regs.eip;
        let vector = Exception::NonMaskableInterrupt.vector();
        Ok(self.interrupt(bus, vector, InterruptFlags::empty(), eip))
    }

    pub fn set_nmi_gate<B: CpuBus>(&mut self, bus: &mut B, open: bool) -> Result<bool, CpuExit> {
        self.nmi.gate = open;
        self.check_nmi(bus)
    }

    /// Decide how a new exception combines with whatever is being delivered.
    fn escalate(&mut self, which: u8, error: u32) -> Result<(u8, u32), CpuExit> {
        let mut double = false;
        if let Some(outer) = self.events.in_flight.last().copied() {
            if outer.exception && outer.vector == DF {
                return self.triple_fault();
            }
            double = if outer.exception {
                should_double_fault(outer.vector, which)
            } else {
                outer.frame_started
                    && matches!(
                        ExceptionClass::of(which),
                        ExceptionClass::Contributory | ExceptionClass::PageFault
                    )
            };
            if double {
                self.report_double_fault(outer.vector, which);
            }
        }
        if !double && self.options.double_fault && self.events.level(which) != 0 {
            if self.events.level(DF) != 0 {
                return self.triple_fault();
            }
            self.report_double_fault(which, which);
            double = true;
        }
        Ok(if double { (DF, 0) } else { (which, error) })
    }

    fn report_double_fault(&mut self, first: u8, second: u8) {
        if !self.events.reported_double_fault || self.options.always_report_double_fault {
            warn!(
                first,
                second,
                cs = self.selector(SegReg::Cs),
                eip = self.regs.eip,
                "double fault"
            );
            self.events.reported_double_fault = true;
        }
    }

    fn triple_fault<T>(&mut self) -> Result<T, CpuExit> {
        error!(
            cs = self.selector(SegReg::Cs),
            eip = self.regs.eip,
            reset = self.options.reset_on_triple_fault,
            "triple fault"
        );
        self.events.in_flight.clear();
        self.events.pending = None;
        self.events.shutdown = true;
        Err(CpuExit::TripleFault)
    }

    fn unwind_level(&mut self, which: u8) {
        if let Some(level) = self.events.levels.get_mut(which as usize) {
            *level = level.saturating_sub(1);
        }
        if self.events.in_progress.last() == Some(&which) {
            self.events.in_progress.pop();
        }
    }

    /// Called by IRET: the innermost handler is done.
    fn unwind_on_iret(&mut self) {
        if let Some(which) = self.events.in_progress.pop() {
            if let Some(level) = self.events.levels.get_mut(which as usize) {
                *level = level.saturating_sub(1);
            }
        }
    }

    fn dispatch<B: CpuBus>(
        &mut self,
        bus: &mut B,
        num: u8,
        flags: InterruptFlags,
        old_eip: u32,
        error: u32,
        is_exception: bool,
    ) -> Result<(), CpuExit> {
        self.events.in_flight.push(InFlight {
            vector: num,
            exception: is_exception,
            frame_started: false,
        });
        let outcome = self.deliver(bus, num, flags, old_eip, error);
        let result = match outcome {
            Ok(()) => Ok(()),
            // Nested faults are judged while this event is still in flight.
            Err(fault) => self.deliver_fault(bus, fault),
        };
        self.events.in_flight.pop();
        result
    }

    fn mark_frame_started(&mut self) {
        if let Some(top) = self.events.in_flight.last_mut() {
            top.frame_started = true;
        }
    }

    fn deliver<B: CpuBus>(
        &mut self,
        bus: &mut B,
        num: u8,
        flags: InterruptFlags,
        old_eip: u32,
        error: u32,
    ) -> Result<(), Fault> {
        if !self.pmode {
            return self.deliver_real(bus, num, old_eip);
        }

        let software = flags.contains(InterruptFlags::SOFTWARE);
        let ext = u32::from(!software);
        let idt_code = u32::from(num) * 8 + 2 + ext;

        if self.v86()
            && software
            && !flags.contains(InterruptFlags::NO_IOPL_CHECK)
            && self.iopl() != 3
        {
            return Err(Fault::gp0());
        }
        let gate = self.idt.descriptor(bus, u32::from(num) << 3)?.ok_or(Fault::gp(idt_code))?;
        let is_int_or_trap = matches!(
            gate.kind(),
            kind::INT_GATE_286 | kind::TRAP_GATE_286 | kind::INT_GATE_386 | kind::TRAP_GATE_386
        );
        if !is_int_or_trap && gate.kind() != kind::TASK_GATE {
            return Err(Fault::gp(idt_code));
        }
        if software && gate.dpl() < self.cpl {
            return Err(Fault::gp(u32::from(num) * 8 + 2));
        }
        if !gate.present() {
            return Err(Fault::np(idt_code));
        }

        if gate.kind() == kind::TASK_GATE {
            self.mark_frame_started();
            self.switch_task(bus, gate.selector(), TaskSwitch::CallInt, old_eip)?;
            if flags.contains(InterruptFlags::HAS_ERROR) {
                let use32 = self.tss.is386;
                self.push(bus, use32, error)?;
            }
            return Ok(());
        }

        let saved_ss = *self.segs.get(SegReg::Ss);
        let saved_stack = self.stack;
        let saved_esp = self.esp();
        let saved_cpl = self.cpl;
        let result = self.enter_gate(bus, num, flags, old_eip, error, &gate, ext);
        if result.is_err() {
            self.segs.set(SegReg::Ss, saved_ss);
            self.stack = saved_stack;
            self.set_esp(saved_esp);
            self.set_cpl(bus, saved_cpl);
        }
        result
    }

    fn deliver_real<B: CpuBus>(&mut self, bus: &mut B, num: u8, old_eip: u32) -> Result<(), Fault> {
        self.mark_frame_started();
        let flags = self.regs.flags as u16;
        let cs = self.selector(SegReg::Cs);
        self.push16(bus, flags)?;
        self.push16(bus, cs)?;
        self.push16(bus, old_eip as u16)?;
        self.set_flag(FLAG_IF | FLAG_TF, false);
        let vector = self.idt.base.wrapping_add(u32::from(num) << 2);
        let ip = bus.read_u16(vector)?;
        let seg = bus.read_u16(vector.wrapping_add(2))?;
        self.regs.eip = u32::from(ip);
        self.set_seg_real(SegReg::Cs, seg);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_gate<B: CpuBus>(
        &mut self,
        bus: &mut B,
        num: u8,
        flags: InterruptFlags,
        old_eip: u32,
        error: u32,
        gate: &Descriptor,
        ext: u32,
    ) -> Result<(), Fault> {
        let gate_sel = gate.selector();
        if selector::is_null(gate_sel) {
            return Err(Fault::gp(ext));
        }
        let cs_code = selector::error_code(gate_sel) + ext;
        let cs_desc = self.gdt.descriptor(bus, u32::from(gate_sel))?.ok_or(Fault::gp(cs_code))?;
        if !cs_desc.is_code() {
            return Err(Fault::gp(cs_code));
        }
        let cs_dpl = cs_desc.dpl();
        if cs_dpl > self.cpl {
            return Err(Fault::gp(cs_code));
        }

        let gate32 = gate.is_gate32();
        let old_flags = self.regs.flags;
        let old_cs = self.selector(SegReg::Cs);

        if !cs_desc.conforming() && cs_dpl < self.cpl {
            if !cs_desc.present() {
                return Err(Fault::np(cs_code));
            }
            let from_v86 = self.v86();
            if from_v86 && cs_dpl != 0 {
                return Err(Fault::gp(cs_code));
            }
            if from_v86 && !gate32 {
                return Err(Fault::gp(cs_code));
            }
            let (n_ss, n_esp) = self.tss.get_ss_esp(bus, cs_dpl)?;
            if selector::is_null(n_ss) {
                return Err(Fault::ts(ext));
            }
            let ss_code = selector::error_code(n_ss) + ext;
            let ss_desc = self.gdt.descriptor(bus, u32::from(n_ss))?.ok_or(Fault::ts(ss_code))?;
            if selector::rpl(n_ss) != cs_dpl || ss_desc.dpl() != cs_dpl {
                return Err(Fault::ts(ss_code));
            }
            if !ss_desc.writable() {
                return Err(Fault::ts(ss_code));
            }
            if !ss_desc.present() {
                return Err(Fault::ss(ss_code));
            }

            let old_ss = self.selector(SegReg::Ss);
            let old_esp = self.esp();
            self.mark_frame_started();
            self.load_ss(n_ss, &ss_desc);
            self.set_esp(n_esp);
            self.set_cpl(bus, cs_dpl);

            if gate32 {
                if from_v86 {
                    for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                        let sel = self.selector(seg);
                        self.push32(bus, u32::from(sel))?;
                        self.null_seg(seg, 0);
                    }
                }
                self.push32(bus, u32::from(old_ss))?;
                self.push32(bus, old_esp)?;
            } else {
                self.push16(bus, old_ss)?;
                self.push16(bus, old_esp as u16)?;
            }
        } else {
            if self.v86() {
                return Err(Fault::gp(cs_code));
            }
            if !cs_desc.present() {
                return Err(Fault::np(cs_code));
            }
            self.mark_frame_started();
        }

        let has_error = flags.contains(InterruptFlags::HAS_ERROR);
        if gate32 {
            self.push32(bus, old_flags)?;
            self.push32(bus, u32::from(old_cs))?;
            self.push32(bus, old_eip)?;
            if has_error {
                self.push32(bus, error)?;
            }
        } else {
            self.push16(bus, old_flags as u16)?;
            self.push16(bus, old_cs)?;
            self.push16(bus, old_eip as u16)?;
            if has_error {
                self.push16(bus, error as u16)?;
            }
        }

        self.load_cs(gate_sel, &cs_desc);
        self.regs.eip = if gate32 { gate.offset() } else { gate.offset() & 0xffff };
        // Interrupt gates (type bit 0 clear) mask IF; trap gates do not.
        if gate.kind() & 1 == 0 {
            self.set_flag(FLAG_IF, false);
        }
        self.set_flag(FLAG_TF | FLAG_NT | FLAG_VM, false);
        debug!(vector = num, cs = self.selector(SegReg::Cs), eip = self.regs.eip, "gate entry");
        Ok(())
    }

    fn peek<B: CpuBus>(&self, bus: &mut B, use32: bool, index: u32) -> Result<u32, Fault> {
        if use32 {
            self.peek32(bus, index * 4)
        } else {
            self.peek16(bus, index * 2).map(u32::from)
        }
    }

    /// IRET / IRETD.
    pub fn iret<B: CpuBus>(&mut self, bus: &mut B, use32: bool, old_eip: u32) -> Result<(), Fault> {
        self.nmi.active = false;
        self.unwind_on_iret();

        if !self.pmode {
            let eip = self.pop(bus, use32)?;
            let cs = self.pop(bus, use32)? as u16;
            let flags = self.pop(bus, use32)?;
            self.regs.eip = if use32 { eip } else { eip & 0xffff };
            self.set_seg_real(SegReg::Cs, cs);
            let mask = if use32 { FMASK_ALL } else { FMASK_ALL & 0xffff };
            self.set_flags(flags, mask);
            return Ok(());
        }

        if self.v86() {
            if self.iopl() != 3 {
                return Err(Fault::gp0());
            }
            let eip = self.pop(bus, use32)?;
            let cs = self.pop(bus, use32)? as u16;
            let flags = self.pop(bus, use32)?;
            self.regs.eip = if use32 { eip } else { eip & 0xffff };
            self.set_seg_real(SegReg::Cs, cs);
            let mut mask = FMASK_NORMAL | FLAG_NT;
            if !use32 {
                mask &= 0xffff;
            }
            self.set_flags(flags, mask);
            return Ok(());
        }

        if self.flag(FLAG_NT) {
            if !self.tss.valid {
                return Err(Fault::ts(selector::error_code(self.tss.selector)));
            }
            let back = self.tss.get_back(bus)?;
            return self.switch_task(bus, back, TaskSwitch::Iret, old_eip);
        }

        let n_eip = self.peek(bus, use32, 0)?;
        let n_cs = self.peek(bus, use32, 1)? as u16;
        let mut n_flags = self.peek(bus, use32, 2)?;
        if !use32 {
            n_flags = (n_flags & 0xffff) | (self.regs.flags & 0xffff_0000);
        }

        if use32 && n_flags & FLAG_VM != 0 && self.cpl == 0 {
            return self.iret_to_v86(bus, n_eip, n_cs, n_flags);
        }

        if selector::is_null(n_cs) {
            return Err(Fault::gp0());
        }
        let cs_code = selector::error_code(n_cs);
        let cs_desc = self.gdt.descriptor(bus, u32::from(n_cs))?.ok_or(Fault::gp(cs_code))?;
        let rpl = selector::rpl(n_cs);
        if rpl < self.cpl || !cs_desc.is_code() {
            return Err(Fault::gp(cs_code));
        }
        if (cs_desc.conforming() && cs_desc.dpl() > rpl)
            || (!cs_desc.conforming() && cs_desc.dpl() != rpl)
        {
            return Err(Fault::gp(cs_code));
        }
        if !cs_desc.present() {
            return Err(Fault::np(cs_code));
        }

        let width: u32 = if use32 { 4 } else { 2 };
        if rpl == self.cpl {
            let esp = self.stack.step(self.esp(), (3 * width) as i32);
            self.set_esp(esp);
            self.load_cs(n_cs, &cs_desc);
            self.regs.eip = if use32 { n_eip } else { n_eip & 0xffff };
            self.set_flags(n_flags, self.iret_flags_mask(use32));
            return Ok(());
        }

        let n_esp = self.peek(bus, use32, 3)?;
        let n_ss = self.peek(bus, use32, 4)? as u16;
        if selector::is_null(n_ss) {
            return Err(Fault::gp0());
        }
        let ss_code = selector::error_code(n_ss);
        if selector::rpl(n_ss) != rpl {
            return Err(Fault::gp(ss_code));
        }
        let ss_desc = self.gdt.descriptor(bus, u32::from(n_ss))?.ok_or(Fault::gp(ss_code))?;
        if ss_desc.dpl() != rpl || !ss_desc.writable() {
            return Err(Fault::gp(ss_code));
        }
        if !ss_desc.present() {
            return Err(Fault::ss(ss_code));
        }

        self.set_cpl(bus, rpl);
        self.load_cs(n_cs, &cs_desc);
        self.regs.eip = if use32 { n_eip } else { n_eip & 0xffff };
        self.set_flags(n_flags, self.iret_flags_mask(use32));
        self.load_ss(n_ss, &ss_desc);
        if use32 {
            self.set_esp(n_esp);
        } else {
            self.regs.set16(Reg32::Esp, n_esp as u16);
        }
        self.check_segments(bus)
    }

    fn iret_flags_mask(&self, use32: bool) -> u32 {
        let mut mask = if self.cpl != 0 { FMASK_NORMAL | FLAG_NT } else { FMASK_ALL };
        if self.iopl() < self.cpl {
            mask &= !FLAG_IF;
        }
        if !use32 {
            mask &= 0xffff;
        }
        mask
    }

    fn iret_to_v86<B: CpuBus>(
        &mut self,
        bus: &mut B,
        n_eip: u32,
        n_cs: u16,
        n_flags: u32,
    ) -> Result<(), Fault> {
        let mut frame = [0u32; 6];
        for (i, slot) in frame.iter_mut().enumerate() {
            *slot = self.peek32(bus, 12 + 4 * i as u32)?;
        }
        let [n_esp, n_ss, n_es, n_ds, n_fs, n_gs] = frame;
        self.set_flags(n_flags, FMASK_ALL | FLAG_VM);
        self.set_cpl(bus, 3);
        self.set_seg_real(SegReg::Es, n_es as u16);
        self.set_seg_real(SegReg::Ds, n_ds as u16);
        self.set_seg_real(SegReg::Fs, n_fs as u16);
        self.set_seg_real(SegReg::Gs, n_gs as u16);
        self.set_seg_real(SegReg::Ss, n_ss as u16);
        self.set_seg_real(SegReg::Cs, n_cs);
        self.set_esp(n_esp);
        self.regs.eip = n_eip & 0xffff;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{should_double_fault, EventState, InterruptFlags};
    use crate::Exception;

    #[test]
    fn flag_bits_match_the_wire_values() {
        assert_eq!(InterruptFlags::SOFTWARE.bits(), 1);
        assert_eq!(InterruptFlags::EXCEPTION.bits(), 2);
        assert_eq!(InterruptFlags::HAS_ERROR.bits(), 4);
        assert_eq!(InterruptFlags::NO_IOPL_CHECK.bits(), 8);
    }

    #[test]
    fn benign_first_exception_never_double_faults() {
        let ud = Exception::InvalidOpcode.vector();
        let gp = Exception::GeneralProtection.vector();
        let pf = Exception::PageFault.vector();
        assert!(!should_double_fault(ud, gp));
        assert!(should_double_fault(gp, pf));
        assert!(should_double_fault(pf, pf));
        assert!(!should_double_fault(pf, ud));
    }

    #[test]
    fn retire_clears_interrupt_shadow() {
        let mut events = EventState {
            interrupt_shadow: true,
            ..EventState::default()
        };
        events.retire_instruction();
        assert!(!events.interrupt_shadow);
    }
}
