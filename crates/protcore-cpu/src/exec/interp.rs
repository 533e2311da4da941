//! The interpreting cores.
//!
//! One [`Interpreter`] type serves the normal, simple, full and prefetch
//! cores; they differ only in how instruction bytes are fetched.

use crate::exec::decode::{self, Decoded, DirectFetch, MemRef, Op, Port, Rm};
use crate::exec::prefetch::PrefetchQueue;
use crate::exec::{CoreExit, CoreKind, CycleBudget, Decoder, DispatchError, ExecCore};
use crate::flags::{FLAG_IF, FLAG_OF, FLAG_TF};
use crate::mem::CpuBus;
use crate::regs::{Reg32, RegOperand, SegReg};
use crate::state::Cpu;
use crate::{CpuExit, Fault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fidelity {
    /// CS limit checked when segment limits are enabled.
    Normal,
    /// No fetch checks.
    Simple,
    /// CS limit always checked.
    Full,
    /// Fetches go through a prefetch queue.
    Prefetch,
}

impl Fidelity {
    pub fn kind(self) -> CoreKind {
        match self {
            Fidelity::Normal => CoreKind::Normal,
            Fidelity::Simple => CoreKind::Simple,
            Fidelity::Full => CoreKind::Full,
            Fidelity::Prefetch => CoreKind::Prefetch,
        }
    }
}

/// Why an instruction stopped early.
enum Stop {
    Fault(Fault),
    Exit(CpuExit),
}

impl From<Fault> for Stop {
    fn from(fault: Fault) -> Self {
        Stop::Fault(fault)
    }
}

impl From<CpuExit> for Stop {
    fn from(exit: CpuExit) -> Self {
        Stop::Exit(exit)
    }
}

enum Flow {
    Next,
    Halt,
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    fidelity: Fidelity,
    queue: PrefetchQueue,
    retired: u64,
}

impl Interpreter {
    pub fn new(fidelity: Fidelity) -> Self {
        Self {
            fidelity,
            queue: PrefetchQueue::new(0),
            retired: 0,
        }
    }

    /// Prefetch core with a queue of `size` bytes.
    pub fn with_prefetch(size: usize) -> Self {
        Self {
            fidelity: Fidelity::Prefetch,
            queue: PrefetchQueue::new(size),
            retired: 0,
        }
    }

    pub fn fidelity(&self) -> Fidelity {
        self.fidelity
    }

    pub fn queue(&self) -> &PrefetchQueue {
        &self.queue
    }

    /// Instructions retired since construction.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Drop prefetched bytes.
    pub fn invalidate(&mut self) {
        self.queue.invalidate();
    }

    fn check_limit(&self, cpu: &Cpu) -> bool {
        match self.fidelity {
            Fidelity::Simple => false,
            Fidelity::Full => true,
            Fidelity::Normal | Fidelity::Prefetch => cpu.options.segment_limits,
        }
    }

    fn decode<B: CpuBus>(&mut self, cpu: &Cpu, bus: &mut B) -> Result<Decoded, Fault> {
        let check = self.check_limit(cpu);
        let eip = cpu.regs.eip;
        match self.fidelity {
            Fidelity::Prefetch => decode::decode(cpu, bus, &mut self.queue, eip, check),
            _ => decode::decode(cpu, bus, &mut DirectFetch, eip, check),
        }
    }

    /// Run until the budget is spent or something needs the dispatcher.
    ///
    /// With `stepping` set, TF is not checked; the caller runs exactly one
    /// instruction for the single-step trap.
    pub(crate) fn execute<B: CpuBus>(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
        stepping: bool,
    ) -> Result<CoreExit, DispatchError> {
        while !budget.is_exhausted() {
            if !stepping && cpu.flag(FLAG_TF) {
                return Ok(CoreExit::SwitchCore(Decoder::Core {
                    kind: self.fidelity.kind(),
                    trap: true,
                }));
            }
            let start = cpu.regs.eip;
            let shadowed = cpu.events.interrupt_shadow;
            let if_before = cpu.flag(FLAG_IF);
            cpu.events.retire_instruction();
            budget.consume(1);

            match self.step(cpu, bus) {
                Ok(Flow::Next) => {}
                Ok(Flow::Halt) => {
                    self.retired += 1;
                    return Ok(CoreExit::Halted);
                }
                Err(Stop::Fault(fault)) => {
                    cpu.regs.eip = start;
                    self.queue.invalidate();
                    return Ok(match cpu.deliver_fault(bus, fault) {
                        Ok(()) => CoreExit::ExceptionDelivered,
                        Err(CpuExit::TripleFault) => CoreExit::Shutdown,
                    });
                }
                Err(Stop::Exit(CpuExit::TripleFault)) => return Ok(CoreExit::Shutdown),
            }
            self.retired += 1;

            // Let the host deliver interrupts that just became deliverable.
            if cpu.flag(FLAG_IF) && (shadowed || (!if_before && !cpu.events.interrupt_shadow)) {
                return Ok(CoreExit::OutOfCycles);
            }
        }
        Ok(CoreExit::OutOfCycles)
    }

    fn step<B: CpuBus>(&mut self, cpu: &mut Cpu, bus: &mut B) -> Result<Flow, Stop> {
        let decoded = self.decode(cpu, bus)?;
        let cs_base = cpu.seg_base(SegReg::Cs);
        let next = decoded.next_eip;
        cpu.regs.eip = next;
        let flow = execute_op(cpu, bus, decoded.op, next)?;
        if self.fidelity == Fidelity::Prefetch
            && cpu.linear(SegReg::Cs, cpu.regs.eip) != cs_base.wrapping_add(next)
        {
            self.queue.invalidate();
        }
        Ok(flow)
    }
}

impl<B: CpuBus> ExecCore<B> for Interpreter {
    fn run(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
    ) -> Result<CoreExit, DispatchError> {
        self.execute(cpu, bus, budget, false)
    }

    fn flush(&mut self) {
        self.invalidate();
    }
}

fn operand_width(op: RegOperand) -> u8 {
    match op {
        RegOperand::Byte { .. } => 1,
        RegOperand::Word(_) => 2,
        RegOperand::Dword(_) => 4,
    }
}

fn port_number(cpu: &Cpu, port: Port) -> u16 {
    match port {
        Port::Imm(n) => u16::from(n),
        Port::Dx => cpu.regs.get16(Reg32::Edx),
    }
}

/// Linear address of a memory operand after the segment limit check.
fn linear(cpu: &Cpu, mem: MemRef, len: u32) -> Result<u32, Fault> {
    let seg = cpu.segs.get(mem.seg);
    if cpu.options.segment_limits && !seg.contains(mem.offset, len) {
        return Err(if mem.seg == SegReg::Ss { Fault::ss(0) } else { Fault::gp0() });
    }
    Ok(seg.base.wrapping_add(mem.offset))
}

fn store_table<B: CpuBus>(
    cpu: &Cpu,
    bus: &mut B,
    mem: MemRef,
    (limit, base): (u16, u32),
    use32: bool,
) -> Result<(), Fault> {
    let addr = linear(cpu, mem, 6)?;
    let base = if use32 { base } else { base & 0x00ff_ffff };
    bus.write_u16(addr, limit)?;
    bus.write_u32(addr.wrapping_add(2), base)
}

fn load_table<B: CpuBus>(
    cpu: &Cpu,
    bus: &mut B,
    mem: MemRef,
    use32: bool,
) -> Result<(u16, u32), Fault> {
    let addr = linear(cpu, mem, 6)?;
    let limit = bus.read_u16(addr)?;
    let base = bus.read_u32(addr.wrapping_add(2))?;
    Ok((limit, if use32 { base } else { base & 0x00ff_ffff }))
}

fn read_word<B: CpuBus>(cpu: &Cpu, bus: &mut B, rm: Rm) -> Result<u16, Fault> {
    match rm {
        Rm::Reg(reg) => Ok(cpu.regs.read(reg) as u16),
        Rm::Mem(mem) => bus.read_u16(linear(cpu, mem, 2)?),
    }
}

/// Execute one decoded instruction. EIP already points past it.
fn execute_op<B: CpuBus>(cpu: &mut Cpu, bus: &mut B, op: Op, next: u32) -> Result<Flow, Stop> {
    match op {
        Op::Nop => {}
        Op::Hlt => {
            cpu.check_hlt()?;
            return Ok(Flow::Halt);
        }
        Op::Cli => cpu.cli()?,
        Op::Sti => cpu.sti()?,
        Op::Int3 => {
            cpu.sw_interrupt_no_iopl_check(bus, 3, next)?;
            cpu.trap_skip = true;
        }
        Op::Int(n) => {
            cpu.sw_interrupt(bus, n, next)?;
            cpu.trap_skip = true;
        }
        Op::Into => {
            if cpu.flag(FLAG_OF) {
                cpu.sw_interrupt_no_iopl_check(bus, 4, next)?;
                cpu.trap_skip = true;
            }
        }
        Op::Iret { use32 } => cpu.iret(bus, use32, next)?,
        Op::JmpFar { use32, sel, offset } => cpu.jmp_far(bus, use32, sel, offset, next)?,
        Op::CallFar { use32, sel, offset } => cpu.call_far(bus, use32, sel, offset, next)?,
        Op::RetFar { use32, bytes } => cpu.ret_far(bus, use32, bytes)?,
        Op::JmpNear { target, .. } => {
            let cs = cpu.segs.get(SegReg::Cs);
            if cpu.options.segment_limits && target > cs.limit {
                return Err(Fault::gp0().into());
            }
            cpu.regs.eip = target;
        }
        Op::Pushf { use32 } => cpu.pushf(bus, use32)?,
        Op::Popf { use32 } => cpu.popf(bus, use32)?,
        Op::MovToSeg { seg, src } => {
            let value = cpu.regs.read(src) as u16;
            cpu.set_seg_general(bus, seg, value)?;
            if seg == SegReg::Ss {
                cpu.events.interrupt_shadow = true;
            }
        }
        Op::MovFromSeg { dst, seg } => {
            let sel = cpu.selector(seg);
            cpu.regs.write(dst, u32::from(sel));
        }
        Op::PushSeg { seg, use32 } => {
            let sel = cpu.selector(seg);
            cpu.push(bus, use32, u32::from(sel))?;
        }
        Op::PopSeg { seg, use32 } => {
            cpu.pop_seg(bus, seg, use32)?;
            if seg == SegReg::Ss {
                cpu.events.interrupt_shadow = true;
            }
        }
        Op::MovImm { dst, imm } => cpu.regs.write(dst, imm),
        Op::Push { src, use32 } => {
            let value = cpu.regs.read(src);
            cpu.push(bus, use32, value)?;
        }
        Op::Pop { dst, use32 } => {
            let value = cpu.pop(bus, use32)?;
            cpu.regs.write(dst, value);
        }
        Op::In { dst, port } => {
            let port = port_number(cpu, port);
            let size = operand_width(dst);
            cpu.io_exception(bus, port, size)?;
            let value = bus.io_read(port, size);
            cpu.regs.write(dst, value);
        }
        Op::Out { src, port } => {
            let port = port_number(cpu, port);
            let size = operand_width(src);
            cpu.io_exception(bus, port, size)?;
            let value = cpu.regs.read(src);
            bus.io_write(port, size, value);
        }
        Op::Arpl { dst, src } => {
            let dest = cpu.regs.read(dst) as u16;
            let source = cpu.regs.read(src) as u16;
            let adjusted = cpu.arpl(dest, source);
            cpu.regs.write(dst, u32::from(adjusted));
        }
        Op::Sldt(dst) => {
            let sel = cpu.sldt();
            cpu.regs.write(dst, u32::from(sel));
        }
        Op::Str(dst) => {
            let sel = cpu.str();
            cpu.regs.write(dst, u32::from(sel));
        }
        Op::Lldt(src) => {
            let sel = cpu.regs.read(src) as u16;
            cpu.lldt(bus, sel)?;
        }
        Op::Ltr(src) => {
            let sel = cpu.regs.read(src) as u16;
            cpu.ltr(bus, sel)?;
        }
        Op::Verr(src) => {
            let sel = cpu.regs.read(src) as u16;
            cpu.verr(bus, sel)?;
        }
        Op::Verw(src) => {
            let sel = cpu.regs.read(src) as u16;
            cpu.verw(bus, sel)?;
        }
        Op::Sgdt { mem, use32 } => store_table(cpu, bus, mem, cpu.sgdt(), use32)?,
        Op::Sidt { mem, use32 } => store_table(cpu, bus, mem, cpu.sidt(), use32)?,
        Op::Lgdt { mem, use32 } => {
            let (limit, base) = load_table(cpu, bus, mem, use32)?;
            cpu.lgdt(limit, base)?;
        }
        Op::Lidt { mem, use32 } => {
            let (limit, base) = load_table(cpu, bus, mem, use32)?;
            cpu.lidt(limit, base)?;
        }
        Op::Smsw(Rm::Reg(dst)) => {
            let msw = cpu.smsw();
            cpu.regs.write(dst, u32::from(msw));
        }
        Op::Smsw(Rm::Mem(mem)) => {
            let addr = linear(cpu, mem, 2)?;
            bus.write_u16(addr, cpu.smsw())?;
        }
        Op::Lmsw(src) => {
            let word = read_word(cpu, bus, src)?;
            cpu.lmsw(bus, word)?;
        }
        Op::Lar { dst, src } => {
            let sel = cpu.regs.read(src) as u16;
            if let Some(rights) = cpu.lar(bus, sel)? {
                cpu.regs.write(dst, rights);
            }
        }
        Op::Lsl { dst, src } => {
            let sel = cpu.regs.read(src) as u16;
            if let Some(limit) = cpu.lsl(bus, sel)? {
                cpu.regs.write(dst, limit);
            }
        }
        Op::Clts => cpu.clts()?,
        Op::ReadCr { cr, dst } => {
            let value = cpu.read_crx(cr)?;
            cpu.regs.set32(dst, value);
        }
        Op::WriteCr { cr, src } => {
            let value = cpu.regs.get32(src);
            cpu.write_crx(bus, cr, value)?;
        }
        Op::ReadDr { dr, dst } => {
            let value = cpu.read_drx(dr)?;
            cpu.regs.set32(dst, value);
        }
        Op::WriteDr { dr, src } => {
            let value = cpu.regs.get32(src);
            cpu.write_drx(dr, value)?;
        }
        Op::ReadTr { tr, dst } => {
            let value = cpu.read_trx(tr)?;
            cpu.regs.set32(dst, value);
        }
        Op::WriteTr { tr, src } => {
            let value = cpu.regs.get32(src);
            cpu.write_trx(tr, value)?;
        }
    }
    Ok(Flow::Next)
}
