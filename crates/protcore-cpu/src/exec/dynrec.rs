//! Translating core.
//!
//! Runs of register moves, register pushes and pops and NOPs, optionally
//! ending in a near jump, are translated into a compact op stream stored in
//! the code cache. Blocks are keyed by the linear address and code size of
//! their first instruction and are dropped when the guest bytes they were
//! built from change. Every other instruction runs on the normal
//! interpreter.

use std::collections::HashMap;

use protcore_dyncache::{CacheError, CacheOptions, CodeCache, DynCorePolicy};
use tracing::{debug, warn};

use crate::exec::decode::{self, DirectFetch, Op};
use crate::exec::interp::{Fidelity, Interpreter};
use crate::exec::{CoreExit, CoreKind, CycleBudget, Decoder, DispatchError, ExecCore};
use crate::flags::{FLAG_IF, FLAG_TF};
use crate::mem::CpuBus;
use crate::regs::{Reg32, RegOperand, SegReg};
use crate::state::Cpu;
use crate::{CpuExit, Fault};

/// Bytes per translated op: tag, guest length, register, flags, imm32.
const OP_BYTES: usize = 8;

const TAG_NOP: u8 = 1;
const TAG_MOV_IMM: u8 = 2;
const TAG_PUSH: u8 = 3;
const TAG_POP: u8 = 4;
const TAG_JMP: u8 = 5;

const FLAG_USE32: u8 = 0x1;

// Register byte: bits 0..3 index, bit 3 high byte, bits 4..6 width.
const REG_HIGH: u8 = 0x08;
const REG_WIDTH_SHIFT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DynOp {
    Nop,
    MovImm { dst: RegOperand, imm: u32 },
    Push { src: RegOperand, use32: bool },
    Pop { dst: RegOperand, use32: bool },
    /// Relative to the end of the jump instruction.
    Jmp { rel: u32, use32: bool },
}

fn reg_byte(op: RegOperand) -> u8 {
    match op {
        RegOperand::Byte { reg, high } => reg.index() as u8 | if high { REG_HIGH } else { 0 },
        RegOperand::Word(reg) => reg.index() as u8 | (1 << REG_WIDTH_SHIFT),
        RegOperand::Dword(reg) => reg.index() as u8 | (2 << REG_WIDTH_SHIFT),
    }
}

fn reg_from_byte(byte: u8) -> Option<RegOperand> {
    let reg = Reg32::from_index(byte & 7);
    match byte >> REG_WIDTH_SHIFT {
        0 => Some(RegOperand::Byte {
            reg,
            high: byte & REG_HIGH != 0,
        }),
        1 => Some(RegOperand::Word(reg)),
        2 => Some(RegOperand::Dword(reg)),
        _ => None,
    }
}

fn encode(op: DynOp, guest_len: u8) -> [u8; OP_BYTES] {
    let (tag, reg, flags, imm) = match op {
        DynOp::Nop => (TAG_NOP, 0, 0, 0),
        DynOp::MovImm { dst, imm } => (TAG_MOV_IMM, reg_byte(dst), 0, imm),
        DynOp::Push { src, use32 } => (TAG_PUSH, reg_byte(src), u8::from(use32), 0),
        DynOp::Pop { dst, use32 } => (TAG_POP, reg_byte(dst), u8::from(use32), 0),
        DynOp::Jmp { rel, use32 } => (TAG_JMP, 0, u8::from(use32), rel),
    };
    let imm = imm.to_le_bytes();
    [tag, guest_len, reg, flags, imm[0], imm[1], imm[2], imm[3]]
}

fn decode_op(bytes: &[u8]) -> Option<(DynOp, u8)> {
    let [tag, guest_len, reg, flags, a, b, c, d] = *bytes else {
        return None;
    };
    let imm = u32::from_le_bytes([a, b, c, d]);
    let use32 = flags & FLAG_USE32 != 0;
    let op = match tag {
        TAG_NOP => DynOp::Nop,
        TAG_MOV_IMM => DynOp::MovImm {
            dst: reg_from_byte(reg)?,
            imm,
        },
        TAG_PUSH => DynOp::Push {
            src: reg_from_byte(reg)?,
            use32,
        },
        TAG_POP => DynOp::Pop {
            dst: reg_from_byte(reg)?,
            use32,
        },
        TAG_JMP => DynOp::Jmp { rel: imm, use32 },
        _ => return None,
    };
    Some((op, guest_len))
}

#[derive(Debug, Clone)]
struct Block {
    offset: usize,
    ops: usize,
    /// Guest bytes the block was translated from.
    guest: Vec<u8>,
}

/// Why the core gave up.
enum Failure {
    Cache(CacheError),
    Dispatch(DispatchError),
}

impl From<CacheError> for Failure {
    fn from(err: CacheError) -> Self {
        Failure::Cache(err)
    }
}

enum BlockEnd {
    Done,
    Budget,
    Repoll,
    Fault { at: u32, fault: Fault },
}

/// Translating core for 386+ guests (`DynX86`) or 8086/286 guests (`DynRec`).
#[derive(Debug)]
pub struct DynCore {
    cache: CodeCache,
    blocks: HashMap<(u32, bool), Block>,
    used: usize,
    block_limit: usize,
    fallback: Interpreter,
    kind: CoreKind,
    failed: bool,
}

impl DynCore {
    /// Allocate a code cache of `cache_size` bytes.
    ///
    /// Returns `None` when the host cannot provide executable memory.
    pub fn new(cache_size: usize, block_limit: u32, options: &CacheOptions) -> Option<Self> {
        let cache = match CodeCache::allocate(cache_size, options) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(error = %err, "code cache allocation failed");
                return None;
            }
        };
        if !cache.policy().can_execute() {
            return None;
        }
        Some(Self {
            cache,
            blocks: HashMap::new(),
            used: 0,
            block_limit: block_limit.max(1) as usize,
            fallback: Interpreter::new(Fidelity::Normal),
            kind: CoreKind::DynX86,
            failed: false,
        })
    }

    pub fn policy(&self) -> DynCorePolicy {
        self.cache.policy()
    }

    pub fn kind(&self) -> CoreKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: CoreKind) {
        self.kind = kind;
    }

    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Set after a code cache error; the core must not be used again.
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.used = 0;
        self.cache.flush();
    }

    fn guest_bytes<B: CpuBus>(bus: &mut B, linear: u32, len: usize) -> Option<Vec<u8>> {
        (0..len as u32).map(|i| bus.read_u8(linear.wrapping_add(i)).ok()).collect()
    }

    fn translate<B: CpuBus>(
        &mut self,
        cpu: &Cpu,
        bus: &mut B,
        linear: u32,
    ) -> Result<Option<Block>, CacheError> {
        let mut eip = cpu.regs.eip;
        let mut code = Vec::new();
        let mut guest_len = 0usize;
        while code.len() / OP_BYTES < self.block_limit {
            let limits = cpu.options.segment_limits;
            let Ok(d) = decode::decode(cpu, bus, &mut DirectFetch, eip, limits) else {
                break;
            };
            let (op, ends) = match d.op {
                Op::Nop => (DynOp::Nop, false),
                Op::MovImm { dst, imm } => (DynOp::MovImm { dst, imm }, false),
                Op::Push { src, use32 } => (DynOp::Push { src, use32 }, false),
                Op::Pop { dst, use32 } => (DynOp::Pop { dst, use32 }, false),
                Op::JmpNear { target, use32 } => (
                    DynOp::Jmp {
                        rel: target.wrapping_sub(d.next_eip),
                        use32,
                    },
                    true,
                ),
                _ => break,
            };
            // Keep blocks contiguous in EIP space.
            if d.next_eip != eip.wrapping_add(u32::from(d.len)) {
                break;
            }
            code.extend_from_slice(&encode(op, d.len));
            guest_len += usize::from(d.len);
            eip = d.next_eip;
            if ends {
                break;
            }
        }
        if code.is_empty() {
            return Ok(None);
        }
        let Some(guest) = Self::guest_bytes(bus, linear, guest_len) else {
            return Ok(None);
        };
        if code.len() > self.cache.capacity() {
            return Ok(None);
        }
        if self.used + code.len() > self.cache.capacity() {
            debug!(blocks = self.blocks.len(), "code cache full");
            self.clear();
        }

        let offset = self.used;
        {
            let mut window = self.cache.begin_write()?;
            window[offset..offset + code.len()].copy_from_slice(&code);
        }
        self.cache.commit()?;
        self.used += code.len();
        Ok(Some(Block {
            offset,
            ops: code.len() / OP_BYTES,
            guest,
        }))
    }

    /// Find or build the block at CS:EIP, dropping it if the guest rewrote it.
    fn lookup<B: CpuBus>(
        &mut self,
        cpu: &Cpu,
        bus: &mut B,
    ) -> Result<Option<(u32, bool)>, CacheError> {
        let linear = cpu.linear(SegReg::Cs, cpu.regs.eip);
        let key = (linear, cpu.code_big);
        if let Some(block) = self.blocks.get(&key) {
            if Self::guest_bytes(bus, linear, block.guest.len()).as_ref() == Some(&block.guest) {
                return Ok(Some(key));
            }
            debug!(linear, "guest code changed, dropping block");
            self.blocks.remove(&key);
        }
        Ok(self.translate(cpu, bus, linear)?.map(|block| {
            self.blocks.insert(key, block);
            key
        }))
    }

    fn run_block<B: CpuBus>(
        &self,
        key: (u32, bool),
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
    ) -> Result<BlockEnd, CacheError> {
        let Some(block) = self.blocks.get(&key) else {
            return Ok(BlockEnd::Done);
        };
        let view = self.cache.exec_view()?;
        let code = &view[block.offset..block.offset + block.ops * OP_BYTES];
        for raw in code.chunks_exact(OP_BYTES) {
            if budget.is_exhausted() {
                return Ok(BlockEnd::Budget);
            }
            let Some((op, len)) = decode_op(raw) else {
                return Ok(BlockEnd::Done);
            };
            let start = cpu.regs.eip;
            let shadowed = cpu.events.interrupt_shadow;
            cpu.events.retire_instruction();
            budget.consume(1);
            let next = if cpu.code_big {
                start.wrapping_add(u32::from(len))
            } else {
                start.wrapping_add(u32::from(len)) & 0xffff
            };
            cpu.regs.eip = next;
            if let Err(fault) = execute(cpu, bus, op, next) {
                return Ok(BlockEnd::Fault { at: start, fault });
            }
            if shadowed && cpu.flag(FLAG_IF) {
                return Ok(BlockEnd::Repoll);
            }
        }
        Ok(BlockEnd::Done)
    }

    fn run_inner<B: CpuBus>(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
    ) -> Result<CoreExit, Failure> {
        while !budget.is_exhausted() {
            if cpu.flag(FLAG_TF) {
                return Ok(CoreExit::SwitchCore(Decoder::Core {
                    kind: self.kind,
                    trap: true,
                }));
            }
            let Some(key) = self.lookup(cpu, bus)? else {
                let shadowed = cpu.events.interrupt_shadow;
                let if_before = cpu.flag(FLAG_IF);
                let mut one = CycleBudget::new(1);
                // TF was checked above.
                let exit = self
                    .fallback
                    .execute(cpu, bus, &mut one, true)
                    .map_err(Failure::Dispatch)?;
                budget.consume(1);
                if exit != CoreExit::OutOfCycles {
                    return Ok(exit);
                }
                if cpu.flag(FLAG_IF) && (shadowed || (!if_before && !cpu.events.interrupt_shadow)) {
                    return Ok(CoreExit::OutOfCycles);
                }
                continue;
            };
            match self.run_block(key, cpu, bus, budget)? {
                BlockEnd::Done => {}
                BlockEnd::Budget | BlockEnd::Repoll => return Ok(CoreExit::OutOfCycles),
                BlockEnd::Fault { at, fault } => {
                    cpu.regs.eip = at;
                    return Ok(match cpu.deliver_fault(bus, fault) {
                        Ok(()) => CoreExit::ExceptionDelivered,
                        Err(CpuExit::TripleFault) => CoreExit::Shutdown,
                    });
                }
            }
        }
        Ok(CoreExit::OutOfCycles)
    }
}

fn execute<B: CpuBus>(cpu: &mut Cpu, bus: &mut B, op: DynOp, next: u32) -> Result<(), Fault> {
    match op {
        DynOp::Nop => {}
        DynOp::MovImm { dst, imm } => cpu.regs.write(dst, imm),
        DynOp::Push { src, use32 } => {
            let value = cpu.regs.read(src);
            cpu.push(bus, use32, value)?;
        }
        DynOp::Pop { dst, use32 } => {
            let value = cpu.pop(bus, use32)?;
            cpu.regs.write(dst, value);
        }
        DynOp::Jmp { rel, use32 } => {
            let target = next.wrapping_add(rel);
            let target = if use32 { target } else { target & 0xffff };
            if cpu.options.segment_limits && target > cpu.segs.get(SegReg::Cs).limit {
                return Err(Fault::gp0());
            }
            cpu.regs.eip = target;
        }
    }
    Ok(())
}

impl<B: CpuBus> ExecCore<B> for DynCore {
    fn run(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
    ) -> Result<CoreExit, DispatchError> {
        match self.run_inner(cpu, bus, budget) {
            Ok(exit) => Ok(exit),
            Err(Failure::Dispatch(err)) => Err(err),
            Err(Failure::Cache(err)) => {
                warn!(error = %err, "code cache failure, leaving the translating core");
                self.failed = true;
                self.clear();
                Ok(CoreExit::SwitchCore(Decoder::Core {
                    kind: CoreKind::Normal,
                    trap: false,
                }))
            }
        }
    }

    fn flush(&mut self) {
        self.clear();
    }
}
