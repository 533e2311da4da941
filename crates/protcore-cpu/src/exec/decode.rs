//! Instruction decoding for the system instruction subset.
//!
//! Decoding never changes CPU state: it reads bytes at CS:EIP through a
//! [`Fetch`] source and produces an [`Op`] plus the address of the next
//! instruction. Cores then execute (or translate) the op.

use crate::arch::CpuArch;
use crate::mem::CpuBus;
use crate::regs::{ModRm, OperandSize, Reg32, RegOperand, SegReg};
use crate::state::Cpu;
use crate::Fault;

/// Architectural upper bound on instruction length, prefixes included.
pub const MAX_INSTRUCTION_LEN: u8 = 15;

/// Source of instruction bytes, addressed linearly.
pub trait Fetch<B: CpuBus> {
    fn byte(&mut self, bus: &mut B, linear: u32) -> Result<u8, Fault>;
}

/// Reads straight from the bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectFetch;

impl<B: CpuBus> Fetch<B> for DirectFetch {
    fn byte(&mut self, bus: &mut B, linear: u32) -> Result<u8, Fault> {
        bus.read_u8(linear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Imm(u8),
    Dx,
}

/// A direct-displacement memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub seg: SegReg,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    Reg(RegOperand),
    Mem(MemRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    Hlt,
    Cli,
    Sti,
    Int3,
    Int(u8),
    Into,
    Iret { use32: bool },
    JmpFar { use32: bool, sel: u16, offset: u32 },
    CallFar { use32: bool, sel: u16, offset: u32 },
    RetFar { use32: bool, bytes: u16 },
    /// Near jump to an already resolved offset.
    JmpNear { target: u32, use32: bool },
    Pushf { use32: bool },
    Popf { use32: bool },
    MovToSeg { seg: SegReg, src: RegOperand },
    MovFromSeg { dst: RegOperand, seg: SegReg },
    PushSeg { seg: SegReg, use32: bool },
    PopSeg { seg: SegReg, use32: bool },
    MovImm { dst: RegOperand, imm: u32 },
    Push { src: RegOperand, use32: bool },
    Pop { dst: RegOperand, use32: bool },
    In { dst: RegOperand, port: Port },
    Out { src: RegOperand, port: Port },
    Arpl { dst: RegOperand, src: RegOperand },
    Sldt(RegOperand),
    Str(RegOperand),
    Lldt(RegOperand),
    Ltr(RegOperand),
    Verr(RegOperand),
    Verw(RegOperand),
    Sgdt { mem: MemRef, use32: bool },
    Sidt { mem: MemRef, use32: bool },
    Lgdt { mem: MemRef, use32: bool },
    Lidt { mem: MemRef, use32: bool },
    Smsw(Rm),
    Lmsw(Rm),
    Lar { dst: RegOperand, src: RegOperand },
    Lsl { dst: RegOperand, src: RegOperand },
    Clts,
    ReadCr { cr: u8, dst: Reg32 },
    WriteCr { cr: u8, src: Reg32 },
    ReadDr { dr: u8, dst: Reg32 },
    WriteDr { dr: u8, src: Reg32 },
    ReadTr { tr: u8, dst: Reg32 },
    WriteTr { tr: u8, src: Reg32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub op: Op,
    /// EIP of the following instruction.
    pub next_eip: u32,
    pub len: u8,
}

#[derive(Debug, Default)]
struct Prefixes {
    opsize: bool,
    addrsize: bool,
    seg: Option<SegReg>,
}

/// Walks CS:EIP one byte at a time.
struct Cursor<'a, B, F> {
    cpu: &'a Cpu,
    bus: &'a mut B,
    fetch: &'a mut F,
    check_limit: bool,
    eip: u32,
    len: u8,
}

impl<B: CpuBus, F: Fetch<B>> Cursor<'_, B, F> {
    fn u8(&mut self) -> Result<u8, Fault> {
        if self.len >= MAX_INSTRUCTION_LEN {
            return Err(Fault::gp0());
        }
        let cs = self.cpu.segs.get(SegReg::Cs);
        if self.check_limit && !cs.contains(self.eip, 1) {
            return Err(Fault::gp0());
        }
        let byte = self.fetch.byte(self.bus, cs.base.wrapping_add(self.eip))?;
        self.eip = if self.cpu.code_big {
            self.eip.wrapping_add(1)
        } else {
            self.eip.wrapping_add(1) & 0xffff
        };
        self.len += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, Fault> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn u32(&mut self) -> Result<u32, Fault> {
        let lo = self.u16()?;
        let hi = self.u16()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    fn imm(&mut self, use32: bool) -> Result<u32, Fault> {
        if use32 {
            self.u32()
        } else {
            self.u16().map(u32::from)
        }
    }

    fn modrm(&mut self) -> Result<ModRm, Fault> {
        self.u8().map(ModRm::parse)
    }
}

fn word_or_dword(use32: bool) -> OperandSize {
    if use32 {
        OperandSize::Dword
    } else {
        OperandSize::Word
    }
}

fn register_only(m: ModRm, size: OperandSize) -> Result<RegOperand, Fault> {
    if m.is_register() {
        Ok(m.rm_operand(size))
    } else {
        Err(Fault::ud())
    }
}

/// Decode the instruction at CS:`eip`.
///
/// `check_limit` enables the CS limit test on every byte fetched.
pub fn decode<B: CpuBus, F: Fetch<B>>(
    cpu: &Cpu,
    bus: &mut B,
    fetch: &mut F,
    eip: u32,
    check_limit: bool,
) -> Result<Decoded, Fault> {
    let mut cur = Cursor {
        cpu,
        bus,
        fetch,
        check_limit,
        eip,
        len: 0,
    };
    let is386 = cpu.arch >= CpuArch::I386;
    let mut pfx = Prefixes::default();
    let opcode = loop {
        let byte = cur.u8()?;
        match byte {
            0x26 => pfx.seg = Some(SegReg::Es),
            0x2e => pfx.seg = Some(SegReg::Cs),
            0x36 => pfx.seg = Some(SegReg::Ss),
            0x3e => pfx.seg = Some(SegReg::Ds),
            0x64 | 0x65 | 0x66 | 0x67 if !is386 => return Err(Fault::ud()),
            0x64 => pfx.seg = Some(SegReg::Fs),
            0x65 => pfx.seg = Some(SegReg::Gs),
            0x66 => pfx.opsize = true,
            0x67 => pfx.addrsize = true,
            0xf0 | 0xf2 | 0xf3 => {}
            _ => break byte,
        }
    };
    let use32 = cpu.code_big ^ pfx.opsize;
    let addr32 = cpu.code_big ^ pfx.addrsize;
    let size = word_or_dword(use32);
    let protected = cpu.pmode && !cpu.v86();

    let op = match opcode {
        0x06 | 0x0e | 0x16 | 0x1e => Op::PushSeg {
            seg: seg_from_index((opcode >> 3) & 3)?,
            use32,
        },
        0x07 | 0x17 | 0x1f => Op::PopSeg {
            seg: seg_from_index((opcode >> 3) & 3)?,
            use32,
        },
        0x0f if cpu.arch < CpuArch::I286 => return Err(Fault::ud()),
        0x0f => decode_0f(&mut cur, &pfx, use32, addr32, protected)?,
        0x50..=0x57 => Op::Push {
            src: RegOperand::decode(opcode & 7, size),
            use32,
        },
        0x58..=0x5f => Op::Pop {
            dst: RegOperand::decode(opcode & 7, size),
            use32,
        },
        0x63 if !protected => return Err(Fault::ud()),
        0x63 => {
            let m = cur.modrm()?;
            Op::Arpl {
                dst: register_only(m, OperandSize::Word)?,
                src: m.reg_operand(OperandSize::Word),
            }
        }
        0x8c => {
            let m = cur.modrm()?;
            let seg = sreg(cpu, m.reg)?;
            Op::MovFromSeg {
                dst: register_only(m, size)?,
                seg,
            }
        }
        0x8e => {
            let m = cur.modrm()?;
            let seg = sreg(cpu, m.reg)?;
            if seg == SegReg::Cs {
                return Err(Fault::ud());
            }
            Op::MovToSeg {
                seg,
                src: register_only(m, OperandSize::Word)?,
            }
        }
        0x90 => Op::Nop,
        0x9a => {
            let offset = cur.imm(use32)?;
            let sel = cur.u16()?;
            Op::CallFar { use32, sel, offset }
        }
        0x9c => Op::Pushf { use32 },
        0x9d => Op::Popf { use32 },
        0xb0..=0xb7 => Op::MovImm {
            dst: RegOperand::decode(opcode & 7, OperandSize::Byte),
            imm: u32::from(cur.u8()?),
        },
        0xb8..=0xbf => Op::MovImm {
            dst: RegOperand::decode(opcode & 7, size),
            imm: cur.imm(use32)?,
        },
        0xca => Op::RetFar {
            use32,
            bytes: cur.u16()?,
        },
        0xcb => Op::RetFar { use32, bytes: 0 },
        0xcc => Op::Int3,
        0xcd => Op::Int(cur.u8()?),
        0xce => Op::Into,
        0xcf => Op::Iret { use32 },
        0xe4 | 0xe5 | 0xe6 | 0xe7 => {
            let port = Port::Imm(cur.u8()?);
            io_op(opcode, port, size)
        }
        0xec..=0xef => io_op(opcode, Port::Dx, size),
        0xe9 => {
            let rel = cur.imm(use32)?;
            Op::JmpNear {
                target: near_target(cur.eip, rel, use32),
                use32,
            }
        }
        0xea => {
            let offset = cur.imm(use32)?;
            let sel = cur.u16()?;
            Op::JmpFar { use32, sel, offset }
        }
        0xeb => {
            let rel = cur.u8()? as i8 as i32 as u32;
            Op::JmpNear {
                target: near_target(cur.eip, rel, use32),
                use32,
            }
        }
        0xf4 => Op::Hlt,
        0xfa => Op::Cli,
        0xfb => Op::Sti,
        _ => return Err(Fault::ud()),
    };
    Ok(Decoded {
        op,
        next_eip: cur.eip,
        len: cur.len,
    })
}

fn near_target(next: u32, rel: u32, use32: bool) -> u32 {
    let target = next.wrapping_add(rel);
    if use32 {
        target
    } else {
        target & 0xffff
    }
}

fn io_op(opcode: u8, port: Port, size: OperandSize) -> Op {
    let size = if opcode & 1 == 0 { OperandSize::Byte } else { size };
    let reg = RegOperand::decode(0, size);
    if opcode & 2 == 0 {
        Op::In { dst: reg, port }
    } else {
        Op::Out { src: reg, port }
    }
}

fn seg_from_index(index: u8) -> Result<SegReg, Fault> {
    SegReg::from_index(index).ok_or(Fault::ud())
}

/// Segment register named by a ModRM `reg` field.
fn sreg(cpu: &Cpu, index: u8) -> Result<SegReg, Fault> {
    let seg = seg_from_index(index)?;
    if matches!(seg, SegReg::Fs | SegReg::Gs) && cpu.arch < CpuArch::I386 {
        return Err(Fault::ud());
    }
    Ok(seg)
}

fn mem_operand<B: CpuBus, F: Fetch<B>>(
    cur: &mut Cursor<'_, B, F>,
    m: ModRm,
    pfx: &Prefixes,
    addr32: bool,
) -> Result<MemRef, Fault> {
    let seg = pfx.seg.unwrap_or(SegReg::Ds);
    let offset = match (addr32, m.mode, m.rm) {
        (true, 0, 5) => cur.u32()?,
        (false, 0, 6) => u32::from(cur.u16()?),
        _ => return Err(Fault::ud()),
    };
    Ok(MemRef { seg, offset })
}

fn rm_word<B: CpuBus, F: Fetch<B>>(
    cur: &mut Cursor<'_, B, F>,
    m: ModRm,
    pfx: &Prefixes,
    addr32: bool,
) -> Result<Rm, Fault> {
    if m.is_register() {
        Ok(Rm::Reg(m.rm_operand(OperandSize::Word)))
    } else {
        mem_operand(cur, m, pfx, addr32).map(Rm::Mem)
    }
}

fn decode_0f<B: CpuBus, F: Fetch<B>>(
    cur: &mut Cursor<'_, B, F>,
    pfx: &Prefixes,
    use32: bool,
    addr32: bool,
    protected: bool,
) -> Result<Op, Fault> {
    let is386 = cur.cpu.arch >= CpuArch::I386;
    let size = word_or_dword(use32);
    let second = cur.u8()?;
    let op = match second {
        0x00 => {
            if !protected {
                return Err(Fault::ud());
            }
            let m = cur.modrm()?;
            match m.reg {
                0 => Op::Sldt(register_only(m, size)?),
                1 => Op::Str(register_only(m, size)?),
                2 => Op::Lldt(register_only(m, OperandSize::Word)?),
                3 => Op::Ltr(register_only(m, OperandSize::Word)?),
                4 => Op::Verr(register_only(m, OperandSize::Word)?),
                5 => Op::Verw(register_only(m, OperandSize::Word)?),
                _ => return Err(Fault::ud()),
            }
        }
        0x01 => {
            let m = cur.modrm()?;
            match m.reg {
                0..=3 => {
                    if m.is_register() {
                        return Err(Fault::ud());
                    }
                    let mem = mem_operand(cur, m, pfx, addr32)?;
                    match m.reg {
                        0 => Op::Sgdt { mem, use32 },
                        1 => Op::Sidt { mem, use32 },
                        2 => Op::Lgdt { mem, use32 },
                        _ => Op::Lidt { mem, use32 },
                    }
                }
                4 => Op::Smsw(rm_word(cur, m, pfx, addr32)?),
                6 => Op::Lmsw(rm_word(cur, m, pfx, addr32)?),
                _ => return Err(Fault::ud()),
            }
        }
        0x02 | 0x03 => {
            if !protected {
                return Err(Fault::ud());
            }
            let m = cur.modrm()?;
            let dst = m.reg_operand(size);
            let src = register_only(m, OperandSize::Word)?;
            if second == 0x02 {
                Op::Lar { dst, src }
            } else {
                Op::Lsl { dst, src }
            }
        }
        0x06 => Op::Clts,
        0x20..=0x26 if is386 && second != 0x25 => {
            // The mod field is ignored: these always name registers.
            let m = cur.modrm()?;
            let reg = Reg32::from_index(m.rm);
            match second {
                0x20 => Op::ReadCr { cr: m.reg, dst: reg },
                0x22 => Op::WriteCr { cr: m.reg, src: reg },
                0x21 => Op::ReadDr { dr: m.reg, dst: reg },
                0x23 => Op::WriteDr { dr: m.reg, src: reg },
                0x24 => Op::ReadTr { tr: m.reg, dst: reg },
                _ => Op::WriteTr { tr: m.reg, src: reg },
            }
        }
        0xa0 if is386 => Op::PushSeg { seg: SegReg::Fs, use32 },
        0xa1 if is386 => Op::PopSeg { seg: SegReg::Fs, use32 },
        0xa8 if is386 => Op::PushSeg { seg: SegReg::Gs, use32 },
        0xa9 if is386 => Op::PopSeg { seg: SegReg::Gs, use32 },
        _ => return Err(Fault::ud()),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;
    use crate::CpuConfig;
    use crate::Exception;

    fn real_cpu(code: &[u8]) -> (Cpu, FlatTestBus) {
        let mut bus = FlatTestBus::new(0x2_0000);
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.set_seg_real(SegReg::Cs, 0x1000);
        cpu.regs.eip = 0x100;
        bus.load(0x10100, code);
        (cpu, bus)
    }

    fn op_of(code: &[u8]) -> Result<Decoded, Fault> {
        let (cpu, mut bus) = real_cpu(code);
        decode(&cpu, &mut bus, &mut DirectFetch, cpu.regs.eip, true)
    }

    #[test]
    fn far_jump_operands_follow_operand_size() {
        let d = op_of(&[0xea, 0x34, 0x12, 0x08, 0x00]).unwrap();
        assert_eq!(
            d.op,
            Op::JmpFar {
                use32: false,
                sel: 0x08,
                offset: 0x1234
            }
        );
        assert_eq!(d.len, 5);

        let d = op_of(&[0x66, 0xea, 0x78, 0x56, 0x34, 0x12, 0x10, 0x00]).unwrap();
        assert_eq!(
            d.op,
            Op::JmpFar {
                use32: true,
                sel: 0x10,
                offset: 0x1234_5678
            }
        );
        assert_eq!(d.next_eip, 0x108);
    }

    #[test]
    fn short_jump_wraps_in_sixteen_bit_code() {
        let (mut cpu, mut bus) = real_cpu(&[]);
        cpu.regs.eip = 0xfffe;
        bus.load(0x1fffe, &[0xeb, 0x10]);
        let d = decode(&cpu, &mut bus, &mut DirectFetch, cpu.regs.eip, true).unwrap();
        assert_eq!(d.op, Op::JmpNear { target: 0x10, use32: false });
    }

    #[test]
    fn mov_to_cs_is_invalid() {
        assert_eq!(op_of(&[0x8e, 0xc8]).unwrap_err().exception, Exception::InvalidOpcode);
    }

    #[test]
    fn system_group_needs_protected_mode() {
        assert_eq!(op_of(&[0x0f, 0x00, 0xd0]).unwrap_err().exception, Exception::InvalidOpcode);
    }

    #[test]
    fn lgdt_takes_a_direct_displacement() {
        let d = op_of(&[0x0f, 0x01, 0x16, 0x00, 0x05]).unwrap();
        assert_eq!(
            d.op,
            Op::Lgdt {
                mem: MemRef {
                    seg: SegReg::Ds,
                    offset: 0x500
                },
                use32: false
            }
        );
        // [bx+si] is not supported.
        assert!(op_of(&[0x0f, 0x01, 0x10]).is_err());
    }

    #[test]
    fn overlong_instruction_is_gp() {
        let mut code = vec![0x26; 15];
        code.push(0x90);
        assert_eq!(op_of(&code).unwrap_err(), Fault::gp0());
    }

    #[test]
    fn prefixes_386_only() {
        let (mut cpu, mut bus) = real_cpu(&[0x66, 0x90]);
        cpu.arch = CpuArch::I286;
        let err = decode(&cpu, &mut bus, &mut DirectFetch, cpu.regs.eip, true).unwrap_err();
        assert_eq!(err.exception, Exception::InvalidOpcode);
    }

    #[test]
    fn fetch_past_cs_limit_is_gp() {
        let (mut cpu, mut bus) = real_cpu(&[]);
        let mut cs = *cpu.segs.get(SegReg::Cs);
        cs.limit = 0x100;
        cpu.segs.set(SegReg::Cs, cs);
        bus.load(0x10100, &[0xb8, 0x01, 0x00]);
        let fault = decode(&cpu, &mut bus, &mut DirectFetch, cpu.regs.eip, true).unwrap_err();
        assert_eq!(fault, Fault::gp0());
        assert!(decode(&cpu, &mut bus, &mut DirectFetch, cpu.regs.eip, false).is_ok());
    }
}
