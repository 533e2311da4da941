//! Register file indexed by enum rather than by field address.
//!
//! ModRM `reg`/`rm` fields decode into a [`RegOperand`], an index plus a width,
//! which is then read or written through [`RegisterFile`]. Nothing hands out a
//! reference to an individual register.

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg32 {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Reg32 {
    pub const ALL: [Reg32; 8] = [
        Reg32::Eax,
        Reg32::Ecx,
        Reg32::Edx,
        Reg32::Ebx,
        Reg32::Esp,
        Reg32::Ebp,
        Reg32::Esi,
        Reg32::Edi,
    ];

    /// Register named by a 3-bit encoding.
    pub const fn from_index(index: u8) -> Self {
        Self::ALL[(index & 7) as usize]
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
}

/// A register operand: which register and how much of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegOperand {
    /// AL, CL, DL, BL (`high == false`) or AH, CH, DH, BH.
    Byte { reg: Reg32, high: bool },
    Word(Reg32),
    Dword(Reg32),
}

impl RegOperand {
    /// Decode a 3-bit register encoding at the given width. Byte encodings 4..8
    /// name the high halves of the first four registers.
    pub const fn decode(index: u8, size: OperandSize) -> Self {
        let index = index & 7;
        match size {
            OperandSize::Byte => RegOperand::Byte {
                reg: Reg32::from_index(index & 3),
                high: index >= 4,
            },
            OperandSize::Word => RegOperand::Word(Reg32::from_index(index)),
            OperandSize::Dword => RegOperand::Dword(Reg32::from_index(index)),
        }
    }
}

/// Fields of a ModRM byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub const fn parse(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }

    pub const fn is_register(&self) -> bool {
        self.mode == 3
    }

    pub const fn reg_operand(&self, size: OperandSize) -> RegOperand {
        RegOperand::decode(self.reg, size)
    }

    /// The `rm` field as a register; only meaningful when [`Self::is_register`].
    pub const fn rm_operand(&self, size: OperandSize) -> RegOperand {
        RegOperand::decode(self.rm, size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    gpr: [u32; 8],
    pub eip: u32,
    pub flags: u32,
}

impl RegisterFile {
    pub fn get32(&self, reg: Reg32) -> u32 {
        self.gpr[reg.index()]
    }

    pub fn set32(&mut self, reg: Reg32, val: u32) {
        self.gpr[reg.index()] = val;
    }

    pub fn get16(&self, reg: Reg32) -> u16 {
        self.gpr[reg.index()] as u16
    }

    /// Replace the low word, keeping bits 16..32.
    pub fn set16(&mut self, reg: Reg32, val: u16) {
        let slot = &mut self.gpr[reg.index()];
        *slot = (*slot & 0xffff_0000) | u32::from(val);
    }

    pub fn read(&self, op: RegOperand) -> u32 {
        match op {
            RegOperand::Byte { reg, high: false } => self.gpr[reg.index()] & 0xff,
            RegOperand::Byte { reg, high: true } => (self.gpr[reg.index()] >> 8) & 0xff,
            RegOperand::Word(reg) => self.gpr[reg.index()] & 0xffff,
            RegOperand::Dword(reg) => self.gpr[reg.index()],
        }
    }

    pub fn write(&mut self, op: RegOperand, val: u32) {
        match op {
            RegOperand::Byte { reg, high: false } => {
                let slot = &mut self.gpr[reg.index()];
                *slot = (*slot & !0xff) | (val & 0xff);
            }
            RegOperand::Byte { reg, high: true } => {
                let slot = &mut self.gpr[reg.index()];
                *slot = (*slot & !0xff00) | ((val & 0xff) << 8);
            }
            RegOperand::Word(reg) => self.set16(reg, val as u16),
            RegOperand::Dword(reg) => self.set32(reg, val),
        }
    }

    pub fn gprs(&self) -> &[u32; 8] {
        &self.gpr
    }
}

/// Segment registers in encoding order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] =
        [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs];

    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SegReg::Es),
            1 => Some(SegReg::Cs),
            2 => Some(SegReg::Ss),
            3 => Some(SegReg::Ds),
            4 => Some(SegReg::Fs),
            5 => Some(SegReg::Gs),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Hidden part of a segment register, filled at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub expand_down: bool,
    pub big: bool,
}

impl SegmentCache {
    pub const fn real(selector: u16, limit: u32) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit,
            expand_down: false,
            big: false,
        }
    }

    /// Whether `[offset, offset + len)` is inside the segment.
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        let last = offset.wrapping_add(len.saturating_sub(1));
        if self.expand_down {
            let upper = if self.big { 0xffff_ffff } else { 0xffff };
            offset > self.limit && last <= upper && last >= offset
        } else {
            offset <= self.limit && last <= self.limit && last >= offset
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentRegisters([SegmentCache; 6]);

impl SegmentRegisters {
    pub fn get(&self, seg: SegReg) -> &SegmentCache {
        &self.0[seg.index()]
    }

    pub fn set(&mut self, seg: SegReg, cache: SegmentCache) {
        self.0[seg.index()] = cache;
    }

    pub fn selector(&self, seg: SegReg) -> u16 {
        self.0[seg.index()].selector
    }

    pub fn base(&self, seg: SegReg) -> u32 {
        self.0[seg.index()].base
    }
}
