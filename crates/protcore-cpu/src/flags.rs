//! EFLAGS bits and the masks used when software writes the flags word.

use crate::arch::CpuArch;
use crate::state::Cpu;

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_VIF: u32 = 1 << 19;
pub const FLAG_VIP: u32 = 1 << 20;
pub const FLAG_ID: u32 = 1 << 21;

pub const IOPL_SHIFT: u32 = 12;

pub const FMASK_TEST: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;
pub const FMASK_NORMAL: u32 = FMASK_TEST | FLAG_DF | FLAG_TF | FLAG_IF;
pub const FMASK_ALL: u32 = FMASK_NORMAL | FLAG_IOPL | FLAG_NT;

/// Bits 12..15, hardwired on 8086/80186 and zero on a 286 in real mode.
const HIGH_NIBBLE: u32 = 0xf000;

impl Cpu {
    pub fn flags(&self) -> u32 {
        self.regs.flags
    }

    pub fn flag(&self, mask: u32) -> bool {
        self.regs.flags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u32, on: bool) {
        if on {
            self.regs.flags |= mask;
        } else {
            self.regs.flags &= !mask;
        }
        if mask & FLAG_DF != 0 {
            self.sync_direction();
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.regs.flags & FLAG_IOPL) >> IOPL_SHIFT) as u8
    }

    pub fn v86(&self) -> bool {
        self.flag(FLAG_VM)
    }

    /// Write `word` through `mask`, applying the architecture's fixed bits.
    pub fn set_flags(&mut self, word: u32, mut mask: u32) {
        let mut word = word;
        if self.arch <= CpuArch::I80186 {
            word |= HIGH_NIBBLE;
            mask |= HIGH_NIBBLE;
        } else if self.arch == CpuArch::I286 && !self.pmode {
            word &= !HIGH_NIBBLE;
            mask |= HIGH_NIBBLE;
        } else {
            mask |= self.arch.ext_flags_toggle();
        }
        self.regs.flags = (self.regs.flags & !mask) | (word & mask) | FLAG_RESERVED1;
        self.sync_direction();
    }

    /// Flags write as performed by a 32-bit POPF at the current privilege.
    pub fn set_flags_d(&mut self, word: u32) {
        let mask = if self.cpl != 0 { FMASK_NORMAL } else { FMASK_ALL };
        self.set_flags(word, mask);
    }

    pub fn set_flags_w(&mut self, word: u16) {
        let mask = if self.cpl != 0 { FMASK_NORMAL } else { FMASK_ALL };
        self.set_flags(u32::from(word), mask & 0xffff);
    }

    /// String-op step (+1 or -1) cached from DF.
    pub fn direction(&self) -> i32 {
        self.direction
    }

    fn sync_direction(&mut self) {
        self.direction = if self.regs.flags & FLAG_DF != 0 { -1 } else { 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Cpu;
    use crate::CpuConfig;

    fn cpu(arch: CpuArch) -> Cpu {
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.arch = arch;
        cpu
    }

    #[test]
    fn reserved_bit_one_always_reads_set() {
        let mut c = cpu(CpuArch::I386);
        c.set_flags(0, FMASK_ALL);
        assert_eq!(c.flags() & FLAG_RESERVED1, FLAG_RESERVED1);
    }

    #[test]
    fn eighty_eighty_six_forces_high_nibble() {
        let mut c = cpu(CpuArch::I8086);
        c.set_flags(0, FMASK_ALL);
        assert_eq!(c.flags() & 0xf000, 0xf000);
    }

    #[test]
    fn two_eighty_six_real_mode_clears_high_nibble() {
        let mut c = cpu(CpuArch::I286);
        c.set_flags(0xffff, FMASK_ALL);
        assert_eq!(c.flags() & 0xf000, 0);
    }

    #[test]
    fn ac_and_id_are_toggleable_by_generation() {
        let mut old = cpu(CpuArch::I486Old);
        old.set_flags(FLAG_AC | FLAG_ID, FMASK_ALL);
        assert!(old.flag(FLAG_AC));
        assert!(!old.flag(FLAG_ID));

        let mut new = cpu(CpuArch::Pentium);
        new.set_flags(FLAG_AC | FLAG_ID, FMASK_ALL);
        assert!(new.flag(FLAG_ID));
    }

    #[test]
    fn df_drives_direction_cache() {
        let mut c = cpu(CpuArch::I386);
        c.set_flags(FLAG_DF, FMASK_ALL);
        assert_eq!(c.direction(), -1);
        c.set_flag(FLAG_DF, false);
        assert_eq!(c.direction(), 1);
    }

    #[test]
    fn user_mode_flags_write_cannot_touch_iopl() {
        let mut c = cpu(CpuArch::I386);
        c.cpl = 3;
        c.set_flags_d(FLAG_IOPL | FLAG_CF);
        assert_eq!(c.iopl(), 0);
        assert!(c.flag(FLAG_CF));
    }
}
