use crate::mem::CpuBus;
use crate::regs::{Reg32, SegReg};
use crate::state::Cpu;
use crate::Fault;

/// SS size attributes. ESP updates only touch the bits in `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAttrs {
    pub mask: u32,
    pub notmask: u32,
    pub big: bool,
}

impl Default for StackAttrs {
    fn default() -> Self {
        Self {
            mask: 0xffff,
            notmask: 0xffff_0000,
            big: false,
        }
    }
}

impl StackAttrs {
    pub fn set_big(&mut self, big: bool) {
        self.big = big;
        if big {
            self.mask = 0xffff_ffff;
            self.notmask = 0;
        } else {
            self.mask = 0xffff;
            self.notmask = 0xffff_0000;
        }
    }

    /// `esp` moved by `delta` within the stack's address width.
    pub fn step(&self, esp: u32, delta: i32) -> u32 {
        (esp & self.notmask) | (esp.wrapping_add(delta as u32) & self.mask)
    }
}

impl Cpu {
    pub fn esp(&self) -> u32 {
        self.regs.get32(Reg32::Esp)
    }

    pub fn set_esp(&mut self, esp: u32) {
        self.regs.set32(Reg32::Esp, esp);
    }

    fn stack_addr(&self, esp: u32) -> u32 {
        self.seg_base(SegReg::Ss).wrapping_add(esp & self.stack.mask)
    }

    pub fn push16<B: CpuBus>(&mut self, bus: &mut B, val: u16) -> Result<(), Fault> {
        let new_esp = self.stack.step(self.esp(), -2);
        bus.write_u16(self.stack_addr(new_esp), val)?;
        self.set_esp(new_esp);
        Ok(())
    }

    pub fn push32<B: CpuBus>(&mut self, bus: &mut B, val: u32) -> Result<(), Fault> {
        let new_esp = self.stack.step(self.esp(), -4);
        bus.write_u32(self.stack_addr(new_esp), val)?;
        self.set_esp(new_esp);
        Ok(())
    }

    pub fn pop16<B: CpuBus>(&mut self, bus: &mut B) -> Result<u16, Fault> {
        let esp = self.esp();
        let val = bus.read_u16(self.stack_addr(esp))?;
        self.set_esp(self.stack.step(esp, 2));
        Ok(val)
    }

    pub fn pop32<B: CpuBus>(&mut self, bus: &mut B) -> Result<u32, Fault> {
        let esp = self.esp();
        let val = bus.read_u32(self.stack_addr(esp))?;
        self.set_esp(self.stack.step(esp, 4));
        Ok(val)
    }

    pub fn push<B: CpuBus>(&mut self, bus: &mut B, use32: bool, val: u32) -> Result<(), Fault> {
        if use32 {
            self.push32(bus, val)
        } else {
            self.push16(bus, val as u16)
        }
    }

    pub fn pop<B: CpuBus>(&mut self, bus: &mut B, use32: bool) -> Result<u32, Fault> {
        if use32 {
            self.pop32(bus)
        } else {
            self.pop16(bus).map(u32::from)
        }
    }

    /// Read the stack `offset` bytes above ESP without popping.
    pub fn peek16<B: CpuBus>(&self, bus: &mut B, offset: u32) -> Result<u16, Fault> {
        let esp = self.stack.step(self.esp(), offset as i32);
        bus.read_u16(self.stack_addr(esp))
    }

    pub fn peek32<B: CpuBus>(&self, bus: &mut B, offset: u32) -> Result<u32, Fault> {
        let esp = self.stack.step(self.esp(), offset as i32);
        bus.read_u32(self.stack_addr(esp))
    }
}

#[cfg(test)]
mod tests {
    use super::StackAttrs;
    use crate::mem::FlatTestBus;
    use crate::state::Cpu;
    use crate::CpuConfig;

    #[test]
    fn sixteen_bit_stack_wraps_inside_low_word() {
        let attrs = StackAttrs::default();
        assert_eq!(attrs.step(0x1234_0000, -2), 0x1234_fffe);
    }

    #[test]
    fn push_then_pop_restores_esp() {
        let mut bus = FlatTestBus::new(0x2_0000);
        let mut cpu = Cpu::new(&CpuConfig::default());
        cpu.set_seg_real(crate::regs::SegReg::Ss, 0x1000);
        cpu.set_esp(0x100);
        cpu.push32(&mut bus, 0xcafe_f00d).unwrap();
        assert_eq!(cpu.esp(), 0xfc);
        assert_eq!(cpu.peek32(&mut bus, 0).unwrap(), 0xcafe_f00d);
        assert_eq!(cpu.pop32(&mut bus).unwrap(), 0xcafe_f00d);
        assert_eq!(cpu.esp(), 0x100);
    }
}
