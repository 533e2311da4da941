//! Control, debug and test registers, plus the machine status word.

use tracing::debug;

use crate::arch::CpuArch;
use crate::mem::CpuBus;
use crate::state::Cpu;
use crate::Fault;

pub const CR0_PROTECTION: u32 = 0x0000_0001;
pub const CR0_MONITOR_PROCESSOR: u32 = 0x0000_0002;
pub const CR0_FPU_EMULATION: u32 = 0x0000_0004;
pub const CR0_TASK_SWITCHED: u32 = 0x0000_0008;
pub const CR0_FPU_PRESENT: u32 = 0x0000_0010;
pub const CR0_WRITE_PROTECT: u32 = 0x0001_0000;
pub const CR0_PAGING: u32 = 0x8000_0000;

impl Cpu {
    /// Update CR0 and everything that follows from it (mode, paging, WP).
    pub fn write_cr0<B: CpuBus>(&mut self, bus: &mut B, value: u32) {
        let value = value | CR0_FPU_PRESENT;
        let changed = self.cr0 ^ value;
        if changed == 0 {
            return;
        }
        if changed & CR0_WRITE_PROTECT != 0 && self.arch >= CpuArch::I486Old {
            bus.set_write_protect(value & CR0_WRITE_PROTECT != 0);
        }
        self.cr0 = value;
        if value & CR0_PROTECTION != 0 {
            self.pmode = true;
            self.entered_pmode = true;
            bus.set_paging(value & CR0_PAGING != 0);
            debug!("protected mode");
        } else {
            self.pmode = false;
            bus.set_paging(false);
            debug!("real mode");
        }
    }

    fn check_crx_access(&self, cr: u8) -> Result<(), Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        if cr == 1 || cr > 4 || (cr == 4 && self.arch < CpuArch::I486Old) {
            return Err(Fault::ud());
        }
        Ok(())
    }

    /// MOV CRn, reg.
    pub fn write_crx<B: CpuBus>(&mut self, bus: &mut B, cr: u8, value: u32) -> Result<(), Fault> {
        self.check_crx_access(cr)?;
        match cr {
            0 => self.write_cr0(bus, value),
            2 => self.cr2 = value,
            3 => {
                self.cr3 = value;
                bus.set_page_directory(value);
            }
            _ => self.cr4 = value,
        }
        Ok(())
    }

    /// MOV reg, CRn.
    pub fn read_crx(&self, cr: u8) -> Result<u32, Fault> {
        self.check_crx_access(cr)?;
        Ok(match cr {
            0 => self.cr0_visible(),
            2 => self.cr2,
            3 => self.cr3 & 0xffff_f000,
            _ => self.cr4,
        })
    }

    /// CR0 as software reads it; older parts report reserved bits as set.
    pub fn cr0_visible(&self) -> u32 {
        if self.arch >= CpuArch::Pentium {
            self.cr0
        } else if self.arch >= CpuArch::I486Old {
            self.cr0 & 0xe005_003f
        } else {
            self.cr0 | 0x7fff_fff0
        }
    }

    pub fn write_drx(&mut self, dr: u8, value: u32) -> Result<(), Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        match dr {
            0..=3 => self.drx[dr as usize] = value,
            4 | 6 => self.drx[6] = (value | 0xffff_0ff0) & 0xffff_efff,
            5 | 7 => {
                self.drx[7] = if self.arch < CpuArch::Pentium {
                    (value | 0x400) & 0xffff_2fff
                } else {
                    value | 0x400
                };
            }
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    pub fn read_drx(&self, dr: u8) -> Result<u32, Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        match dr {
            0..=3 | 6 | 7 => Ok(self.drx[dr as usize]),
            4 => Ok(self.drx[6]),
            5 => Ok(self.drx[7]),
            _ => Err(Fault::ud()),
        }
    }

    pub fn write_trx(&mut self, tr: u8, value: u32) -> Result<(), Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        match tr {
            6 | 7 => {
                self.trx[tr as usize] = value;
                Ok(())
            }
            _ => Err(Fault::ud()),
        }
    }

    pub fn read_trx(&self, tr: u8) -> Result<u32, Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        match tr {
            6 | 7 => Ok(self.trx[tr as usize]),
            _ => Err(Fault::ud()),
        }
    }

    pub fn smsw(&self) -> u16 {
        self.cr0_visible() as u16
    }

    /// LMSW sets PE, MP, EM and TS but can never clear PE.
    pub fn lmsw<B: CpuBus>(&mut self, bus: &mut B, word: u16) -> Result<(), Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        let mut word = u32::from(word) & 0xf;
        if self.cr0 & CR0_PROTECTION != 0 {
            word |= CR0_PROTECTION;
        }
        word |= self.cr0 & 0xffff_fff0;
        self.write_cr0(bus, word);
        Ok(())
    }

    pub fn clts(&mut self) -> Result<(), Fault> {
        if self.pmode && self.cpl > 0 {
            return Err(Fault::gp0());
        }
        self.cr0 &= !CR0_TASK_SWITCHED;
        Ok(())
    }
}
