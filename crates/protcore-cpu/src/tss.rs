//! Task state segments and hardware task switching.

use tracing::debug;

use crate::control::CR0_TASK_SWITCHED;
use crate::descriptor::Descriptor;
use crate::flags::{FLAG_NT, FLAG_VM, FMASK_ALL};
use crate::mem::CpuBus;
use crate::regs::{Reg32, SegReg};
use crate::selector;
use crate::state::Cpu;
use crate::tables::Gdt;
use crate::{Exception, Fault};

/// Field offsets of the 32-bit TSS.
pub mod tss32 {
    pub const BACK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const CR3: u32 = 0x1c;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    /// EAX..EDI, 4 bytes each in encoding order.
    pub const GPRS: u32 = 0x28;
    /// ES, CS, SS, DS, FS, GS, 4 bytes each.
    pub const SEGS: u32 = 0x48;
    pub const LDT: u32 = 0x60;
    pub const TRAP: u32 = 0x64;
    pub const IO_MAP_BASE: u32 = 0x66;
    /// Smallest legal limit.
    pub const MIN_LIMIT: u32 = 0x67;
}

/// Field offsets of the 16-bit (286) TSS.
pub mod tss16 {
    pub const BACK: u32 = 0x00;
    pub const SP0: u32 = 0x02;
    pub const SS0: u32 = 0x04;
    pub const IP: u32 = 0x0e;
    pub const FLAGS: u32 = 0x10;
    /// AX..DI, 2 bytes each.
    pub const GPRS: u32 = 0x12;
    /// ES, CS, SS, DS, 2 bytes each.
    pub const SEGS: u32 = 0x22;
    pub const LDT: u32 = 0x2a;
    pub const MIN_LIMIT: u32 = 0x2b;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitch {
    Jmp,
    CallInt,
    Iret,
}

/// The task register and its cached descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStateSegment {
    pub desc: Descriptor,
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub is386: bool,
    pub valid: bool,
}

impl TaskStateSegment {
    /// Point at the TSS named by `sel`. Returns `false` if `sel` does not name a
    /// present TSS descriptor in the GDT; a null selector empties the register.
    pub fn set_selector<B: CpuBus>(
        &mut self,
        bus: &mut B,
        gdt: &Gdt,
        sel: u16,
    ) -> Result<bool, Fault> {
        if sel == 0 {
            *self = TaskStateSegment {
                is386: true,
                ..TaskStateSegment::default()
            };
            return Ok(true);
        }
        if selector::uses_ldt(sel) {
            return Ok(false);
        }
        let Some(desc) = gdt.descriptor(bus, u32::from(sel))? else {
            return Ok(false);
        };
        if !desc.is_tss() || !desc.present() {
            return Ok(false);
        }
        *self = TaskStateSegment {
            desc,
            selector: sel,
            base: desc.base(),
            limit: desc.limit(),
            is386: desc.is_386_tss(),
            valid: true,
        };
        Ok(true)
    }

    /// Linear address of the field at `offset`. The base is guest-controlled
    /// and wraps at 4 GiB.
    pub fn field(&self, offset: u32) -> u32 {
        self.base.wrapping_add(offset)
    }

    /// Back-link selector of a nested task.
    pub fn get_back<B: CpuBus>(&self, bus: &mut B) -> Result<u16, Fault> {
        bus.read_u16(self.field(tss32::BACK))
    }

    /// Inner stack pointer for privilege `level` (0..=2).
    pub fn get_ss_esp<B: CpuBus>(&self, bus: &mut B, level: u8) -> Result<(u16, u32), Fault> {
        let level = u32::from(level);
        if self.is386 {
            let at = self.field(tss32::ESP0 + level * 8);
            let esp = bus.read_u32(at)?;
            let ss = bus.read_u16(at.wrapping_add(4))?;
            Ok((ss, esp))
        } else {
            let at = self.field(tss16::SP0 + level * 4);
            let sp = bus.read_u16(at)?;
            let ss = bus.read_u16(at.wrapping_add(2))?;
            Ok((ss, u32::from(sp)))
        }
    }

    fn min_limit(&self) -> u32 {
        if self.is386 {
            tss32::MIN_LIMIT
        } else {
            tss16::MIN_LIMIT
        }
    }
}

/// Register file as stored in a TSS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TaskImage {
    cr3: u32,
    eip: u32,
    flags: u32,
    gprs: [u32; 8],
    /// ES, CS, SS, DS, FS, GS.
    segs: [u16; 6],
    ldt: u16,
}

impl TaskImage {
    fn capture(cpu: &Cpu, eip: u32, flags: u32) -> Self {
        let mut segs = [0u16; 6];
        for seg in SegReg::ALL {
            segs[seg.index()] = cpu.selector(seg);
        }
        Self {
            cr3: cpu.cr3,
            eip,
            flags,
            gprs: *cpu.regs.gprs(),
            segs,
            ldt: cpu.gdt.sldt(),
        }
    }

    fn read<B: CpuBus>(bus: &mut B, tss: &TaskStateSegment) -> Result<Self, Fault> {
        let mut image = TaskImage::default();
        if tss.is386 {
            image.cr3 = bus.read_u32(tss.field(tss32::CR3))?;
            image.eip = bus.read_u32(tss.field(tss32::EIP))?;
            image.flags = bus.read_u32(tss.field(tss32::EFLAGS))?;
            for (i, reg) in image.gprs.iter_mut().enumerate() {
                *reg = bus.read_u32(tss.field(tss32::GPRS + 4 * i as u32))?;
            }
            for (i, seg) in image.segs.iter_mut().enumerate() {
                *seg = bus.read_u16(tss.field(tss32::SEGS + 4 * i as u32))?;
            }
            image.ldt = bus.read_u16(tss.field(tss32::LDT))?;
        } else {
            image.eip = u32::from(bus.read_u16(tss.field(tss16::IP))?);
            image.flags = u32::from(bus.read_u16(tss.field(tss16::FLAGS))?);
            for (i, reg) in image.gprs.iter_mut().enumerate() {
                *reg = u32::from(bus.read_u16(tss.field(tss16::GPRS + 2 * i as u32))?);
            }
            for (i, seg) in image.segs.iter_mut().take(4).enumerate() {
                *seg = bus.read_u16(tss.field(tss16::SEGS + 2 * i as u32))?;
            }
            image.ldt = bus.read_u16(tss.field(tss16::LDT))?;
        }
        Ok(image)
    }

    /// Store the dynamic fields (not CR3 or the LDT selector).
    fn write<B: CpuBus>(&self, bus: &mut B, tss: &TaskStateSegment) -> Result<(), Fault> {
        if tss.is386 {
            bus.write_u32(tss.field(tss32::EIP), self.eip)?;
            bus.write_u32(tss.field(tss32::EFLAGS), self.flags)?;
            for (i, reg) in self.gprs.iter().enumerate() {
                bus.write_u32(tss.field(tss32::GPRS + 4 * i as u32), *reg)?;
            }
            for (i, seg) in self.segs.iter().enumerate() {
                bus.write_u16(tss.field(tss32::SEGS + 4 * i as u32), *seg)?;
            }
        } else {
            bus.write_u16(tss.field(tss16::IP), self.eip as u16)?;
            bus.write_u16(tss.field(tss16::FLAGS), self.flags as u16)?;
            for (i, reg) in self.gprs.iter().enumerate() {
                bus.write_u16(tss.field(tss16::GPRS + 2 * i as u32), *reg as u16)?;
            }
            for (i, seg) in self.segs.iter().take(4).enumerate() {
                bus.write_u16(tss.field(tss16::SEGS + 2 * i as u32), *seg)?;
            }
        }
        Ok(())
    }
}

/// Segment load faults inside a task switch are reported as #TS.
fn as_invalid_tss(fault: Fault, sel: u16) -> Fault {
    if fault.exception == Exception::GeneralProtection {
        Fault::ts(selector::error_code(sel))
    } else {
        fault
    }
}

impl Cpu {
    /// Switch to the task named by `new_sel`.
    ///
    /// Once the outgoing state has been saved the switch is committed; a fault
    /// while loading the incoming segments is returned to the caller and is
    /// delivered in the context of the new task.
    pub fn switch_task<B: CpuBus>(
        &mut self,
        bus: &mut B,
        new_sel: u16,
        kind: TaskSwitch,
        old_eip: u32,
    ) -> Result<(), Fault> {
        let code = selector::error_code(new_sel);
        let mut new_tss = TaskStateSegment::default();
        if new_sel == 0 || !new_tss.set_selector(bus, &self.gdt, new_sel)? {
            return Err(Fault::ts(code));
        }
        let busy = new_tss.desc.tss_busy();
        match kind {
            TaskSwitch::Iret if !busy => return Err(Fault::ts(code)),
            TaskSwitch::Jmp | TaskSwitch::CallInt if busy => return Err(Fault::gp(code)),
            _ => {}
        }
        if new_tss.limit < new_tss.min_limit() {
            return Err(Fault::ts(code));
        }

        let incoming = TaskImage::read(bus, &new_tss)?;
        let old_tss = self.tss;

        if matches!(kind, TaskSwitch::Jmp | TaskSwitch::Iret) && old_tss.valid {
            let mut desc = old_tss.desc;
            desc.set_tss_busy(false);
            self.gdt.set_descriptor(bus, u32::from(old_tss.selector), &desc)?;
        }

        let mut old_flags = self.regs.flags;
        if kind == TaskSwitch::Iret {
            old_flags &= !FLAG_NT;
        }
        let outgoing = TaskImage::capture(self, old_eip, old_flags);
        if old_tss.valid {
            outgoing.write(bus, &old_tss)?;
        }

        let same_task = old_tss.valid && new_sel == old_tss.selector;
        let mut image = if same_task { outgoing } else { incoming };

        if kind == TaskSwitch::CallInt {
            bus.write_u16(new_tss.field(tss32::BACK), old_tss.selector)?;
            image.flags |= FLAG_NT;
        }
        if kind != TaskSwitch::Iret {
            new_tss.desc.set_tss_busy(true);
            self.gdt.set_descriptor(bus, u32::from(new_sel), &new_tss.desc)?;
        }
        self.cr0 |= CR0_TASK_SWITCHED;
        self.tss = new_tss;
        debug!(from = old_tss.selector, to = new_sel, ?kind, "task switch");

        if new_tss.is386 {
            if image.cr3 != self.cr3 {
                self.cr3 = image.cr3;
                bus.set_page_directory(image.cr3);
            }
            self.regs.eip = image.eip;
            self.set_flags(image.flags, FMASK_ALL | FLAG_VM);
            for reg in Reg32::ALL {
                self.regs.set32(reg, image.gprs[reg.index()]);
            }
        } else {
            self.regs.eip = image.eip & 0xffff;
            self.set_flags(image.flags, FMASK_ALL & 0xffff);
            for reg in Reg32::ALL {
                self.regs.set16(reg, image.gprs[reg.index()] as u16);
            }
        }

        if self.v86() {
            for seg in SegReg::ALL {
                self.set_seg_real(seg, image.segs[seg.index()]);
            }
            self.set_cpl(bus, 3);
            return Ok(());
        }

        self.gdt.lldt(bus, image.ldt).map_err(|f| as_invalid_tss(f, image.ldt))?;

        let cs = image.segs[SegReg::Cs.index()];
        let cs_code = selector::error_code(cs);
        if selector::is_null(cs) {
            return Err(Fault::ts(0));
        }
        let cs_desc = self.gdt.descriptor(bus, u32::from(cs))?.ok_or(Fault::ts(cs_code))?;
        if !cs_desc.is_code() {
            return Err(Fault::ts(cs_code));
        }
        let rpl = selector::rpl(cs);
        if (cs_desc.conforming() && cs_desc.dpl() > rpl)
            || (!cs_desc.conforming() && cs_desc.dpl() != rpl)
        {
            return Err(Fault::ts(cs_code));
        }
        if !cs_desc.present() {
            return Err(Fault::np(cs_code));
        }
        self.set_cpl(bus, rpl);
        self.load_cs(cs, &cs_desc);

        let data_segs: &[SegReg] = if new_tss.is386 {
            &[SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs]
        } else {
            &[SegReg::Es, SegReg::Ss, SegReg::Ds]
        };
        for &seg in data_segs {
            let sel = image.segs[seg.index()];
            self.set_seg_general(bus, seg, sel).map_err(|f| as_invalid_tss(f, sel))?;
        }
        Ok(())
    }

    /// Check port access against IOPL and the TSS I/O permission bitmap.
    pub fn io_exception<B: CpuBus>(
        &mut self,
        bus: &mut B,
        port: u16,
        size: u8,
    ) -> Result<(), Fault> {
        if !self.pmode || (self.iopl() >= self.cpl && !self.v86()) {
            return Ok(());
        }
        self.mpl = 0;
        let allowed = self.io_bitmap_allows(bus, port, size);
        self.mpl = 3;
        match allowed {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(port, size, "io permission denied");
                Err(Fault::gp0())
            }
            Err(fault) => Err(fault),
        }
    }

    fn io_bitmap_allows<B: CpuBus>(&self, bus: &mut B, port: u16, size: u8) -> Result<bool, Fault> {
        if !self.tss.valid || !self.tss.is386 {
            return Ok(false);
        }
        let ofs = u32::from(bus.read_u16(self.tss.field(tss32::IO_MAP_BASE))?);
        if ofs > self.tss.limit {
            return Ok(false);
        }
        let at = ofs + u32::from(port / 8);
        if at + 1 > self.tss.limit {
            return Ok(false);
        }
        let map = u32::from(bus.read_u16(self.tss.field(at))?);
        let mask = (0xffffu32 >> (16 - u32::from(size))) << (port & 7);
        Ok(map & mask == 0)
    }
}
