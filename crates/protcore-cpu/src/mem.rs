use std::ops::Range;

use crate::Fault;

/// Linear-memory, port I/O and paging hooks consumed by the CPU.
///
/// Reads and writes take linear addresses; translating them (and raising #PF)
/// belongs to the implementor. The paging hooks default to no-ops so a flat
/// bus only has to provide byte access.
pub trait CpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Fault>;
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Fault>;

    fn read_u16(&mut self, addr: u32) -> Result<u16, Fault> {
        let lo = self.read_u8(addr)? as u16;
        let hi = self.read_u8(addr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Fault> {
        let lo = self.read_u16(addr)? as u32;
        let hi = self.read_u16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), Fault> {
        self.write_u8(addr, val as u8)?;
        self.write_u8(addr.wrapping_add(1), (val >> 8) as u8)
    }

    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Fault> {
        self.write_u16(addr, val as u16)?;
        self.write_u16(addr.wrapping_add(2), (val >> 16) as u16)
    }

    /// Port read of `size` bytes (1, 2 or 4). Unclaimed ports float high.
    fn io_read(&mut self, _port: u16, size: u8) -> u32 {
        match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        }
    }

    fn io_write(&mut self, _port: u16, _size: u8, _val: u32) {}

    fn set_paging(&mut self, _enabled: bool) {}

    fn set_write_protect(&mut self, _enabled: bool) {}

    fn set_page_directory(&mut self, _cr3: u32) {}

    /// Called when CPL moves between supervisor (0..=2) and user (3).
    fn set_user_mode(&mut self, _user: bool) {}
}

/// Identity-mapped memory bus used by tests.
///
/// Accesses past the end of memory, or inside a region registered with
/// [`FlatTestBus::unmap`], fail with #PF. Reads can be recorded to check which
/// guest bytes an operation touched.
#[derive(Debug, Clone, Default)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    unmapped: Vec<Range<u32>>,
    recording: Option<Vec<u32>>,
    pub ports: Vec<(u16, u8, u32)>,
    pub page_directory: Vec<u32>,
    pub paging: bool,
    pub write_protect: bool,
    pub user_mode: bool,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            ..Self::default()
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    pub fn unmap(&mut self, range: Range<u32>) {
        self.unmapped.push(range);
    }

    pub fn start_recording(&mut self) {
        self.recording = Some(Vec::new());
    }

    /// Addresses of every byte read since [`Self::start_recording`].
    pub fn take_recorded_reads(&mut self) -> Vec<u32> {
        self.recording.take().unwrap_or_default()
    }

    fn check(&self, addr: u32, write: bool) -> Result<usize, Fault> {
        let code = if write { 0b10 } else { 0 };
        if self.unmapped.iter().any(|r| r.contains(&addr)) || addr as usize >= self.mem.len() {
            return Err(Fault::page_fault(addr, code));
        }
        Ok(addr as usize)
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Fault> {
        let idx = self.check(addr, false)?;
        if let Some(reads) = self.recording.as_mut() {
            reads.push(addr);
        }
        Ok(self.mem[idx])
    }

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Fault> {
        let idx = self.check(addr, true)?;
        self.mem[idx] = val;
        Ok(())
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) {
        self.ports.push((port, size, val));
    }

    fn set_paging(&mut self, enabled: bool) {
        self.paging = enabled;
    }

    fn set_write_protect(&mut self, enabled: bool) {
        self.write_protect = enabled;
    }

    fn set_page_directory(&mut self, cr3: u32) {
        self.page_directory.push(cr3);
    }

    fn set_user_mode(&mut self, user: bool) {
        self.user_mode = user;
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuBus, FlatTestBus};
    use crate::Exception;

    #[test]
    fn unmapped_range_faults_with_the_linear_address() {
        let mut bus = FlatTestBus::new(0x1000);
        bus.unmap(0x800..0x900);
        let fault = bus.write_u16(0x8ff, 0x1234).unwrap_err();
        assert_eq!(fault.exception, Exception::PageFault);
        assert_eq!(fault.address, Some(0x8ff));
        assert_eq!(fault.error_code, 0b10);
    }

    #[test]
    fn little_endian_dword_access() {
        let mut bus = FlatTestBus::new(16);
        bus.write_u32(4, 0x1122_3344).unwrap();
        assert_eq!(bus.slice(4, 4), &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(bus.read_u16(6).unwrap(), 0x1122);
    }
}
