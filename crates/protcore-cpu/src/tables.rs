//! GDT/LDT/IDT storage.
//!
//! Only the table base/limit pairs live here; descriptors are always re-read
//! from guest memory. The LDT base/limit/selector are the one cached piece of
//! table state and change only through [`Gdt::lldt`].

use tracing::debug;

use crate::descriptor::{kind, Descriptor};
use crate::mem::CpuBus;
use crate::selector;
use crate::Fault;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u32,
}

impl DescriptorTable {
    pub const fn new(base: u32, limit: u32) -> Self {
        Self { base, limit }
    }

    /// Fetch the descriptor at `selector & !7`, or `None` if it lies at or
    /// past the table limit.
    pub fn descriptor<B: CpuBus>(
        &self,
        bus: &mut B,
        selector: u32,
    ) -> Result<Option<Descriptor>, Fault> {
        let offset = selector & !7;
        if offset >= self.limit {
            return Ok(None);
        }
        Descriptor::load(bus, self.base.wrapping_add(offset)).map(Some)
    }

    pub fn set_descriptor<B: CpuBus>(
        &self,
        bus: &mut B,
        selector: u32,
        desc: &Descriptor,
    ) -> Result<bool, Fault> {
        let offset = selector & !7;
        if offset >= self.limit {
            return Ok(false);
        }
        desc.save(bus, self.base.wrapping_add(offset))?;
        Ok(true)
    }
}

/// The GDT plus the cached LDT it currently routes TI=1 selectors to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Gdt {
    pub table: DescriptorTable,
    ldt_base: u32,
    ldt_limit: u32,
    ldt_value: u16,
}

impl Gdt {
    fn route(&self, selector: u32) -> DescriptorTable {
        if selector & u32::from(selector::TI) != 0 {
            DescriptorTable::new(self.ldt_base, self.ldt_limit)
        } else {
            self.table
        }
    }

    pub fn descriptor<B: CpuBus>(
        &self,
        bus: &mut B,
        selector: u32,
    ) -> Result<Option<Descriptor>, Fault> {
        self.route(selector).descriptor(bus, selector)
    }

    pub fn set_descriptor<B: CpuBus>(
        &self,
        bus: &mut B,
        selector: u32,
        desc: &Descriptor,
    ) -> Result<bool, Fault> {
        self.route(selector).set_descriptor(bus, selector, desc)
    }

    pub fn ldt_base(&self) -> u32 {
        self.ldt_base
    }

    pub fn ldt_limit(&self) -> u32 {
        self.ldt_limit
    }

    pub fn sldt(&self) -> u16 {
        self.ldt_value
    }

    /// Load the LDT register. A null selector leaves the CPU without an LDT;
    /// anything else must name a present LDT descriptor in the GDT.
    pub fn lldt<B: CpuBus>(&mut self, bus: &mut B, value: u16) -> Result<(), Fault> {
        if value & 0xfffc == 0 {
            self.ldt_base = 0;
            self.ldt_limit = 0;
            self.ldt_value = 0;
            return Ok(());
        }
        if value & selector::TI != 0 {
            return Err(Fault::gp(u32::from(value & 0xfffc)));
        }
        let desc = self
            .table
            .descriptor(bus, u32::from(value))?
            .ok_or(Fault::gp(u32::from(value)))?;
        if desc.kind() != kind::LDT {
            return Err(Fault::gp(u32::from(value)));
        }
        if !desc.present() {
            return Err(Fault::np(u32::from(value)));
        }
        self.ldt_base = desc.base();
        self.ldt_limit = desc.limit();
        self.ldt_value = value;
        debug!(selector = value, base = self.ldt_base, limit = self.ldt_limit, "lldt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DescriptorTable, Gdt};
    use crate::descriptor::{kind, Descriptor};
    use crate::mem::FlatTestBus;
    use crate::Exception;

    fn bus_with_gdt(entries: &[Descriptor]) -> (FlatTestBus, Gdt) {
        let mut bus = FlatTestBus::new(0x4000);
        for (i, d) in entries.iter().enumerate() {
            d.save(&mut bus, 0x1000 + (i as u32) * 8).unwrap();
        }
        let gdt = Gdt {
            table: DescriptorTable::new(0x1000, (entries.len() as u32) * 8 - 1),
            ..Gdt::default()
        };
        (bus, gdt)
    }

    #[test]
    fn lldt_null_clears_previous_ldt() {
        let ldt = Descriptor::segment(0x2000, 0x3f, kind::LDT, 0, false, false);
        let (mut bus, mut gdt) = bus_with_gdt(&[Descriptor::default(), ldt]);
        gdt.lldt(&mut bus, 0x08).unwrap();
        assert_eq!(gdt.ldt_base(), 0x2000);
        gdt.lldt(&mut bus, 0x0003).unwrap();
        assert_eq!((gdt.ldt_base(), gdt.ldt_limit(), gdt.sldt()), (0, 0, 0));
    }

    #[test]
    fn lldt_rejects_non_ldt_descriptor_with_selector_error_code() {
        let data = Descriptor::segment(0, 0xffff, kind::DATA_EU_RW_A, 0, false, false);
        let (mut bus, mut gdt) = bus_with_gdt(&[Descriptor::default(), data]);
        let fault = gdt.lldt(&mut bus, 0x08).unwrap_err();
        assert_eq!(fault.exception, Exception::GeneralProtection);
        assert_eq!(fault.error_code, 0x08);
        assert_eq!(gdt.sldt(), 0);
    }

    #[test]
    fn lldt_not_present_raises_np() {
        let mut ldt = Descriptor::segment(0x2000, 0x3f, kind::LDT, 0, false, false);
        ldt.set_present(false);
        let (mut bus, mut gdt) = bus_with_gdt(&[Descriptor::default(), ldt]);
        let fault = gdt.lldt(&mut bus, 0x08).unwrap_err();
        assert_eq!(fault.exception, Exception::SegmentNotPresent);
    }

    #[test]
    fn ti_bit_routes_to_cached_ldt() {
        let ldt = Descriptor::segment(0x2000, 0x0f, kind::LDT, 0, false, false);
        let (mut bus, mut gdt) = bus_with_gdt(&[Descriptor::default(), ldt]);
        let in_ldt = Descriptor::segment(0xabc0, 0xff, kind::DATA_EU_RO_A, 3, false, false);
        in_ldt.save(&mut bus, 0x2008).unwrap();
        gdt.lldt(&mut bus, 0x08).unwrap();

        let found = gdt.descriptor(&mut bus, 0x0f).unwrap().unwrap();
        assert_eq!(found.base(), 0xabc0);
        // Offset 0x10 is past the LDT limit of 0x0f.
        assert!(gdt.descriptor(&mut bus, 0x14).unwrap().is_none());
        // The same index with TI clear reads the GDT's LDT descriptor.
        assert_eq!(gdt.descriptor(&mut bus, 0x08).unwrap().unwrap().kind(), kind::LDT);
    }
}
