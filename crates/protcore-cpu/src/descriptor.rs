//! 8-byte segment and gate descriptors.
//!
//! A descriptor is held as its two raw little-endian dwords and every field is
//! read through a mask/shift accessor. The bit ranges below are the only place
//! the layout is written down; all accessors reference these constants.
//!
//! Low dword (`lo`):
//!
//! | bits   | segment form | gate form    |
//! |--------|--------------|--------------|
//! | 0..16  | limit 15:0   | offset 15:0  |
//! | 16..32 | base 15:0    | selector     |
//!
//! High dword (`hi`):
//!
//! | bits   | segment form | gate form    |
//! |--------|--------------|--------------|
//! | 0..8   | base 23:16   | param count (0..5) |
//! | 8..13  | type (S bit + 4 type bits) | type |
//! | 13..15 | DPL          | DPL          |
//! | 15     | present      | present      |
//! | 16..20 | limit 19:16  | offset 31:16 (16..32) |
//! | 20     | AVL          |              |
//! | 22     | D/B ("big")  |              |
//! | 23     | granularity  |              |
//! | 24..32 | base 31:24   |              |

use crate::mem::CpuBus;
use crate::Fault;

pub const LIMIT_LO_MASK: u32 = 0x0000_ffff;
pub const BASE_LO_SHIFT: u32 = 16;
pub const GATE_SELECTOR_SHIFT: u32 = 16;
pub const GATE_OFFSET_LO_MASK: u32 = 0x0000_ffff;

pub const BASE_MID_MASK: u32 = 0x0000_00ff;
pub const PARAM_COUNT_MASK: u32 = 0x0000_001f;
pub const TYPE_SHIFT: u32 = 8;
pub const TYPE_MASK: u32 = 0x1f;
pub const DPL_SHIFT: u32 = 13;
pub const DPL_MASK: u32 = 0x3;
pub const PRESENT_BIT: u32 = 1 << 15;
pub const LIMIT_HI_SHIFT: u32 = 16;
pub const LIMIT_HI_MASK: u32 = 0xf;
pub const GATE_OFFSET_HI_MASK: u32 = 0xffff_0000;
pub const AVL_BIT: u32 = 1 << 20;
pub const BIG_BIT: u32 = 1 << 22;
pub const GRANULARITY_BIT: u32 = 1 << 23;
pub const BASE_HI_MASK: u32 = 0xff00_0000;

/// Access-rights bytes as reported by `LAR` (type, DPL, P, AVL, D/B, G).
pub const ACCESS_RIGHTS_MASK: u32 = 0x00ff_ff00;

/// Descriptor type values (the 5-bit field including the S bit).
pub mod kind {
    pub const INVALID: u8 = 0x00;
    pub const TSS_286_AVAILABLE: u8 = 0x01;
    pub const LDT: u8 = 0x02;
    pub const TSS_286_BUSY: u8 = 0x03;
    pub const CALL_GATE_286: u8 = 0x04;
    pub const TASK_GATE: u8 = 0x05;
    pub const INT_GATE_286: u8 = 0x06;
    pub const TRAP_GATE_286: u8 = 0x07;
    pub const TSS_386_AVAILABLE: u8 = 0x09;
    pub const TSS_386_BUSY: u8 = 0x0b;
    pub const CALL_GATE_386: u8 = 0x0c;
    pub const INT_GATE_386: u8 = 0x0e;
    pub const TRAP_GATE_386: u8 = 0x0f;

    // Data: 1 0 E W A
    pub const DATA_EU_RO_NA: u8 = 0x10;
    pub const DATA_EU_RO_A: u8 = 0x11;
    pub const DATA_EU_RW_NA: u8 = 0x12;
    pub const DATA_EU_RW_A: u8 = 0x13;
    pub const DATA_ED_RO_NA: u8 = 0x14;
    pub const DATA_ED_RO_A: u8 = 0x15;
    pub const DATA_ED_RW_NA: u8 = 0x16;
    pub const DATA_ED_RW_A: u8 = 0x17;

    // Code: 1 1 C R A
    pub const CODE_X_NC_NA: u8 = 0x18;
    pub const CODE_X_NC_A: u8 = 0x19;
    pub const CODE_XR_NC_NA: u8 = 0x1a;
    pub const CODE_XR_NC_A: u8 = 0x1b;
    pub const CODE_X_C_NA: u8 = 0x1c;
    pub const CODE_X_C_A: u8 = 0x1d;
    pub const CODE_XR_C_NA: u8 = 0x1e;
    pub const CODE_XR_C_A: u8 = 0x1f;

    /// S bit: code/data segment rather than a system descriptor.
    pub const SEGMENT: u8 = 0x10;
    pub const CODE: u8 = 0x08;
    pub const CONFORMING: u8 = 0x04;
    pub const EXPAND_DOWN: u8 = 0x04;
    pub const READABLE: u8 = 0x02;
    pub const WRITABLE: u8 = 0x02;
    pub const ACCESSED: u8 = 0x01;
    /// Busy bit of a TSS descriptor type.
    pub const TSS_BUSY: u8 = 0x02;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub lo: u32,
    pub hi: u32,
}

impl Descriptor {
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            lo: raw as u32,
            hi: (raw >> 32) as u32,
        }
    }

    pub const fn raw(self) -> u64 {
        (self.hi as u64) << 32 | self.lo as u64
    }

    /// Build a code/data/system segment descriptor. `limit` is the raw 20-bit
    /// field, `kind` the 5-bit type.
    pub fn segment(base: u32, limit: u32, kind: u8, dpl: u8, big: bool, granular: bool) -> Self {
        let lo = (limit & LIMIT_LO_MASK) | (base << BASE_LO_SHIFT);
        let mut hi = (base >> 16) & BASE_MID_MASK;
        hi |= (u32::from(kind) & TYPE_MASK) << TYPE_SHIFT;
        hi |= (u32::from(dpl) & DPL_MASK) << DPL_SHIFT;
        hi |= PRESENT_BIT;
        hi |= ((limit >> 16) & LIMIT_HI_MASK) << LIMIT_HI_SHIFT;
        if big {
            hi |= BIG_BIT;
        }
        if granular {
            hi |= GRANULARITY_BIT;
        }
        hi |= base & BASE_HI_MASK;
        Self { lo, hi }
    }

    /// Build a call/interrupt/trap/task gate.
    pub fn gate(selector: u16, offset: u32, kind: u8, dpl: u8, param_count: u8) -> Self {
        let lo = (offset & GATE_OFFSET_LO_MASK) | (u32::from(selector) << GATE_SELECTOR_SHIFT);
        let hi = (offset & GATE_OFFSET_HI_MASK)
            | PRESENT_BIT
            | (u32::from(dpl) & DPL_MASK) << DPL_SHIFT
            | (u32::from(kind) & TYPE_MASK) << TYPE_SHIFT
            | (u32::from(param_count) & PARAM_COUNT_MASK);
        Self { lo, hi }
    }

    pub fn load<B: CpuBus>(bus: &mut B, addr: u32) -> Result<Self, Fault> {
        let lo = bus.read_u32(addr)?;
        let hi = bus.read_u32(addr.wrapping_add(4))?;
        Ok(Self { lo, hi })
    }

    pub fn save<B: CpuBus>(&self, bus: &mut B, addr: u32) -> Result<(), Fault> {
        bus.write_u32(addr, self.lo)?;
        bus.write_u32(addr.wrapping_add(4), self.hi)
    }

    pub fn base(&self) -> u32 {
        (self.lo >> BASE_LO_SHIFT) | (self.hi & BASE_MID_MASK) << 16 | (self.hi & BASE_HI_MASK)
    }

    /// Raw 20-bit limit field, unscaled.
    pub fn raw_limit(&self) -> u32 {
        (self.lo & LIMIT_LO_MASK) | ((self.hi >> LIMIT_HI_SHIFT) & LIMIT_HI_MASK) << 16
    }

    /// Byte-granular limit; page granularity forces the low 12 bits to 1.
    pub fn limit(&self) -> u32 {
        let limit = self.raw_limit();
        if self.granular() {
            (limit << 12) | 0xfff
        } else {
            limit
        }
    }

    pub fn offset(&self) -> u32 {
        (self.lo & GATE_OFFSET_LO_MASK) | (self.hi & GATE_OFFSET_HI_MASK)
    }

    pub fn selector(&self) -> u16 {
        (self.lo >> GATE_SELECTOR_SHIFT) as u16
    }

    pub fn param_count(&self) -> u8 {
        (self.hi & PARAM_COUNT_MASK) as u8
    }

    pub fn kind(&self) -> u8 {
        ((self.hi >> TYPE_SHIFT) & TYPE_MASK) as u8
    }

    pub fn set_kind(&mut self, kind: u8) {
        self.hi =
            (self.hi & !(TYPE_MASK << TYPE_SHIFT)) | (u32::from(kind) & TYPE_MASK) << TYPE_SHIFT;
    }

    pub fn dpl(&self) -> u8 {
        ((self.hi >> DPL_SHIFT) & DPL_MASK) as u8
    }

    pub fn present(&self) -> bool {
        self.hi & PRESENT_BIT != 0
    }

    pub fn set_present(&mut self, present: bool) {
        if present {
            self.hi |= PRESENT_BIT;
        } else {
            self.hi &= !PRESENT_BIT;
        }
    }

    pub fn big(&self) -> bool {
        self.hi & BIG_BIT != 0
    }

    pub fn granular(&self) -> bool {
        self.hi & GRANULARITY_BIT != 0
    }

    pub fn access_rights(&self) -> u32 {
        self.hi & ACCESS_RIGHTS_MASK
    }

    pub fn is_segment(&self) -> bool {
        self.kind() & kind::SEGMENT != 0
    }

    pub fn is_code(&self) -> bool {
        self.kind() & (kind::SEGMENT | kind::CODE) == kind::SEGMENT | kind::CODE
    }

    pub fn is_data(&self) -> bool {
        self.kind() & (kind::SEGMENT | kind::CODE) == kind::SEGMENT
    }

    pub fn conforming(&self) -> bool {
        self.is_code() && self.kind() & kind::CONFORMING != 0
    }

    pub fn readable(&self) -> bool {
        self.is_data() || (self.is_code() && self.kind() & kind::READABLE != 0)
    }

    pub fn writable(&self) -> bool {
        self.is_data() && self.kind() & kind::WRITABLE != 0
    }

    /// Only data segments can expand down; code types never do.
    pub fn expand_down(&self) -> bool {
        self.is_data() && self.kind() & kind::EXPAND_DOWN != 0
    }

    pub fn is_tss(&self) -> bool {
        matches!(
            self.kind(),
            kind::TSS_286_AVAILABLE
                | kind::TSS_286_BUSY
                | kind::TSS_386_AVAILABLE
                | kind::TSS_386_BUSY
        )
    }

    pub fn is_386_tss(&self) -> bool {
        matches!(self.kind(), kind::TSS_386_AVAILABLE | kind::TSS_386_BUSY)
    }

    pub fn tss_busy(&self) -> bool {
        self.is_tss() && self.kind() & kind::TSS_BUSY != 0
    }

    pub fn set_tss_busy(&mut self, busy: bool) {
        let kind = self.kind();
        if busy {
            self.set_kind(kind | kind::TSS_BUSY);
        } else {
            self.set_kind(kind & !kind::TSS_BUSY);
        }
    }

    /// 32-bit gate (interrupt, trap or call gate with the size bit set).
    pub fn is_gate32(&self) -> bool {
        self.kind() & 0x08 != 0
    }
}
