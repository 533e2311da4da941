//! Segment selector fields: bits 0..2 RPL, bit 2 table indicator, bits 3..16
//! index.

pub const RPL_MASK: u16 = 0x3;
pub const TI: u16 = 0x4;
pub const INDEX_MASK: u16 = 0xfff8;

#[inline]
pub const fn rpl(sel: u16) -> u8 {
    (sel & RPL_MASK) as u8
}

/// Null selectors ignore RPL and the table indicator.
#[inline]
pub const fn is_null(sel: u16) -> bool {
    sel & 0xfffc == 0
}

#[inline]
pub const fn uses_ldt(sel: u16) -> bool {
    sel & TI != 0
}

/// Error code reported for faults that name a selector.
#[inline]
pub const fn error_code(sel: u16) -> u32 {
    (sel & 0xfffc) as u32
}

#[inline]
pub const fn with_rpl(sel: u16, rpl: u8) -> u16 {
    (sel & !RPL_MASK) | (rpl as u16 & RPL_MASK)
}
