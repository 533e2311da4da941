use crate::flags::{FLAG_AC, FLAG_ID};

/// Emulated CPU generation. Ordering follows the numeric value so "at least a
/// 486" style checks are plain comparisons; `Mixed` passes all of them.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CpuArch {
    I8086 = 0x05,
    I80186 = 0x15,
    I286 = 0x25,
    I386 = 0x35,
    I486Old = 0x40,
    I486New = 0x45,
    Pentium = 0x50,
    PentiumMmx = 0x55,
    PentiumPro = 0x60,
    #[default]
    Mixed = 0xff,
}

impl CpuArch {
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Extra EFLAGS bits software may toggle on this generation.
    pub fn ext_flags_toggle(self) -> u32 {
        if self >= CpuArch::I486New {
            FLAG_ID | FLAG_AC
        } else if self >= CpuArch::I486Old {
            FLAG_AC
        } else {
            0
        }
    }

    pub fn is_16bit_only(self) -> bool {
        self <= CpuArch::I286
    }
}
