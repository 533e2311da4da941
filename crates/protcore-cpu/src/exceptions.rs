//! Architectural exception vectors and the fault values produced by protection
//! checks.

use thiserror::Error;

/// Architecturally defined x86 exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,          // #DE
    Debug = 1,                // #DB
    NonMaskableInterrupt = 2, // NMI
    Breakpoint = 3,           // #BP
    Overflow = 4,             // #OF
    BoundRangeExceeded = 5,   // #BR
    InvalidOpcode = 6,        // #UD
    DeviceNotAvailable = 7,   // #NM
    DoubleFault = 8,          // #DF
    InvalidTss = 10,          // #TS
    SegmentNotPresent = 11,   // #NP
    StackFault = 12,          // #SS
    GeneralProtection = 13,   // #GP
    PageFault = 14,           // #PF
    X87Fpu = 16,              // #MF
    AlignmentCheck = 17,      // #AC
}

impl Exception {
    #[inline]
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
        )
    }

    pub const fn from_vector(vector: u8) -> Option<Self> {
        Some(match vector {
            0 => Exception::DivideError,
            1 => Exception::Debug,
            2 => Exception::NonMaskableInterrupt,
            3 => Exception::Breakpoint,
            4 => Exception::Overflow,
            5 => Exception::BoundRangeExceeded,
            6 => Exception::InvalidOpcode,
            7 => Exception::DeviceNotAvailable,
            8 => Exception::DoubleFault,
            10 => Exception::InvalidTss,
            11 => Exception::SegmentNotPresent,
            12 => Exception::StackFault,
            13 => Exception::GeneralProtection,
            14 => Exception::PageFault,
            16 => Exception::X87Fpu,
            17 => Exception::AlignmentCheck,
            _ => return None,
        })
    }
}

/// A guest-visible fault detected while executing an instruction or delivering
/// an event. It is always handed back to the guest, never to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{exception:?} with error code {error_code:#x}")]
pub struct Fault {
    pub exception: Exception,
    pub error_code: u32,
    /// Linear address for #PF, loaded into CR2 on delivery.
    pub address: Option<u32>,
}

impl Fault {
    pub const fn new(exception: Exception, error_code: u32) -> Self {
        Self {
            exception,
            error_code,
            address: None,
        }
    }

    pub const fn gp(code: u32) -> Self {
        Self::new(Exception::GeneralProtection, code)
    }

    pub const fn gp0() -> Self {
        Self::gp(0)
    }

    pub const fn np(code: u32) -> Self {
        Self::new(Exception::SegmentNotPresent, code)
    }

    pub const fn ss(code: u32) -> Self {
        Self::new(Exception::StackFault, code)
    }

    pub const fn ts(code: u32) -> Self {
        Self::new(Exception::InvalidTss, code)
    }

    pub const fn ud() -> Self {
        Self::new(Exception::InvalidOpcode, 0)
    }

    pub const fn page_fault(address: u32, code: u32) -> Self {
        Self {
            exception: Exception::PageFault,
            error_code: code,
            address: Some(address),
        }
    }

    pub const fn vector(&self) -> u8 {
        self.exception.vector()
    }
}

pub type FaultResult<T> = Result<T, Fault>;

/// Conditions that end the guest rather than being delivered to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuExit {
    /// Failure to deliver an exception (including #DF) that results in a reset.
    #[error("triple fault")]
    TripleFault,
}
