//! x86 protection, interrupt and execution-core machinery.
//!
//! Everything operates on an explicit [`Cpu`] context and a [`CpuBus`] that
//! provides linear memory, port I/O and paging hooks. Guest-visible faults are
//! [`Fault`] values delivered back to the guest; only a triple fault
//! ([`CpuExit`]) or a host invariant violation ([`DispatchError`]) leaves it.

#![forbid(unsafe_code)]

pub mod arch;
pub mod config;
pub mod control;
pub mod cycles;
pub mod descriptor;
pub mod exceptions;
pub mod exec;
pub mod flags;
pub mod interrupts;
pub mod mem;
pub mod regs;
pub mod segments;
pub mod selector;
pub mod stack;
pub mod state;
pub mod system;
pub mod tables;
pub mod transfer;
pub mod tss;

pub use arch::CpuArch;
pub use config::{ConfigError, CoreSetting, CpuConfig, CpuType, CycleSetting};
pub use cycles::CycleGovernor;
pub use descriptor::Descriptor;
pub use exceptions::{CpuExit, Exception, Fault, FaultResult};
pub use exec::{
    CoreExit, CoreKind, CycleBudget, Decoder, DispatchError, Dispatcher, ExecCore, RunOutcome, Vcpu,
};
pub use interrupts::{DispatchState, InterruptController, InterruptFlags};
pub use mem::{CpuBus, FlatTestBus};
pub use regs::{Reg32, RegOperand, SegReg};
pub use state::Cpu;
pub use tables::{DescriptorTable, Gdt};
pub use tss::TaskSwitch;
