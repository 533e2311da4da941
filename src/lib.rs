//! Protected-mode CPU core: descriptor tables, segment and task state,
//! interrupt delivery and the execution-core dispatcher.
//!
//! The work lives in two crates, re-exported here:
//! - [`cpu`]: everything that runs on the guest's behalf;
//! - [`dyncache`]: host memory for the translating cores.

pub use protcore_cpu as cpu;
pub use protcore_dyncache as dyncache;

pub use protcore_cpu::{
    CoreExit, CoreKind, Cpu, CpuBus, CpuConfig, CpuExit, Decoder, Dispatcher, Exception, Fault,
    FlatTestBus, RunOutcome, Vcpu,
};
