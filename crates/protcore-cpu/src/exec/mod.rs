//! Execution cores and the dispatcher that picks between them.
//!
//! The active core is plain data ([`Decoder`]), so switching cores is an
//! assignment. A core runs until the [`CycleBudget`] is spent or it needs the
//! dispatcher, and reports why through [`CoreExit`].

use protcore_dyncache::DynCorePolicy;
use thiserror::Error;
use tracing::{debug, info};

use crate::arch::CpuArch;
use crate::config::CoreSetting;
use crate::cycles::CycleGovernor;
use crate::interrupts::InterruptController;
use crate::mem::CpuBus;
use crate::regs::SegReg;
use crate::state::Cpu;
use crate::{CpuConfig, CpuExit};

mod decode;
mod dynrec;
mod interp;
mod prefetch;

pub use decode::{decode, Decoded, DirectFetch, Fetch, MemRef, Op, Port, Rm, MAX_INSTRUCTION_LEN};
pub use dynrec::DynCore;
pub use interp::{Fidelity, Interpreter};
pub use prefetch::PrefetchQueue;

/// Code cache size for the translating cores.
pub const DEFAULT_CODE_CACHE_SIZE: usize = 1 << 20;

/// DR6.BS, single-step trap.
const DR6_BS: u32 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreKind {
    Normal,
    Simple,
    Full,
    Prefetch,
    /// Translating core for 386+ guests.
    DynX86,
    /// Translating core for 8086/286 guests.
    DynRec,
}

impl CoreKind {
    pub fn is_dynamic(self) -> bool {
        matches!(self, CoreKind::DynX86 | CoreKind::DynRec)
    }
}

/// The selected core, or the halt pseudo-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decoder {
    Core { kind: CoreKind, trap: bool },
    Halt,
}

impl Decoder {
    pub const fn normal() -> Self {
        Decoder::Core {
            kind: CoreKind::Normal,
            trap: false,
        }
    }

    /// Persisted index of the decoder.
    pub fn index(self) -> u32 {
        match self {
            Decoder::Halt => 200,
            Decoder::Core { kind, trap: false } => match kind {
                CoreKind::Normal => 0,
                CoreKind::Prefetch => 1,
                CoreKind::Simple => 2,
                CoreKind::Full => 3,
                CoreKind::DynX86 => 4,
                CoreKind::DynRec => 5,
            },
            Decoder::Core { kind, trap: true } => match kind {
                CoreKind::Normal => 100,
                CoreKind::DynX86 => 101,
                CoreKind::Prefetch => 102,
                CoreKind::Simple => 103,
                CoreKind::Full => 104,
                CoreKind::DynRec => 105,
            },
        }
    }

    pub fn from_index(index: u32) -> Result<Self, DispatchError> {
        let (kind, trap) = match index {
            200 => return Ok(Decoder::Halt),
            0 => (CoreKind::Normal, false),
            1 => (CoreKind::Prefetch, false),
            2 => (CoreKind::Simple, false),
            3 => (CoreKind::Full, false),
            4 => (CoreKind::DynX86, false),
            5 => (CoreKind::DynRec, false),
            100 => (CoreKind::Normal, true),
            101 => (CoreKind::DynX86, true),
            102 => (CoreKind::Prefetch, true),
            103 => (CoreKind::Simple, true),
            104 => (CoreKind::Full, true),
            105 => (CoreKind::DynRec, true),
            other => return Err(DispatchError::UnknownDecoder(other)),
        };
        Ok(Decoder::Core { kind, trap })
    }

    pub fn kind(self) -> Option<CoreKind> {
        match self {
            Decoder::Core { kind, .. } => Some(kind),
            Decoder::Halt => None,
        }
    }

    pub fn is_trap(self) -> bool {
        matches!(self, Decoder::Core { trap: true, .. })
    }

    /// Same core with the trap variant toggled. Halt is unchanged.
    pub fn with_trap(self, trap: bool) -> Self {
        match self {
            Decoder::Core { kind, .. } => Decoder::Core { kind, trap },
            Decoder::Halt => Decoder::Halt,
        }
    }
}

/// Why a core returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    /// The budget ran out, or an interrupt may now be deliverable.
    OutOfCycles,
    /// A guest exception was raised and its handler entered.
    ExceptionDelivered,
    /// Continue on another core.
    SwitchCore(Decoder),
    /// HLT executed.
    Halted,
    /// Triple fault; the guest cannot continue.
    Shutdown,
}

/// Host-side invariant violations. These end the emulation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("HLT while already halted")]
    AlreadyHalted,
    #[error("halt decoder active without a halt snapshot")]
    NotHalted,
    #[error("unknown decoder index {0}")]
    UnknownDecoder(u32),
    #[error("NMI delivered while an NMI handler is still running")]
    NmiActive,
}

/// Instructions left in the current scheduling quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBudget {
    remaining: u32,
}

impl CycleBudget {
    pub fn new(cycles: u32) -> Self {
        Self { remaining: cycles }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn consume(&mut self, cycles: u32) {
        self.remaining = self.remaining.saturating_sub(cycles);
    }

    /// Give up the rest of the quantum.
    pub fn burn(&mut self) {
        self.remaining = 0;
    }
}

/// An execution core.
///
/// The dispatcher drives its built-in cores through this trait; it is public
/// so a host can drive one core directly.
pub trait ExecCore<B: CpuBus> {
    fn run(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
    ) -> Result<CoreExit, DispatchError>;

    /// Drop cached state that assumes the current code or core.
    fn flush(&mut self) {}
}

/// Owns every core and the active [`Decoder`].
#[derive(Debug)]
pub struct Dispatcher {
    current: Decoder,
    normal: Interpreter,
    simple: Interpreter,
    full: Interpreter,
    prefetch: Interpreter,
    dyn_core: Option<DynCore>,
    /// Core the `auto` setting moves to once the guest enters protected mode.
    auto_target: Option<CoreKind>,
}

fn dynamic_kind(setting: CoreSetting, arch: CpuArch) -> CoreKind {
    match setting {
        CoreSetting::DynamicRec if arch.is_16bit_only() => CoreKind::DynRec,
        CoreSetting::DynamicRec => CoreKind::DynX86,
        _ if arch >= CpuArch::I386 => CoreKind::DynX86,
        _ => CoreKind::DynRec,
    }
}

impl Dispatcher {
    pub fn new(config: &CpuConfig) -> Self {
        let arch = config.cputype.arch;
        let wants_dynamic = config.core.is_dynamic() || config.core == CoreSetting::Auto;
        let mut dyn_core = if wants_dynamic {
            DynCore::new(
                DEFAULT_CODE_CACHE_SIZE,
                config.dynamic_core_cache_block_size,
                &config.code_cache,
            )
        } else {
            None
        };
        let dyn_target = dynamic_kind(config.core, arch);
        if let Some(core) = dyn_core.as_mut() {
            core.set_kind(dyn_target);
        }

        let interpreted = if config.cputype.prefetch {
            CoreKind::Prefetch
        } else {
            CoreKind::Normal
        };
        let kind = match config.core {
            CoreSetting::Normal | CoreSetting::Auto => interpreted,
            CoreSetting::Simple => CoreKind::Simple,
            CoreSetting::Full => CoreKind::Full,
            CoreSetting::Dynamic | CoreSetting::DynamicNoDhFpu | CoreSetting::DynamicRec => {
                if dyn_core.is_some() {
                    dyn_target
                } else {
                    info!(
                        requested = ?config.core,
                        "translating core unavailable, using the normal core"
                    );
                    CoreKind::Normal
                }
            }
        };
        let auto_target = (config.core == CoreSetting::Auto
            && !config.cputype.prefetch
            && dyn_core.is_some())
        .then_some(dyn_target);

        debug!(core = ?kind, "execution core selected");
        Self {
            current: Decoder::Core { kind, trap: false },
            normal: Interpreter::new(Fidelity::Normal),
            simple: Interpreter::new(Fidelity::Simple),
            full: Interpreter::new(Fidelity::Full),
            prefetch: Interpreter::with_prefetch(config.cputype.prefetch_queue_size()),
            dyn_core,
            auto_target,
        }
    }

    pub fn current(&self) -> Decoder {
        self.current
    }

    /// Code cache policy, if a translating core is available.
    pub fn policy(&self) -> Option<DynCorePolicy> {
        self.dyn_core.as_ref().map(DynCore::policy)
    }

    pub fn cached_blocks(&self) -> usize {
        self.dyn_core.as_ref().map_or(0, DynCore::cached_blocks)
    }

    pub fn interpreter(&self, fidelity: Fidelity) -> &Interpreter {
        match fidelity {
            Fidelity::Normal => &self.normal,
            Fidelity::Simple => &self.simple,
            Fidelity::Full => &self.full,
            Fidelity::Prefetch => &self.prefetch,
        }
    }

    /// Drop translated code and prefetched bytes.
    pub fn flush(&mut self) {
        if let Some(core) = self.dyn_core.as_mut() {
            core.clear();
        }
        self.prefetch.invalidate();
    }

    /// Activate `decoder`. Only legal between core runs.
    ///
    /// Translating kinds fall back to the normal core when no code cache is
    /// available. Moving to a different kind flushes cached code.
    pub fn set_decoder(&mut self, decoder: Decoder) {
        let decoder = match decoder {
            Decoder::Core { kind, trap } if kind.is_dynamic() && self.dyn_core.is_none() => {
                info!(requested = ?kind, "translating core unavailable, using the normal core");
                Decoder::Core {
                    kind: CoreKind::Normal,
                    trap,
                }
            }
            other => other,
        };
        if let (Some(old), Some(new)) = (self.current.kind(), decoder.kind()) {
            if old != new {
                debug!(from = ?old, to = ?new, "switching execution core");
                self.flush();
            }
        }
        if let (Decoder::Core { kind, .. }, Some(core)) = (decoder, self.dyn_core.as_mut()) {
            if kind.is_dynamic() {
                core.set_kind(kind);
            }
        }
        self.current = decoder;
    }

    fn interpreter_mut(&mut self, kind: CoreKind) -> &mut Interpreter {
        match kind {
            CoreKind::Simple => &mut self.simple,
            CoreKind::Full => &mut self.full,
            CoreKind::Prefetch => &mut self.prefetch,
            CoreKind::Normal | CoreKind::DynX86 | CoreKind::DynRec => &mut self.normal,
        }
    }

    /// Run the active core once.
    pub fn run<B: CpuBus>(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        budget: &mut CycleBudget,
    ) -> Result<CoreExit, DispatchError> {
        if cpu.entered_pmode && self.current != Decoder::Halt {
            if let Some(kind) = self.auto_target.take() {
                info!(core = ?kind, "protected mode entered, switching to the translating core");
                let trap = self.current.is_trap();
                self.set_decoder(Decoder::Core { kind, trap });
            }
        }

        let exit = match self.current {
            Decoder::Halt => return self.run_halted(cpu, budget),
            Decoder::Core { kind, trap: true } => {
                budget.consume(1);
                self.run_trap(cpu, bus, kind)?
            }
            Decoder::Core { kind, trap: false } => {
                if kind.is_dynamic() {
                    match self.dyn_core.as_mut() {
                        Some(core) => core.run(cpu, bus, budget)?,
                        None => self.normal.run(cpu, bus, budget)?,
                    }
                } else {
                    self.interpreter_mut(kind).run(cpu, bus, budget)?
                }
            }
        };

        if self.dyn_core.as_ref().is_some_and(DynCore::failed) {
            info!("translating core disabled after a code cache failure");
            self.dyn_core = None;
            self.auto_target = None;
        }

        match exit {
            CoreExit::Halted => {
                let resume = self.current.with_trap(false);
                cpu.hlt(cpu.regs.eip, resume)?;
                self.current = Decoder::Halt;
                budget.burn();
                Ok(CoreExit::Halted)
            }
            CoreExit::SwitchCore(decoder) => {
                self.set_decoder(decoder);
                Ok(exit)
            }
            other => Ok(other),
        }
    }

    fn run_halted(
        &mut self,
        cpu: &mut Cpu,
        budget: &mut CycleBudget,
    ) -> Result<CoreExit, DispatchError> {
        let snapshot = cpu.hlt.ok_or(DispatchError::NotHalted)?;
        if cpu.selector(SegReg::Cs) != snapshot.cs || cpu.regs.eip != snapshot.eip {
            cpu.hlt = None;
            self.current = snapshot.resume;
            return Ok(CoreExit::SwitchCore(snapshot.resume));
        }
        budget.burn();
        Ok(CoreExit::Halted)
    }

    /// Run one instruction, then raise the single-step trap.
    fn run_trap<B: CpuBus>(
        &mut self,
        cpu: &mut Cpu,
        bus: &mut B,
        kind: CoreKind,
    ) -> Result<CoreExit, DispatchError> {
        cpu.trap_skip = false;
        let mut one = CycleBudget::new(1);
        let exit = self.interpreter_mut(kind).execute(cpu, bus, &mut one, true)?;
        self.current = Decoder::Core { kind, trap: false };
        match exit {
            CoreExit::OutOfCycles if !cpu.trap_skip => match cpu.debug_exception(bus, DR6_BS) {
                Ok(()) => Ok(CoreExit::ExceptionDelivered),
                Err(CpuExit::TripleFault) => Ok(CoreExit::Shutdown),
            },
            CoreExit::Halted => Ok(CoreExit::Halted),
            other => Ok(other),
        }
    }

    /// Back to the configured core after a CPU reset.
    pub fn reset(&mut self, config: &CpuConfig) {
        *self = Self::new(config);
    }
}

/// Result of one host scheduling quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    QuantumElapsed,
    Halted,
    /// Triple fault with `reset_on_triple_fault` off.
    Shutdown,
    /// Triple fault reset the CPU.
    Reset,
}

/// A CPU, its bus and its cores, driven one quantum at a time.
#[derive(Debug)]
pub struct Vcpu<B: CpuBus> {
    pub cpu: Cpu,
    pub bus: B,
    pub dispatcher: Dispatcher,
    pub cycles: CycleGovernor,
    config: CpuConfig,
}

impl<B: CpuBus> Vcpu<B> {
    pub fn new(config: CpuConfig, bus: B) -> Self {
        Self {
            cpu: Cpu::new(&config),
            bus,
            dispatcher: Dispatcher::new(&config),
            cycles: CycleGovernor::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Run one quantum sized by the cycle settings.
    pub fn run<C: InterruptController>(
        &mut self,
        ctrl: &mut C,
    ) -> Result<RunOutcome, DispatchError> {
        let outcome = self.run_quantum(ctrl, self.cycles.quantum())?;
        if self.cpu.entered_pmode {
            self.cycles.protected_mode_entered();
        }
        Ok(outcome)
    }

    /// Run up to `cycles` instructions, delivering NMIs and external
    /// interrupts between core runs.
    pub fn run_quantum<C: InterruptController>(
        &mut self,
        ctrl: &mut C,
        cycles: u32,
    ) -> Result<RunOutcome, DispatchError> {
        let mut budget = CycleBudget::new(cycles);
        loop {
            if self.cpu.events.shutdown {
                return Ok(RunOutcome::Shutdown);
            }
            let delivered = match self.cpu.check_nmi(&mut self.bus) {
                Ok(true) => Ok(true),
                Ok(false) => self.cpu.poll_and_deliver_external_interrupt(&mut self.bus, ctrl),
                Err(exit) => Err(exit),
            };
            if delivered.is_err() {
                return Ok(self.triple_fault());
            }
            // An interrupt wakes a halted CPU even with no budget left.
            if budget.is_exhausted() && !(delivered == Ok(true) && self.cpu.hlt.is_some()) {
                return Ok(if self.cpu.hlt.is_some() {
                    RunOutcome::Halted
                } else {
                    RunOutcome::QuantumElapsed
                });
            }
            match self.dispatcher.run(&mut self.cpu, &mut self.bus, &mut budget)? {
                CoreExit::Shutdown => return Ok(self.triple_fault()),
                CoreExit::Halted if budget.is_exhausted() => return Ok(RunOutcome::Halted),
                _ => {}
            }
        }
    }

    fn triple_fault(&mut self) -> RunOutcome {
        if self.cpu.options.reset_on_triple_fault {
            info!("triple fault, resetting the CPU");
            self.cpu.reset(&mut self.bus);
            self.dispatcher.reset(&self.config);
            RunOutcome::Reset
        } else {
            self.cpu.events.shutdown = true;
            RunOutcome::Shutdown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_indices_match_persisted_values() {
        assert_eq!(Decoder::normal().index(), 0);
        assert_eq!(Decoder::normal().with_trap(true).index(), 100);
        assert_eq!(
            Decoder::Core {
                kind: CoreKind::DynX86,
                trap: true
            }
            .index(),
            101
        );
        assert_eq!(Decoder::Halt.index(), 200);
        for index in [0, 1, 2, 3, 4, 5, 100, 101, 102, 103, 104, 105, 200] {
            assert_eq!(Decoder::from_index(index).unwrap().index(), index);
        }
        assert_eq!(Decoder::from_index(6), Err(DispatchError::UnknownDecoder(6)));
    }

    #[test]
    fn budget_saturates() {
        let mut budget = CycleBudget::new(2);
        budget.consume(5);
        assert!(budget.is_exhausted());
        let mut budget = CycleBudget::new(9);
        budget.burn();
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn dynamic_choice_follows_the_guest_generation() {
        assert_eq!(dynamic_kind(CoreSetting::Dynamic, CpuArch::I386), CoreKind::DynX86);
        assert_eq!(dynamic_kind(CoreSetting::Dynamic, CpuArch::I286), CoreKind::DynRec);
        assert_eq!(dynamic_kind(CoreSetting::DynamicRec, CpuArch::I8086), CoreKind::DynRec);
        assert_eq!(dynamic_kind(CoreSetting::DynamicRec, CpuArch::Pentium), CoreKind::DynX86);
        assert_eq!(dynamic_kind(CoreSetting::Auto, CpuArch::Mixed), CoreKind::DynX86);
    }
}
