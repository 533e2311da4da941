//! Instructions granted per scheduling quantum.
//!
//! `fixed` grants a constant count. `max` rescales the count from how much of
//! the scheduled host time the guest actually used. `auto` behaves like
//! `fixed` in real mode and turns into `max` the first time the guest enters
//! protected mode.

use tracing::{debug, info};

use crate::config::{CpuConfig, CycleSetting, DEFAULT_CYCLES};

/// Floor for the adjusted count.
pub const CYCLES_LOWER_LIMIT: u32 = 100;

/// Usage percentage bounds in `max` mode.
const MAX_PERCENT: u32 = 105;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleGovernor {
    max: u32,
    percent: u32,
    auto_adjust: bool,
    /// `auto` setting still waiting for protected mode.
    auto_detect: bool,
    up: u32,
    down: u32,
}

impl CycleGovernor {
    pub fn new(config: &CpuConfig) -> Self {
        let mut governor = Self {
            max: DEFAULT_CYCLES,
            percent: 100,
            auto_adjust: false,
            auto_detect: false,
            up: config.cycleup,
            down: config.cycledown,
        };
        match config.cycles {
            CycleSetting::Auto => governor.auto_detect = true,
            CycleSetting::Max { percent } => {
                governor.auto_adjust = true;
                governor.percent = percent.clamp(1, MAX_PERCENT);
            }
            CycleSetting::Fixed(n) => governor.max = n,
        }
        governor
    }

    /// Instructions for the next quantum.
    pub fn quantum(&self) -> u32 {
        self.max
    }

    pub fn percent(&self) -> u32 {
        self.percent
    }

    pub fn is_auto_adjusting(&self) -> bool {
        self.auto_adjust
    }

    /// The guest set CR0.PE.
    pub fn protected_mode_entered(&mut self) {
        if self.auto_detect && !self.auto_adjust {
            info!(cycles = self.max, "protected mode entered, switching to max cycles");
            self.auto_adjust = true;
        }
    }

    /// Rescale from host timing: `scheduled` ticks were planned for the guest
    /// and `done` ticks elapsed while running it. The target is 90% of the
    /// configured usage.
    pub fn rebalance(&mut self, scheduled: u32, done: u32) {
        if !self.auto_adjust {
            return;
        }
        let done = i64::from(done.max(1));
        let scheduled = i64::from(scheduled);
        let mut ratio = scheduled * i64::from(self.percent * 90 * 1024 / 100 / 100) / done;
        if scheduled >= 250 && done < 10 && ratio > 20480 {
            ratio = 20480;
        }
        let max = i64::from(self.max);
        let scaled = (1 + (max >> 1) + max * ratio / 2048)
            .clamp(i64::from(CYCLES_LOWER_LIMIT), i64::from(u32::MAX));
        // Below 1% is a dropout. Below 12% after a long gap is host load.
        if ratio > 10 && (ratio > 120 || done < 700) {
            self.max = scaled as u32;
            debug!(cycles = self.max, ratio, "cycles rebalanced");
        }
    }

    /// Host overran a quantum badly: cut the count to a third.
    pub fn throttle(&mut self) {
        if self.auto_adjust {
            self.max = (self.max / 3).max(CYCLES_LOWER_LIMIT);
        }
    }

    /// `cycleup`: below 100 it is a percentage, otherwise an absolute step.
    /// In `max` mode the usage percentage moves by 5 instead.
    pub fn increase(&mut self) {
        if self.auto_adjust {
            self.percent = (self.percent + 5).min(MAX_PERCENT);
            info!(percent = self.percent, "cpu speed: max percent");
            return;
        }
        let old = self.max;
        self.max = if self.up < 100 {
            (u64::from(self.max) * u64::from(100 + self.up) / 100).min(u64::from(u32::MAX)) as u32
        } else {
            self.max.saturating_add(self.up)
        };
        if self.max == old {
            self.max = self.max.saturating_add(1);
        }
        info!(cycles = self.max, "cpu speed: cycles");
    }

    /// `cycledown`, the inverse of [`Self::increase`]. Never drops below one.
    pub fn decrease(&mut self) {
        if self.auto_adjust {
            self.percent = self.percent.saturating_sub(5).max(1);
            info!(percent = self.percent, "cpu speed: max percent");
            return;
        }
        self.max = if self.down < 100 {
            (u64::from(self.max) * 100 / u64::from(100 + self.down)) as u32
        } else {
            self.max.saturating_sub(self.down)
        }
        .max(1);
        info!(cycles = self.max, "cpu speed: cycles");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(json: &str) -> CycleGovernor {
        CycleGovernor::new(&CpuConfig::parse_str(json).unwrap())
    }

    #[test]
    fn fixed_count_is_the_quantum() {
        let g = governor(r#"{"cycles": "fixed 8000"}"#);
        assert_eq!(g.quantum(), 8000);
        assert!(!g.is_auto_adjusting());
    }

    #[test]
    fn small_steps_are_percentages_large_steps_are_absolute() {
        let mut g = governor(r#"{"cycles": "10000", "cycleup": 10, "cycledown": 25}"#);
        g.increase();
        assert_eq!(g.quantum(), 11000);
        g.decrease();
        assert_eq!(g.quantum(), 8800);

        let mut g = governor(r#"{"cycles": "10000", "cycleup": 500, "cycledown": 200}"#);
        g.increase();
        assert_eq!(g.quantum(), 10500);
        g.decrease();
        assert_eq!(g.quantum(), 10300);
    }

    #[test]
    fn increase_always_moves() {
        let mut g = governor(r#"{"cycles": "1", "cycleup": 1}"#);
        g.increase();
        assert_eq!(g.quantum(), 2);
    }

    #[test]
    fn auto_starts_fixed_and_adjusts_after_protected_mode() {
        let mut g = governor(r#"{"cycles": "auto"}"#);
        assert_eq!(g.quantum(), DEFAULT_CYCLES);
        g.rebalance(1000, 100);
        assert_eq!(g.quantum(), DEFAULT_CYCLES);

        g.protected_mode_entered();
        assert!(g.is_auto_adjusting());
        // Guest used a tenth of its time: grow.
        g.rebalance(1000, 100);
        assert!(g.quantum() > DEFAULT_CYCLES);
    }

    #[test]
    fn max_mode_steps_the_usage_percentage() {
        let mut g = governor(r#"{"cycles": "max 100%"}"#);
        g.increase();
        g.increase();
        assert_eq!(g.percent(), MAX_PERCENT);
        assert_eq!(g.quantum(), DEFAULT_CYCLES);
        g.decrease();
        assert_eq!(g.percent(), 100);
    }

    #[test]
    fn overloaded_host_shrinks_to_the_floor() {
        let mut g = governor(r#"{"cycles": "max"}"#);
        for _ in 0..10 {
            g.throttle();
        }
        assert_eq!(g.quantum(), CYCLES_LOWER_LIMIT);
        g.rebalance(250, 1000);
        assert!(g.quantum() >= CYCLES_LOWER_LIMIT);
    }
}
