use protcore_dyncache::CacheOptions;
use thiserror::Error;
use tracing::warn;

use crate::arch::CpuArch;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("cputype {cputype} needs the normal or auto core, not {core:?}")]
    PrefetchRequiresNormalCore { cputype: String, core: CoreSetting },
}

/// Which execution core the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(from = "String")]
pub enum CoreSetting {
    Normal,
    Simple,
    Full,
    #[default]
    Auto,
    Dynamic,
    /// Dynamic core without host FPU acceleration; the translator treats it
    /// as `Dynamic`.
    DynamicNoDhFpu,
    /// Recompiler for 8086/286 guests.
    DynamicRec,
}

impl From<String> for CoreSetting {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => CoreSetting::Normal,
            "simple" => CoreSetting::Simple,
            "full" => CoreSetting::Full,
            "auto" => CoreSetting::Auto,
            "dynamic" | "dynamic_x86" => CoreSetting::Dynamic,
            "dynamic_nodhfpu" => CoreSetting::DynamicNoDhFpu,
            "dynamic_rec" => CoreSetting::DynamicRec,
            other => {
                warn!(core = other, "unknown core type, using normal");
                CoreSetting::Normal
            }
        }
    }
}

impl CoreSetting {
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            CoreSetting::Dynamic | CoreSetting::DynamicNoDhFpu | CoreSetting::DynamicRec
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(from = "String")]
pub struct CpuType {
    pub name: String,
    pub arch: CpuArch,
    pub prefetch: bool,
}

impl From<String> for CpuType {
    fn from(value: String) -> Self {
        let name = value.trim().to_ascii_lowercase();
        let (base, prefetch) = match name.strip_suffix("_prefetch") {
            Some(base) => (base, true),
            None => (name.as_str(), false),
        };
        let arch = match base {
            "auto" => Some(CpuArch::Mixed),
            "8086" => Some(CpuArch::I8086),
            "80186" => Some(CpuArch::I80186),
            "286" => Some(CpuArch::I286),
            "386" => Some(CpuArch::I386),
            "486old" => Some(CpuArch::I486Old),
            "486" => Some(CpuArch::I486New),
            "pentium" => Some(CpuArch::Pentium),
            "pentium_mmx" => Some(CpuArch::PentiumMmx),
            "ppro_slow" => Some(CpuArch::PentiumPro),
            _ => None,
        };
        // Prefetch variants only exist up to the 486.
        let prefetch =
            prefetch && arch.is_some_and(|a| a <= CpuArch::I486New && a != CpuArch::Mixed);
        let arch = arch.unwrap_or_else(|| {
            warn!(cputype = %name, "unknown cputype, using auto");
            CpuArch::Mixed
        });
        CpuType { name, arch, prefetch }
    }
}

impl CpuType {
    /// Prefetch queue length in bytes for the prefetch core.
    pub fn prefetch_queue_size(&self) -> usize {
        match self.arch {
            CpuArch::I8086 => 4,
            CpuArch::I80186 | CpuArch::I286 => 6,
            CpuArch::I386 => 16,
            _ => 32,
        }
    }
}

pub const DEFAULT_CYCLES: u32 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(from = "String")]
pub enum CycleSetting {
    #[default]
    Auto,
    /// Run as fast as the host allows, scaled to `percent`.
    Max { percent: u32 },
    Fixed(u32),
}

impl From<String> for CycleSetting {
    fn from(value: String) -> Self {
        let text = value.trim().to_ascii_lowercase();
        let mut words = text.split_whitespace();
        let setting = match (words.next(), words.next()) {
            (Some("auto"), _) => Some(CycleSetting::Auto),
            (Some("max"), None) => Some(CycleSetting::Max { percent: 100 }),
            (Some("max"), Some(pct)) => pct
                .trim_end_matches('%')
                .parse()
                .ok()
                .map(|percent| CycleSetting::Max { percent }),
            (Some("fixed"), Some(n)) | (Some(n), None) => n.parse().ok().map(CycleSetting::Fixed),
            _ => None,
        };
        match setting {
            Some(CycleSetting::Fixed(0)) => CycleSetting::Fixed(DEFAULT_CYCLES),
            Some(CycleSetting::Max { percent: 0 }) => CycleSetting::Max { percent: 100 },
            Some(setting) => setting,
            None => {
                warn!(cycles = %text, "unparsable cycles setting, using auto");
                CycleSetting::Auto
            }
        }
    }
}

pub const DEFAULT_CACHE_BLOCK_SIZE: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub core: CoreSetting,
    pub cputype: CpuType,
    pub cycles: CycleSetting,
    pub cycleup: u32,
    pub cycledown: u32,
    pub double_fault: bool,
    pub reset_on_triple_fault: bool,
    pub always_report_double_fault: bool,
    pub realbig16: bool,
    pub segment_limits: bool,
    pub dynamic_core_cache_block_size: u32,
    pub code_cache: CacheOptions,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            core: CoreSetting::Auto,
            cputype: CpuType::from("auto".to_owned()),
            cycles: CycleSetting::Auto,
            cycleup: 500,
            cycledown: 20,
            double_fault: true,
            reset_on_triple_fault: true,
            always_report_double_fault: false,
            realbig16: false,
            segment_limits: true,
            dynamic_core_cache_block_size: DEFAULT_CACHE_BLOCK_SIZE,
            code_cache: CacheOptions::default(),
        }
    }
}

impl CpuConfig {
    pub fn parse_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: CpuConfig = serde_json::from_str(json)?;
        config.normalize()?;
        Ok(config)
    }

    /// Apply range defaults and cross-key rules.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        if !(1..=65536).contains(&self.dynamic_core_cache_block_size) {
            warn!(
                value = self.dynamic_core_cache_block_size,
                "dynamic core cache block size out of range, using {DEFAULT_CACHE_BLOCK_SIZE}"
            );
            self.dynamic_core_cache_block_size = DEFAULT_CACHE_BLOCK_SIZE;
        }
        if self.cputype.prefetch && !matches!(self.core, CoreSetting::Normal | CoreSetting::Auto) {
            return Err(ConfigError::PrefetchRequiresNormalCore {
                cputype: self.cputype.name.clone(),
                core: self.core,
            });
        }
        Ok(())
    }
}
