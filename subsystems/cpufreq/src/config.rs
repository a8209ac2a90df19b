//! # Core Configuration
//!
//! Build-time choices of the frequency scaling core.

/// Configuration of a [`CpuFreq`](crate::CpuFreq) instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFreqConfig {
    /// Governor given to new policies that cannot inherit one
    pub default_governor: &'static str,
    /// Governor substituted when the hardware is too slow for the chosen one
    pub fallback_governor: Option<&'static str>,
    /// Enables uniprocessor loop recalibration, starting from this value
    pub loops_per_jiffy: Option<u64>,
}

impl CpuFreqConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            default_governor: "performance",
            fallback_governor: Some("performance"),
            loops_per_jiffy: None,
        }
    }

    /// Set the default governor
    pub const fn with_default_governor(mut self, name: &'static str) -> Self {
        self.default_governor = name;
        self
    }

    /// Set the latency fallback governor
    pub const fn with_fallback_governor(mut self, name: Option<&'static str>) -> Self {
        self.fallback_governor = name;
        self
    }

    /// Enable loop recalibration
    pub const fn with_loops_per_jiffy(mut self, loops: u64) -> Self {
        self.loops_per_jiffy = Some(loops);
        self
    }
}

impl Default for CpuFreqConfig {
    fn default() -> Self {
        Self::new()
    }
}
