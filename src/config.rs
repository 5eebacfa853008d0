//=====================================================
// File: config.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript runtime configuration
// Objective: Engine options with builder methods and marine.toml loading
//=====================================================

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::vm::metrics::{TelemetryCollector, TelemetryHook};

pub const DEFAULT_STACK_CAPACITY: usize = 16_384;

#[derive(Clone)]
pub struct RuntimeOptions {
    pub stack_capacity: usize,
    pub trace: bool,
    pub telemetry_hook: Option<TelemetryHook>,
    pub telemetry_collector: Option<TelemetryCollector>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            trace: false,
            telemetry_hook: None,
            telemetry_collector: None,
        }
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("stack_capacity", &self.stack_capacity)
            .field("trace", &self.trace)
            .field("telemetry_hook", &self.telemetry_hook.is_some())
            .finish()
    }
}

impl RuntimeOptions {
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_stack_capacity(mut self, capacity: usize) -> Self {
        self.stack_capacity = capacity;
        self
    }

    /// Register a telemetry hook invoked on engine state transitions.
    pub fn with_telemetry_hook(mut self, hook: TelemetryHook) -> Self {
        self.telemetry_hook = Some(hook);
        self
    }

    /// Attach a TelemetryCollector and wire its hook automatically.
    pub fn with_telemetry_collector(mut self, collector: TelemetryCollector) -> Self {
        self.telemetry_hook = Some(collector.hook());
        self.telemetry_collector = Some(collector);
        self
    }

    /// Parses the `[runtime]` table of a marine.toml document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source)?;
        let runtime = file.runtime.unwrap_or_default();
        let mut options = Self::default();
        if let Some(capacity) = runtime.stack_capacity {
            if capacity == 0 {
                return Err(ConfigError::ZeroStackCapacity);
            }
            options.stack_capacity = capacity;
        }
        if let Some(trace) = runtime.trace {
            options.trace = trace;
        }
        Ok(options)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    runtime: Option<RuntimeSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSection {
    stack_capacity: Option<usize>,
    trace: Option<bool>,
}

/// Interprets `MARINE_TRACE`-style switches.
pub fn flag_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_section_missing() {
        let options = RuntimeOptions::from_toml_str("").expect("empty config");
        assert_eq!(options.stack_capacity, DEFAULT_STACK_CAPACITY);
        assert!(!options.trace);
    }

    #[test]
    fn runtime_section_overrides_defaults() {
        let options = RuntimeOptions::from_toml_str("[runtime]\nstack_capacity = 512\ntrace = true\n")
            .expect("config");
        assert_eq!(options.stack_capacity, 512);
        assert!(options.trace);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let error = RuntimeOptions::from_toml_str("[runtime]\nstack_capacity = 0\n")
            .expect_err("zero capacity");
        assert!(matches!(error, ConfigError::ZeroStackCapacity));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RuntimeOptions::from_toml_str("[runtime]\nturbo = true\n").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[runtime]\nstack_capacity = 64").expect("write config");
        let options = RuntimeOptions::load(file.path()).expect("load config");
        assert_eq!(options.stack_capacity, 64);
    }

    #[test]
    fn trace_flag_values() {
        assert!(flag_enabled("ON"));
        assert!(flag_enabled(" 1 "));
        assert!(!flag_enabled("off"));
    }
}

//=====================================================
// End of file
//=====================================================
