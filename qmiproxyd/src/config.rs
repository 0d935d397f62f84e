// src/config.rs

//! Runtime settings, read once at startup from `persist.qmiproxyd.*` properties.

use log::warn;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CALL_PACING, DEFAULT_DSP_DEVICE, DEFAULT_HOST_DEVICE, DEFAULT_RESERVED_NUMBER,
    DEFAULT_RESET_THRESHOLD, DEFAULT_STEP_TIMEOUT, DEFAULT_TASK_FILE,
};
use crate::utils::get_property;

const PROP_PREFIX: &str = "persist.qmiproxyd.";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Number the daemon answers on for simulated calls and chat messages.
    pub reserved_number: String,
    pub host_device: PathBuf,
    pub dsp_device: PathBuf,
    pub task_file: PathBuf,
    pub reset_threshold: usize,
    pub step_timeout: Duration,
    pub call_pacing: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reserved_number: DEFAULT_RESERVED_NUMBER.to_string(),
            host_device: PathBuf::from(DEFAULT_HOST_DEVICE),
            dsp_device: PathBuf::from(DEFAULT_DSP_DEVICE),
            task_file: PathBuf::from(DEFAULT_TASK_FILE),
            reset_threshold: DEFAULT_RESET_THRESHOLD,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            call_pacing: DEFAULT_CALL_PACING,
        }
    }
}

impl Settings {
    /// Reads every setting from properties, falling back to the defaults.
    pub fn load() -> Self {
        Self::from_lookup(|key| get_property(&format!("{}{}", PROP_PREFIX, key)).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            reserved_number: get("reserved_number").unwrap_or(defaults.reserved_number),
            host_device: get("host_device").map(PathBuf::from).unwrap_or(defaults.host_device),
            dsp_device: get("dsp_device").map(PathBuf::from).unwrap_or(defaults.dsp_device),
            task_file: get("task_file").map(PathBuf::from).unwrap_or(defaults.task_file),
            reset_threshold: parse_setting(get("reset_threshold"), "reset_threshold")
                .unwrap_or(defaults.reset_threshold),
            step_timeout: parse_setting(get("step_timeout_ms"), "step_timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_timeout),
            call_pacing: parse_setting(get("call_pacing_ms"), "call_pacing_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_pacing),
        }
    }
}

/// Parses a numeric setting, warning about values that do not parse.
fn parse_setting<T: FromStr>(value: Option<String>, key: &str) -> Option<T> {
    let raw = value?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}{}={:?}", PROP_PREFIX, key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn unset_properties_fall_back_to_defaults() {
        let settings = settings_from(&[("reserved_number", "  ")]);
        assert_eq!(settings.reserved_number, DEFAULT_RESERVED_NUMBER);
        assert_eq!(settings.step_timeout, DEFAULT_STEP_TIMEOUT);
    }

    #[test]
    fn properties_override_defaults() {
        let settings = settings_from(&[
            ("reserved_number", "+15550100"),
            ("dsp_device", "/dev/smdcntl0"),
            ("reset_threshold", "5"),
            ("call_pacing_ms", "0"),
        ]);
        assert_eq!(settings.reserved_number, "+15550100");
        assert_eq!(settings.dsp_device, PathBuf::from("/dev/smdcntl0"));
        assert_eq!(settings.reset_threshold, 5);
        assert_eq!(settings.call_pacing, Duration::ZERO);
    }

    #[test]
    fn invalid_numbers_are_ignored() {
        let settings = settings_from(&[("reset_threshold", "lots"), ("step_timeout_ms", "-1")]);
        assert_eq!(settings.reset_threshold, DEFAULT_RESET_THRESHOLD);
        assert_eq!(settings.step_timeout, DEFAULT_STEP_TIMEOUT);
    }
}
