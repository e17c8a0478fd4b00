//! Configuration management.
use crate::error::RadmonError;
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Logging cadence in seconds; one record per cycle.
    #[serde(default = "default_log_cycle")]
    pub log_cycle_secs: f64,
    /// CSV output path for logged records.
    #[serde(default = "default_output_path")]
    pub output_path: String,
    pub minimon: Option<MiniMonSettings>,
    pub radpro: Option<RadProSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MiniMonSettings {
    /// hidraw character device; a udev symlink keeps this stable.
    #[serde(default = "default_minimon_device")]
    pub device: String,
    /// Force a record after this many seconds even if values are unchanged.
    #[serde(default = "default_minimon_interval")]
    pub interval_secs: f64,
    /// Positional variable slots: slot 0 = Temperature, slot 1 = Humidity,
    /// slot 2 = CO2. Use "None" to skip a slot.
    #[serde(default = "default_minimon_variables")]
    pub variables: Vec<String>,
    /// Optional per-variable linear transform applied after unit conversion.
    #[serde(default)]
    pub scale: HashMap<String, ValueScale>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ValueScale {
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
}

impl Default for ValueScale {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
        }
    }
}

impl ValueScale {
    pub fn apply(&self, value: f64) -> f64 {
        value * self.factor + self.offset
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RadProSettings {
    /// Serial port path, or "auto" to probe all detected ports.
    #[serde(default = "default_radpro_port")]
    pub port: String,
    /// Push the host clock to the device on connect.
    #[serde(default)]
    pub sync_time: bool,
    /// Key-value store remembering the last-synced datalog timestamp per
    /// device, so history downloads resume incrementally.
    #[serde(default = "default_history_file")]
    pub history_file: String,
}

fn default_log_cycle() -> f64 {
    1.0
}

fn default_output_path() -> String {
    "radmon-log.csv".to_string()
}

fn default_minimon_device() -> String {
    "/dev/minimon".to_string()
}

fn default_minimon_interval() -> f64 {
    60.0
}

fn default_minimon_variables() -> Vec<String> {
    vec!["Temp".into(), "None".into(), "CO2".into()]
}

fn default_factor() -> f64 {
    1.0
}

fn default_radpro_port() -> String {
    "auto".to_string()
}

fn default_history_file() -> String {
    "radmon-radpro-history.conf".to_string()
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> Result<Self, RadmonError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(RadmonError::Config)?;

        s.try_deserialize().map_err(RadmonError::Config)
    }
}
