//! Configuration for the regwatch binary.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use regwatch_core::{
    ConnectionConfig, CoordinatorSettings, DEFAULT_INVERSION_FLAG_ADDRESS, DataType,
    RegisterDescriptor,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegwatchConfig {
    /// The polled device.
    pub device: DeviceConfig,

    /// Register catalog.
    pub registers: Vec<RegisterDescriptor>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device connection and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in log lines).
    pub name: String,

    /// Connection settings.
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247).
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Time between poll cycles in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Delay before the verification poll that follows a write, in milliseconds.
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,

    /// Connect/read/write timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Register whose bit 0 inverts invertible bitfields.
    #[serde(default = "default_inversion_flag_address")]
    pub inversion_flag_address: u16,
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    3
}

fn default_verify_delay_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_inversion_flag_address() -> u16 {
    DEFAULT_INVERSION_FLAG_ADDRESS
}

impl DeviceConfig {
    /// Coordinator settings derived from this device section.
    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            verify_delay: Duration::from_millis(self.verify_delay_ms),
            io_timeout: Duration::from_millis(self.timeout_ms),
            inversion_flag_address: self.inversion_flag_address,
        }
    }
}

impl RegwatchConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RegwatchConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a register by name.
    pub fn register(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|register| register.name == name)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let device = &self.device;

        if device.name.is_empty() {
            return Err(ConfigError::Validation(
                "Device name cannot be empty".to_string(),
            ));
        }

        if !(1..=247).contains(&device.unit_id) {
            return Err(ConfigError::Validation(format!(
                "Device '{}': unit_id must be 1-247",
                device.name
            )));
        }

        if device.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "Device '{}': poll_interval_secs must be greater than 0",
                device.name
            )));
        }

        if device.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "Device '{}': timeout_ms must be greater than 0",
                device.name
            )));
        }

        if let ConnectionConfig::Rtu { parity, .. } = &device.connection {
            if !matches!(parity.to_lowercase().as_str(), "none" | "even" | "odd") {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': parity must be none, even or odd, got '{}'",
                    device.name, parity
                )));
            }
        }

        if self.registers.is_empty() {
            return Err(ConfigError::Validation(
                "At least one register must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for register in &self.registers {
            if register.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Register at {:#06x}: name cannot be empty",
                    register.address
                )));
            }
            if !names.insert(register.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate register name '{}'",
                    register.name
                )));
            }
            validate_register(register)?;
        }

        Ok(())
    }
}

fn validate_register(register: &RegisterDescriptor) -> Result<(), ConfigError> {
    let invalid = |reason: &str| {
        ConfigError::Validation(format!("Register '{}': {}", register.name, reason))
    };

    if register.scale == 0.0 || !register.scale.is_finite() {
        return Err(invalid("scale must be a non-zero number"));
    }

    if register.data_type == DataType::Ascii && register.word_count == 0 {
        return Err(invalid("word_count must be at least 1"));
    }

    if u32::from(register.address) + u32::from(register.words()) > 0x1_0000 {
        return Err(invalid("register range exceeds the address space"));
    }

    if let Some(bit) = register.bits.iter().find(|def| def.bit >= 16) {
        return Err(invalid(&format!("bit {} is out of range 0-15", bit.bit)));
    }

    if let (Some(min), Some(max)) = (register.min, register.max) {
        if min > max {
            return Err(invalid("min must not exceed max"));
        }
    }

    Ok(())
}
