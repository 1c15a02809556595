//! regwatch: poll selected Modbus holding registers and decode them.
//!
//! - [`config`] - JSON5 configuration (device section and register catalog)
//! - [`args`] - Command-line arguments
//! - [`logging`] - Tracing setup
//! - [`runner`] - Coordinator lifecycle, CLI writes and value logging

pub mod args;
pub mod config;
pub mod logging;
pub mod runner;

pub use args::Args;
pub use config::{ConfigError, DeviceConfig, RegwatchConfig};
pub use logging::{LogFormat, LoggingConfig, init_tracing};
pub use runner::{Runner, ValueParseError, parse_typed_value, run};
