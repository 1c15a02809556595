//! Runner for one coordinated device.

use anyhow::{Context, Result};
use regwatch_core::{
    Connector, Coordinator, DataType, Flag, ModbusConnector, RegisterDescriptor, TypedValue,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::signal;
use tracing::{debug, info, warn};

use crate::args::Args;
use crate::config::RegwatchConfig;
use crate::logging::init_tracing;

/// Error type for values given on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueParseError {
    #[error("Unknown register '{0}'")]
    UnknownRegister(String),
    #[error("Register '{name}': '{text}' is not a number")]
    InvalidNumber { name: String, text: String },
    #[error("Register '{name}': unknown flag '{label}'")]
    UnknownFlag { name: String, label: String },
}

/// Parse command-line text into the value type `descriptor` expects.
///
/// Enumerated registers take an option label, bitfields take a boolean or a
/// comma-separated list of the flags to set, and numeric registers take a
/// number in engineering units.
pub fn parse_typed_value(
    descriptor: &RegisterDescriptor,
    text: &str,
) -> Result<TypedValue, ValueParseError> {
    let text = text.trim();

    if !descriptor.options.is_empty() {
        return Ok(TypedValue::Choice(text.to_string()));
    }

    match descriptor.data_type {
        DataType::Ascii => Ok(TypedValue::Text(text.to_string())),
        DataType::Bitfield => match parse_bool(text) {
            Some(on) => Ok(TypedValue::Bool(on)),
            None => parse_flags(descriptor, text).map(TypedValue::Flags),
        },
        DataType::Uint16 => match parse_bool(text) {
            Some(on) => Ok(TypedValue::Bool(on)),
            None => parse_number(descriptor, text),
        },
        DataType::Int16 | DataType::Uint32 | DataType::Float32 => parse_number(descriptor, text),
    }
}

fn parse_number(
    descriptor: &RegisterDescriptor,
    text: &str,
) -> Result<TypedValue, ValueParseError> {
    text.parse::<f64>()
        .map(TypedValue::Number)
        .map_err(|_| ValueParseError::InvalidNumber {
            name: descriptor.name.clone(),
            text: text.to_string(),
        })
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_lowercase().as_str() {
        "on" | "true" => Some(true),
        "off" | "false" => Some(false),
        _ => None,
    }
}

fn parse_flags(
    descriptor: &RegisterDescriptor,
    text: &str,
) -> Result<Vec<Flag>, ValueParseError> {
    let requested: Vec<&str> = text
        .split(',')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .collect();

    if let Some(unknown) = requested
        .iter()
        .find(|label| !descriptor.bits.iter().any(|def| def.label == **label))
    {
        return Err(ValueParseError::UnknownFlag {
            name: descriptor.name.clone(),
            label: unknown.to_string(),
        });
    }

    Ok(descriptor
        .bits
        .iter()
        .map(|def| Flag {
            bit: def.bit,
            label: def.label.clone(),
            on: requested.contains(&def.label.as_str()),
        })
        .collect())
}

/// Drives a [`Coordinator`] for the configured register catalog.
pub struct Runner<C: Connector> {
    config: RegwatchConfig,
    coordinator: Coordinator<C>,
}

impl Runner<ModbusConnector> {
    /// Runner talking Modbus to the configured device.
    pub fn modbus(config: RegwatchConfig) -> Self {
        let coordinator = Coordinator::modbus(
            config.device.connection.clone(),
            config.device.unit_id,
            config.device.settings(),
        );
        Self::new(config, coordinator)
    }
}

impl<C: Connector> Runner<C> {
    /// Create a runner and register every catalog entry with `coordinator`.
    pub fn new(config: RegwatchConfig, coordinator: Coordinator<C>) -> Self {
        for descriptor in &config.registers {
            let added = coordinator.register(descriptor);
            debug!(
                "Registered '{}' at {:#06x} ({} new addresses)",
                descriptor.name, descriptor.address, added
            );
        }

        Self {
            config,
            coordinator,
        }
    }

    pub fn config(&self) -> &RegwatchConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator<C> {
        &self.coordinator
    }

    /// Current decoded value of every catalog register, `null` when unknown.
    pub fn values(&self) -> Map<String, Value> {
        self.config
            .registers
            .iter()
            .map(|descriptor| {
                let value = self
                    .coordinator
                    .read_typed(descriptor)
                    .and_then(|value| serde_json::to_value(value).ok())
                    .unwrap_or(Value::Null);
                (descriptor.name.clone(), value)
            })
            .collect()
    }

    /// Apply `NAME=VALUE` writes in order, stopping at the first failure.
    pub async fn apply_writes(&self, writes: &[(String, String)]) -> Result<()> {
        for (name, text) in writes {
            let descriptor = self
                .config
                .register(name)
                .ok_or_else(|| ValueParseError::UnknownRegister(name.clone()))?;
            let value = parse_typed_value(descriptor, text)?;

            self.coordinator
                .write_typed(descriptor, &value)
                .await
                .with_context(|| format!("Failed to write '{}' to register '{}'", text, name))?;
            info!("Wrote {} = {}", name, text);
        }
        Ok(())
    }

    /// Log the decoded catalog on every snapshot until Ctrl+C, then shut down.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let mut rx = self.coordinator.subscribe();
        rx.mark_changed();

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        warn!("Snapshot channel closed");
                        break;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    info!(
                        device = %self.config.device.name,
                        revision = snapshot.revision(),
                        unknown = snapshot.unknown_count(),
                        "{}",
                        serde_json::Value::Object(self.values())
                    );
                }
                result = signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl+C")?;
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.coordinator.shutdown().await;
        Ok(())
    }
}

/// Entry point shared by the binary.
pub async fn run(args: Args) -> Result<()> {
    let config = RegwatchConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let logging = config.logging.clone().with_level_override(args.log_level.clone());
    init_tracing(&logging)?;

    info!("Starting regwatch {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);
    info!(
        "Device '{}' at {} (unit {}), {} registers",
        config.device.name,
        config.device.connection.describe(),
        config.device.unit_id,
        config.registers.len()
    );

    let runner = Runner::modbus(config);
    let summary = runner
        .coordinator()
        .start()
        .await
        .context("Device did not answer the first poll")?;
    info!(
        "Polling {} addresses ({} failed on first cycle)",
        summary.polled, summary.failed
    );

    if let Err(e) = runner.apply_writes(&args.writes).await {
        runner.coordinator().shutdown().await;
        return Err(e);
    }

    if args.once {
        if !args.writes.is_empty() {
            runner
                .coordinator()
                .refresh_now()
                .await
                .context("Refresh after writes failed")?;
        }
        println!("{}", serde_json::to_string_pretty(&runner.values())?);
        runner.coordinator().shutdown().await;
        return Ok(());
    }

    runner.run_until_shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use regwatch_core::{ConnectionConfig, CoordinatorError, CoordinatorSettings};

    fn setpoint() -> RegisterDescriptor {
        RegisterDescriptor::new("setpoint", 0x40, DataType::Int16)
            .with_scale(0.1, 1)
            .writable()
    }

    fn alarms() -> RegisterDescriptor {
        RegisterDescriptor::new("alarms", 0x70, DataType::Bitfield)
            .with_bit(0, "filter")
            .with_bit(3, "frost")
            .writable()
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(
            parse_typed_value(&setpoint(), " 21.5 "),
            Ok(TypedValue::Number(21.5))
        );
        assert_eq!(
            parse_typed_value(&setpoint(), "warm"),
            Err(ValueParseError::InvalidNumber {
                name: "setpoint".to_string(),
                text: "warm".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_choice() {
        let mode = RegisterDescriptor::new("mode", 0x50, DataType::Uint16)
            .with_option(0, "off")
            .with_option(1, "auto");
        assert_eq!(
            parse_typed_value(&mode, "auto"),
            Ok(TypedValue::Choice("auto".to_string()))
        );
    }

    #[test]
    fn test_parse_switch() {
        let switch = RegisterDescriptor::new("boost", 0x51, DataType::Uint16);
        assert_eq!(parse_typed_value(&switch, "ON"), Ok(TypedValue::Bool(true)));
        assert_eq!(parse_typed_value(&switch, "1"), Ok(TypedValue::Number(1.0)));
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_typed_value(&alarms(), "off"), Ok(TypedValue::Bool(false)));

        let Ok(TypedValue::Flags(flags)) = parse_typed_value(&alarms(), "frost") else {
            panic!("expected flags");
        };
        let states: Vec<_> = flags.iter().map(|flag| (flag.bit, flag.on)).collect();
        assert_eq!(states, vec![(0, false), (3, true)]);

        assert_eq!(
            parse_typed_value(&alarms(), "filter,smoke"),
            Err(ValueParseError::UnknownFlag {
                name: "alarms".to_string(),
                label: "smoke".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_ascii() {
        let serial = RegisterDescriptor::new("serial", 0x80, DataType::Ascii).with_word_count(4);
        assert_eq!(
            parse_typed_value(&serial, "AB12"),
            Ok(TypedValue::Text("AB12".to_string()))
        );
    }

    fn runner() -> Runner<ModbusConnector> {
        let config = RegwatchConfig::parse(
            r#"
            {
                device: { name: "test", connection: { type: "tcp", host: "127.0.0.1" } },
                registers: [
                    { name: "t1", address: 256, data_type: "int16", scale: 0.1, precision: 1 },
                    { name: "alarms", address: 270, data_type: "bitfield", bits: [{ bit: 0, label: "filter" }] },
                ],
            }
            "#,
        )
        .unwrap();
        let coordinator = Coordinator::modbus(
            ConnectionConfig::tcp("127.0.0.1"),
            1,
            CoordinatorSettings::default(),
        );
        Runner::new(config, coordinator)
    }

    #[test]
    fn test_catalog_is_registered() {
        let runner = runner();
        let coordinator = runner.coordinator();

        assert!(coordinator.is_registered(256));
        assert!(coordinator.is_registered(270));
        assert!(coordinator.is_registered(0x0104));
        assert_eq!(coordinator.registered(), 3);
    }

    #[test]
    fn test_values_unknown_before_first_poll() {
        let values = runner().values();
        assert_eq!(values.len(), 2);
        assert_eq!(values["t1"], Value::Null);
        assert_eq!(values["alarms"], Value::Null);
    }

    #[tokio::test]
    async fn test_write_errors_need_no_device() {
        let runner = runner();

        let err = runner
            .apply_writes(&[("missing".to_string(), "1".to_string())])
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValueParseError>(),
            Some(&ValueParseError::UnknownRegister("missing".to_string()))
        );

        let err = runner
            .apply_writes(&[("t1".to_string(), "21".to_string())])
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoordinatorError>(),
            Some(&CoordinatorError::ReadOnly("t1".to_string()))
        );
    }
}
