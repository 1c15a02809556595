//! Connection and timing settings consumed by the coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decode::DEFAULT_INVERSION_FLAG_ADDRESS;

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl ConnectionConfig {
    /// TCP connection on the standard Modbus port.
    pub fn tcp(host: impl Into<String>) -> Self {
        ConnectionConfig::Tcp {
            host: host.into(),
            port: default_modbus_port(),
        }
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            ConnectionConfig::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => format!("rtu://{}@{}", port, baud_rate),
        }
    }
}

/// Timing and addressing settings for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Time between regular poll cycles.
    pub poll_interval: Duration,
    /// Delay between a successful write and its verification poll.
    pub verify_delay: Duration,
    /// Upper bound for a single connect, read or write.
    pub io_timeout: Duration,
    /// Register whose bit 0 inverts invertible bitfields.
    pub inversion_flag_address: u16,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            verify_delay: Duration::from_secs(1),
            io_timeout: Duration::from_secs(3),
            inversion_flag_address: DEFAULT_INVERSION_FLAG_ADDRESS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_connection() {
        let conn: ConnectionConfig =
            json5::from_str(r#"{ type: "tcp", host: "192.168.1.10" }"#).unwrap();
        assert_eq!(conn, ConnectionConfig::tcp("192.168.1.10"));
        assert_eq!(conn.describe(), "tcp://192.168.1.10:502");
    }

    #[test]
    fn test_parse_rtu_connection() {
        let conn: ConnectionConfig = json5::from_str(
            r#"{ type: "rtu", port: "/dev/ttyUSB0", baud_rate: 19200, parity: "even" }"#,
        )
        .unwrap();

        if let ConnectionConfig::Rtu {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } = &conn
        {
            assert_eq!(port, "/dev/ttyUSB0");
            assert_eq!(*baud_rate, 19200);
            assert_eq!(*data_bits, 8);
            assert_eq!(parity, "even");
            assert_eq!(*stop_bits, 1);
        } else {
            panic!("Expected RTU connection");
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = CoordinatorSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(3));
        assert_eq!(settings.verify_delay, Duration::from_secs(1));
        assert_eq!(settings.inversion_flag_address, 0x0104);
    }
}
