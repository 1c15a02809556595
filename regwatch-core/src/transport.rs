//! Serialized access to the device connection.
//!
//! Modbus has no request multiplexing, so a [`Transport`] owns at most one
//! live link and holds a lock around every request/response exchange.
//! Links are opened lazily and dropped on I/O failure; the next request
//! reconnects.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tokio_modbus::client::{Client, Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

/// Error type for device I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Expected {expected} registers, got {got}")]
    ShortResponse { expected: u16, got: usize },
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether the link can no longer be trusted after this error.
    ///
    /// Exceptions and short responses are answers from a live device; every
    /// other failure drops the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Exception(_) | TransportError::ShortResponse { .. }
        )
    }
}

/// Connection state as seen by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// A single live connection able to exchange holding-register requests.
pub trait RegisterLink: Send + 'static {
    /// Read `count` holding registers starting at `address` (function 0x03).
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Write one holding register (function 0x06).
    fn write_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the underlying connection.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Opens new [`RegisterLink`]s to the device.
pub trait Connector: Send + Sync + 'static {
    type Link: RegisterLink;

    fn connect(&self) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// Owns the device connection and serializes every request on it.
pub struct Transport<C: Connector> {
    connector: C,
    io_timeout: Duration,
    link: Mutex<Option<C::Link>>,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> Transport<C> {
    pub fn new(connector: C, io_timeout: Duration) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            io_timeout,
            link: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Establish the connection unless one is already open.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.link.lock().await;
        self.ensure_connected(&mut slot).await.map(|_| ())
    }

    /// Read `count` holding registers starting at `address`.
    pub async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut slot = self.link.lock().await;
        let link = self.ensure_connected(&mut slot).await?;

        let response = timeout(self.io_timeout, link.read_holding_registers(address, count)).await;
        let result = match response {
            Ok(Ok(words)) if words.len() == usize::from(count) => Ok(words),
            Ok(Ok(words)) => Err(TransportError::ShortResponse {
                expected: count,
                got: words.len(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(self.io_timeout)),
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                self.drop_link(&mut slot, e);
            }
        }
        result
    }

    /// Write `value` to the holding register at `address`.
    pub async fn write_register(&self, address: u16, value: u16) -> Result<(), TransportError> {
        let mut slot = self.link.lock().await;
        let link = self.ensure_connected(&mut slot).await?;

        let result = match timeout(self.io_timeout, link.write_register(address, value)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.io_timeout)),
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                self.drop_link(&mut slot, e);
            }
        }
        result
    }

    /// Release the connection. Safe to call when already closed.
    pub async fn close(&self) {
        let mut slot = self.link.lock().await;
        if let Some(mut link) = slot.take() {
            match timeout(self.io_timeout, link.close()).await {
                Ok(Ok(())) => debug!("Connection closed"),
                Ok(Err(e)) => warn!("Error while closing connection: {}", e),
                Err(_) => warn!("Timed out closing connection"),
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<C::Link>,
    ) -> Result<&'a mut C::Link, TransportError> {
        if slot.is_none() {
            self.state.send_replace(ConnectionState::Connecting);

            let link = match timeout(self.io_timeout, self.connector.connect()).await {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(_) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(TransportError::Timeout(self.io_timeout));
                }
            };

            info!("Connected to device");
            *slot = Some(link);
            self.state.send_replace(ConnectionState::Connected);
        }

        slot.as_mut().ok_or(TransportError::NotConnected)
    }

    fn drop_link(&self, slot: &mut Option<C::Link>, cause: &TransportError) {
        if slot.take().is_some() {
            warn!("Dropping connection after error: {}", cause);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// Opens tokio-modbus client contexts over TCP or RTU.
#[derive(Debug, Clone)]
pub struct ModbusConnector {
    connection: ConnectionConfig,
    unit_id: u8,
}

impl ModbusConnector {
    pub fn new(connection: ConnectionConfig, unit_id: u8) -> Self {
        Self {
            connection,
            unit_id,
        }
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("No address for '{}'", host)))
    }
}

impl Connector for ModbusConnector {
    type Link = Context;

    async fn connect(&self) -> Result<Context, TransportError> {
        let slave = Slave(self.unit_id);

        match &self.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr = Self::resolve(host, *port).await?;
                debug!("Connecting to {}", addr);
                tcp::connect_slave(addr, slave)
                    .await
                    .map_err(|e| TransportError::Connection(e.to_string()))
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connection(format!("Serial open failed: {}", e))
                })?;

                Ok(rtu::attach_slave(serial, slave))
            }
        }
    }
}

impl RegisterLink for Context {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        Reader::read_holding_registers(self, address, count)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        Writer::write_single_register(self, address, value)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Client::disconnect(self)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}
