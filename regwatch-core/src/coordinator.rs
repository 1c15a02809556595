//! The coordinator handed to every register consumer.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, CoordinatorSettings};
use crate::decode::{self, EncodeError, RegisterDescriptor, TypedValue};
use crate::poller::{PollError, PollLoop, PollSummary};
use crate::registry::AddressRegistry;
use crate::store::{ValueSnapshot, ValueStore};
use crate::transport::{ConnectionState, Connector, ModbusConnector, Transport, TransportError};
use crate::writer::WriteCoordinator;

/// Error type for coordinator operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("First poll failed: {0}")]
    NotReady(#[source] PollError),
    #[error("Coordinator already started")]
    AlreadyStarted,
    #[error("Register '{0}' is read-only")]
    ReadOnly(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("Write failed: {0}")]
    Write(#[from] TransportError),
}

/// Polls the registered addresses of one device and mediates typed reads
/// and writes.
///
/// Cloning is cheap; every clone drives the same connection, registry and
/// snapshot.
pub struct Coordinator<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Coordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C: Connector> {
    settings: CoordinatorSettings,
    transport: Arc<Transport<C>>,
    registry: Arc<AddressRegistry>,
    store: Arc<ValueStore>,
    poller: PollLoop<C>,
    writer: WriteCoordinator<C>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.get_mut().take() {
            task.abort();
        }
    }
}

impl Coordinator<ModbusConnector> {
    /// Coordinator for a Modbus TCP or RTU device.
    pub fn modbus(
        connection: ConnectionConfig,
        unit_id: u8,
        settings: CoordinatorSettings,
    ) -> Self {
        Self::new(ModbusConnector::new(connection, unit_id), settings)
    }
}

impl<C: Connector> Coordinator<C> {
    pub fn new(connector: C, settings: CoordinatorSettings) -> Self {
        let transport = Arc::new(Transport::new(connector, settings.io_timeout));
        let registry = Arc::new(AddressRegistry::new());
        let store = Arc::new(ValueStore::new());
        let refresh = Arc::new(Notify::new());

        let poller = PollLoop::new(
            transport.clone(),
            registry.clone(),
            store.clone(),
            refresh.clone(),
            settings.poll_interval,
        );
        let writer = WriteCoordinator::new(
            transport.clone(),
            store.clone(),
            refresh,
            settings.verify_delay,
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                registry,
                store,
                poller,
                writer,
                poll_task: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    /// Add a single address to the polled set.
    pub fn register_address(&self, address: u16) -> bool {
        self.inner.registry.register(address)
    }

    /// Add every address `descriptor` needs to the polled set.
    pub fn register(&self, descriptor: &RegisterDescriptor) -> usize {
        self.inner
            .registry
            .register_descriptor(descriptor, self.inner.settings.inversion_flag_address)
    }

    /// Number of registered addresses.
    pub fn registered(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_registered(&self, address: u16) -> bool {
        self.inner.registry.contains(address)
    }

    /// Run the first poll cycle and start the periodic loop.
    ///
    /// Succeeds once a cycle has completed, even if individual addresses
    /// failed; fails if the device could not be reached.
    pub async fn start(&self) -> Result<PollSummary, CoordinatorError> {
        let mut task = self.inner.poll_task.lock().await;
        if task.is_some() {
            return Err(CoordinatorError::AlreadyStarted);
        }

        let summary = self
            .inner
            .poller
            .poll_once()
            .await
            .map_err(CoordinatorError::NotReady)?;

        info!(
            "First poll complete: {} addresses, {} failed",
            summary.polled, summary.failed
        );

        *task = Some(tokio::spawn(self.inner.poller.clone().run()));
        Ok(summary)
    }

    /// Whether the periodic loop is running.
    pub async fn is_running(&self) -> bool {
        self.inner
            .poll_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop polling, drop any pending verification and close the connection.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.poll_task.lock().await.take() {
            task.abort();
        }
        self.inner.writer.cancel_pending();
        self.inner.transport.close().await;
        info!("Coordinator stopped");
    }

    /// Poll right now, outside the regular cadence.
    pub async fn refresh_now(&self) -> Result<PollSummary, PollError> {
        self.inner.poller.poll_once().await
    }

    /// Ask the running loop for an immediate extra cycle.
    pub fn request_refresh(&self) {
        self.inner.poller.request_refresh();
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<ValueSnapshot> {
        self.inner.store.current()
    }

    /// Receive every published or patched snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ValueSnapshot>> {
        self.inner.store.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.subscribe_state()
    }

    /// Decode `descriptor` from the current snapshot.
    ///
    /// `None` means at least one of its words is not known yet.
    pub fn read_typed(&self, descriptor: &RegisterDescriptor) -> Option<TypedValue> {
        let value = decode::decode(
            &self.snapshot(),
            descriptor,
            self.inner.settings.inversion_flag_address,
        );
        if value.is_none() {
            debug!("No data for '{}' at {:#06x}", descriptor.name, descriptor.address);
        }
        value
    }

    /// Decode one bit of the register at `address`.
    pub fn read_bit(&self, address: u16, bit: u8, invertible: bool) -> Option<bool> {
        decode::decode_bit(
            &self.snapshot(),
            address,
            bit,
            invertible,
            self.inner.settings.inversion_flag_address,
        )
    }

    /// Encode `value` for `descriptor` and write it.
    ///
    /// Invertible bitfields are written so they read back as `value` under
    /// the current inversion flag.
    pub async fn write_typed(
        &self,
        descriptor: &RegisterDescriptor,
        value: &TypedValue,
    ) -> Result<(), CoordinatorError> {
        if !descriptor.writable {
            return Err(CoordinatorError::ReadOnly(descriptor.name.clone()));
        }

        let raw = decode::encode_inverted(
            &self.snapshot(),
            value,
            descriptor,
            self.inner.settings.inversion_flag_address,
        )?;
        self.write_raw(descriptor.address, raw).await?;
        debug!("Wrote {:?} (raw {}) to '{}'", value, raw, descriptor.name);
        Ok(())
    }

    /// Write a raw word, patch the snapshot and schedule verification.
    pub async fn write_raw(&self, address: u16, raw: u16) -> Result<(), TransportError> {
        self.inner.writer.write(address, raw).await
    }

    /// Momentary write of `1` followed by an immediate refresh.
    pub async fn press(&self, address: u16) -> Result<(), TransportError> {
        self.inner.writer.press(address).await
    }

    /// Whether a write verification poll is still scheduled.
    pub fn verification_pending(&self) -> bool {
        self.inner.writer.verification_pending()
    }
}
