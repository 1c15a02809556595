//! Register writes with optimistic snapshot updates.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::ValueStore;
use crate::transport::{Connector, Transport, TransportError};

/// Issues writes through the shared transport and reconciles the snapshot
/// afterwards.
///
/// A successful write is reflected in the snapshot immediately. One
/// verification poll is then scheduled `verify_delay` later so values the
/// device clamped or ignored are replaced by what it actually stored.
pub struct WriteCoordinator<C: Connector> {
    transport: Arc<Transport<C>>,
    store: Arc<ValueStore>,
    refresh: Arc<Notify>,
    verify_delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> WriteCoordinator<C> {
    pub fn new(
        transport: Arc<Transport<C>>,
        store: Arc<ValueStore>,
        refresh: Arc<Notify>,
        verify_delay: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            refresh,
            verify_delay,
            pending: Mutex::new(None),
        }
    }

    /// Write `value` to `address`.
    ///
    /// On failure the snapshot is left untouched.
    pub async fn write(&self, address: u16, value: u16) -> Result<(), TransportError> {
        if let Err(e) = self.transport.write_register(address, value).await {
            warn!("Write failed at {:#06x}: {}", address, e);
            return Err(e);
        }

        let revision = self.store.patch(address, value);
        debug!(
            "Wrote {} to {:#06x} (snapshot revision {})",
            value, address, revision
        );

        self.schedule_verification();
        Ok(())
    }

    /// Momentary command: write `1` and poll right away, without touching
    /// the snapshot first.
    pub async fn press(&self, address: u16) -> Result<(), TransportError> {
        self.transport.write_register(address, 1).await?;
        debug!("Pressed {:#06x}", address);
        self.refresh.notify_one();
        Ok(())
    }

    /// Whether a verification poll is still waiting to fire.
    pub fn verification_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Drop any scheduled verification.
    pub fn cancel_pending(&self) {
        if let Some(task) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn schedule_verification(&self) {
        let refresh = self.refresh.clone();
        let delay = self.verify_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Requesting verification poll");
            refresh.notify_one();
        });

        // A newer write supersedes an older pending verification.
        if let Some(previous) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }
}

impl<C: Connector> Drop for WriteCoordinator<C> {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
