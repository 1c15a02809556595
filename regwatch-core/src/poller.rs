//! Periodic polling of the registered addresses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::registry::AddressRegistry;
use crate::store::ValueStore;
use crate::transport::{Connector, Transport, TransportError};

/// Error type for polling operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("Connection failed: {0}")]
    Connection(#[from] TransportError),
}

/// Outcome of one completed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    /// Addresses attempted in this cycle.
    pub polled: usize,
    /// Addresses that could not be read.
    pub failed: usize,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// Reads every registered address on a fixed cadence and publishes the
/// result as one snapshot.
pub struct PollLoop<C: Connector> {
    transport: Arc<Transport<C>>,
    registry: Arc<AddressRegistry>,
    store: Arc<ValueStore>,
    refresh: Arc<Notify>,
    interval: Duration,
    cycle: Arc<Mutex<()>>,
}

impl<C: Connector> Clone for PollLoop<C> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            refresh: self.refresh.clone(),
            interval: self.interval,
            cycle: self.cycle.clone(),
        }
    }
}

impl<C: Connector> PollLoop<C> {
    pub fn new(
        transport: Arc<Transport<C>>,
        registry: Arc<AddressRegistry>,
        store: Arc<ValueStore>,
        refresh: Arc<Notify>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            store,
            refresh,
            interval,
            cycle: Arc::new(Mutex::new(())),
        }
    }

    /// Run poll cycles forever: one per interval, plus one for every
    /// refresh request. The first cycle starts one interval from now.
    pub async fn run(self) {
        info!(
            "Starting poller (interval: {:?}, {} addresses)",
            self.interval,
            self.registry.len()
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.refresh.notified() => {
                    debug!("Out-of-band refresh requested");
                    ticker.reset();
                }
            }

            match self.poll_once().await {
                Ok(summary) => {
                    debug!(
                        "Polled {} addresses ({} failed) in {:?}",
                        summary.polled, summary.failed, summary.duration
                    );
                }
                Err(e) => {
                    warn!("Polling error: {}", e);
                }
            }
        }
    }

    /// Perform a single poll cycle.
    ///
    /// A failed read only marks its own address unknown. If the device
    /// cannot be reached at all, every registered address is published as
    /// unknown and the connection error is returned.
    pub async fn poll_once(&self) -> Result<PollSummary, PollError> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let addresses = self.registry.addresses();

        if let Err(e) = self.transport.connect().await {
            error!(
                "Cannot reach device, {} addresses unknown: {}",
                addresses.len(),
                e
            );
            self.store
                .publish(addresses.into_iter().map(|address| (address, None)).collect());
            return Err(PollError::Connection(e));
        }

        let mut values = HashMap::with_capacity(addresses.len());
        let mut failed = 0;

        for address in addresses {
            match self.transport.read_holding_registers(address, 1).await {
                Ok(words) => {
                    let word = words.first().copied();
                    debug!("Read {:#06x} -> {:?}", address, word);
                    values.insert(address, word);
                }
                Err(e) => {
                    debug!("Failed to read {:#06x}: {}", address, e);
                    failed += 1;
                    values.insert(address, None);
                }
            }
        }

        let polled = values.len();
        let revision = self.store.publish(values);
        debug!("Published snapshot revision {}", revision);

        Ok(PollSummary {
            polled,
            failed,
            duration: started.elapsed(),
        })
    }

    /// Ask the running loop for an immediate extra cycle.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }
}
