//! In-memory Modbus device used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regwatch_core::{Connector, Coordinator, RegisterLink, TransportError, ValueSnapshot};

#[derive(Debug, Default)]
struct DeviceState {
    registers: HashMap<u16, u16>,
    failing: HashSet<u16>,
    hanging: HashSet<u16>,
    truncated: HashSet<u16>,
    clamps: HashMap<u16, u16>,
    offline: bool,
    reject_writes: bool,
    latency: Duration,
    connects: usize,
    closes: usize,
    reads: Vec<u16>,
    writes: Vec<(u16, u16)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// A fake device holding registers in memory.
///
/// Cloning shares the same state, so tests keep a handle to inspect and
/// mutate the device while the coordinator talks to it.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registers(registers: &[(u16, u16)]) -> Self {
        let device = Self::new();
        for &(address, value) in registers {
            device.set(address, value);
        }
        device
    }

    fn with<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set(&self, address: u16, value: u16) {
        self.with(|s| s.registers.insert(address, value));
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.with(|s| s.registers.get(&address).copied())
    }

    /// Reads of `address` answer with an exception.
    pub fn fail_address(&self, address: u16) {
        self.with(|s| s.failing.insert(address));
    }

    /// Reads of `address` never answer.
    pub fn hang_address(&self, address: u16) {
        self.with(|s| s.hanging.insert(address));
    }

    /// Reads starting at `address` answer with one word too few.
    pub fn truncate_reads(&self, address: u16) {
        self.with(|s| s.truncated.insert(address));
    }

    /// Writes to `address` are stored capped at `max`.
    pub fn clamp(&self, address: u16, max: u16) {
        self.with(|s| s.clamps.insert(address, max));
    }

    /// Offline devices refuse connections and break open links.
    pub fn set_offline(&self, offline: bool) {
        self.with(|s| s.offline = offline);
    }

    pub fn reject_writes(&self, reject: bool) {
        self.with(|s| s.reject_writes = reject);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with(|s| s.latency = latency);
    }

    pub fn connects(&self) -> usize {
        self.with(|s| s.connects)
    }

    pub fn closes(&self) -> usize {
        self.with(|s| s.closes)
    }

    pub fn reads(&self) -> Vec<u16> {
        self.with(|s| s.reads.clone())
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.with(|s| s.writes.clone())
    }

    pub fn max_in_flight(&self) -> usize {
        self.with(|s| s.max_in_flight)
    }

    fn begin(&self) -> InFlight {
        self.with(|s| {
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
        });
        InFlight(self.clone())
    }
}

struct InFlight(MockDevice);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.with(|s| s.in_flight -= 1);
    }
}

pub struct MockLink {
    device: MockDevice,
}

impl Connector for MockDevice {
    type Link = MockLink;

    async fn connect(&self) -> Result<MockLink, TransportError> {
        tokio::task::yield_now().await;
        let offline = self.with(|s| {
            if !s.offline {
                s.connects += 1;
            }
            s.offline
        });
        if offline {
            return Err(TransportError::Connection("Connection refused".into()));
        }
        Ok(MockLink {
            device: self.clone(),
        })
    }
}

impl MockLink {
    async fn delay(&self, address: u16) {
        let (latency, hang) = self
            .device
            .with(|s| (s.latency, s.hanging.contains(&address)));
        tokio::task::yield_now().await;
        if hang {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl RegisterLink for MockLink {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let _guard = self.device.begin();
        self.delay(address).await;

        self.device.with(|s| {
            s.reads.push(address);
            if s.offline {
                return Err(TransportError::Io("Connection reset".into()));
            }
            if s.failing.contains(&address) {
                return Err(TransportError::Exception("IllegalDataAddress".into()));
            }
            let mut words = (address..address + count)
                .map(|addr| {
                    s.registers
                        .get(&addr)
                        .copied()
                        .ok_or_else(|| TransportError::Exception("IllegalDataAddress".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if s.truncated.contains(&address) {
                words.pop();
            }
            Ok(words)
        })
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let _guard = self.device.begin();
        self.delay(address).await;

        self.device.with(|s| {
            s.writes.push((address, value));
            if s.offline {
                return Err(TransportError::Io("Connection reset".into()));
            }
            if s.reject_writes {
                return Err(TransportError::Exception("IllegalDataValue".into()));
            }
            let stored = s.clamps.get(&address).map_or(value, |&max| value.min(max));
            s.registers.insert(address, stored);
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.device.with(|s| s.closes += 1);
        Ok(())
    }
}

/// Wait until a published snapshot satisfies `predicate`.
pub async fn wait_for<C, F>(coordinator: &Coordinator<C>, within: Duration, predicate: F) -> bool
where
    C: Connector,
    F: Fn(&ValueSnapshot) -> bool,
{
    let mut rx = coordinator.subscribe();
    tokio::time::timeout(within, async {
        loop {
            if predicate(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
}
