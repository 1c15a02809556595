//! Published register snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Latest known raw words, keyed by register address.
///
/// `None` marks an address that was polled but could not be read; it is
/// distinct from a register holding zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSnapshot {
    values: HashMap<u16, Option<u16>>,
    revision: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl ValueSnapshot {
    /// Raw word at `address`, if known.
    pub fn word(&self, address: u16) -> Option<u16> {
        self.values.get(&address).copied().flatten()
    }

    /// Whether `address` was part of the last poll (known or not).
    pub fn contains(&self, address: u16) -> bool {
        self.values.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of addresses in this snapshot with no known value.
    pub fn unknown_count(&self) -> usize {
        self.values.values().filter(|value| value.is_none()).count()
    }

    /// Increments on every publish or patch.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// When this snapshot was published; `None` before the first poll.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, Option<u16>)> + '_ {
        self.values.iter().map(|(&address, &value)| (address, value))
    }
}

impl FromIterator<(u16, Option<u16>)> for ValueSnapshot {
    fn from_iter<I: IntoIterator<Item = (u16, Option<u16>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
            revision: 0,
            updated_at: None,
        }
    }
}

/// Holds the current [`ValueSnapshot`] and notifies subscribers on change.
///
/// Readers only ever see whole snapshots: a poll replaces the map in one
/// step and a write patches a copy before swapping it in.
#[derive(Debug)]
pub struct ValueStore {
    tx: watch::Sender<Arc<ValueSnapshot>>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ValueSnapshot::default()));
        Self { tx }
    }

    /// The snapshot currently published.
    pub fn current(&self) -> Arc<ValueSnapshot> {
        self.tx.borrow().clone()
    }

    /// Receive every newly published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ValueSnapshot>> {
        self.tx.subscribe()
    }

    /// Replace the whole snapshot with freshly polled values.
    pub(crate) fn publish(&self, values: HashMap<u16, Option<u16>>) -> u64 {
        let mut revision = 0;
        self.tx.send_modify(|current| {
            revision = current.revision + 1;
            *current = Arc::new(ValueSnapshot {
                values,
                revision,
                updated_at: Some(Utc::now()),
            });
        });
        revision
    }

    /// Set a single address, keeping every other entry.
    pub(crate) fn patch(&self, address: u16, value: u16) -> u64 {
        let mut revision = 0;
        self.tx.send_modify(|current| {
            let mut next = (**current).clone();
            next.values.insert(address, Some(value));
            next.revision += 1;
            next.updated_at = Some(Utc::now());
            revision = next.revision;
            *current = Arc::new(next);
        });
        revision
    }
}
