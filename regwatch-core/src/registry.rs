//! The set of register addresses the poller reads.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::decode::{DataType, RegisterDescriptor};

/// Append-only set of addresses contributed by consumers.
///
/// Registration is idempotent and there is no way to remove an address:
/// the set lives exactly as long as the coordinator that owns it.
#[derive(Debug, Default)]
pub struct AddressRegistry {
    addresses: Mutex<BTreeSet<u16>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `address` to the polled set. Returns `true` if it was not present.
    pub fn register(&self, address: u16) -> bool {
        let added = self
            .addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address);
        if added {
            debug!("Registered address {:#06x} for polling", address);
        }
        added
    }

    /// Register every word `descriptor` decodes from, plus the inversion
    /// flag for bitfield registers. Returns the number of new addresses.
    pub fn register_descriptor(
        &self,
        descriptor: &RegisterDescriptor,
        inversion_address: u16,
    ) -> usize {
        let mut added = descriptor
            .addresses()
            .filter(|&address| self.register(address))
            .count();
        if descriptor.data_type == DataType::Bitfield && self.register(inversion_address) {
            added += 1;
        }
        added
    }

    pub fn contains(&self, address: u16) -> bool {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    pub fn len(&self) -> usize {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current set, in ascending order.
    pub(crate) fn addresses(&self) -> Vec<u16> {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}
