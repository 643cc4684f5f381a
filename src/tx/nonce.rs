//! Local nonce reservation on top of the on-chain transaction count
//!
//! The chain only knows about mined transactions. Each signer's count of
//! reserved-but-unreleased executions is kept here, and a new execution uses
//! `on_chain_count + pending_before_reserve` as its nonce.
//!
//! Reserving reads and increments a signer's count while holding that key's
//! `DashMap` shard lock, with no `.await` in between. Two concurrent reservations
//! for one signer therefore always see different snapshots, on any number of
//! worker threads.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use tracing::{debug, warn};

/// Per-signer count of in-flight reservations
#[derive(Debug, Default)]
pub struct PendingNonceTable {
    pending: DashMap<Address, u64>,
}

impl PendingNonceTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Reserve a slot for `address`, returning the count before the increment
    pub fn reserve(&self, address: Address) -> Reservation<'_> {
        let snapshot = {
            let mut count = self.pending.entry(address).or_insert(0);
            let snapshot = *count;
            *count += 1;
            snapshot
        };

        debug!("Reserved slot {} for signer {:?}", snapshot, address);
        Reservation {
            table: self,
            address,
            snapshot,
        }
    }

    fn release(&self, address: Address) {
        match self.pending.entry(address) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                } else {
                    *entry.get_mut() -= 1;
                }
                debug!("Released slot for signer {:?}", address);
            }
            Entry::Vacant(_) => {
                warn!("Release for signer {:?} without a reservation", address);
            }
        }
    }

    /// Current count for `address`, without reserving
    pub fn pending(&self, address: Address) -> u64 {
        self.pending.get(&address).map(|count| *count).unwrap_or(0)
    }

    /// Current counts for `addresses`, in order
    pub fn snapshot(&self, addresses: impl IntoIterator<Item = Address>) -> Vec<u64> {
        addresses.into_iter().map(|a| self.pending(a)).collect()
    }

    /// Sum of all in-flight reservations
    pub fn total(&self) -> u64 {
        self.pending.iter().map(|entry| *entry.value()).sum()
    }

    /// Forget every reservation; only the signer pool does this, at init
    pub(crate) fn reset(&self) {
        self.pending.clear();
    }
}

/// A reserved slot; released exactly once, when dropped
#[derive(Debug)]
pub struct Reservation<'a> {
    table: &'a PendingNonceTable,
    address: Address,
    snapshot: u64,
}

impl Reservation<'_> {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Pending count observed just before this reservation
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn release(self) {}
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.table.release(self.address);
    }
}
