//! Subtree locks
//!
//! A lock on an address covers its whole subtree, so two locks conflict when
//! one address is a prefix of the other. Locks are re-entrant for the owning
//! context. A context may only *wait* for an address greater than every
//! address it already holds; anything else is a non-blocking attempt that
//! fails with LOCK-ORDER when busy. Waiting therefore always moves up the
//! address order and cannot form a cycle.

use crate::error::OperationFailure;
use mgmt_model::PathAddress;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Identity of an execution context
pub type ContextId = Uuid;

/// Process-wide table of held subtree locks
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<Vec<(PathAddress, ContextId)>>,
    released: Notify,
}

impl LockTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if no other context holds an overlapping one
    fn try_claim(&self, address: &PathAddress, owner: ContextId) -> bool {
        let mut held = self.held.lock();
        let busy = held
            .iter()
            .any(|(a, o)| *o != owner && a.overlaps(address));
        if !busy {
            held.push((address.clone(), owner));
        }
        !busy
    }

    /// Wait until the lock can be taken
    async fn claim(&self, address: &PathAddress, owner: ContextId) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_claim(address, owner) {
                return;
            }
            notified.await;
        }
    }

    fn release_all(&self, owner: ContextId) {
        let released = {
            let mut held = self.held.lock();
            let before = held.len();
            held.retain(|(_, o)| *o != owner);
            before != held.len()
        };
        if released {
            self.released.notify_waiters();
        }
    }

    /// Addresses currently locked by anyone
    #[must_use]
    pub fn locked_addresses(&self) -> Vec<PathAddress> {
        self.held.lock().iter().map(|(a, _)| a.clone()).collect()
    }
}

/// Locks held by one context; dropping it releases them all
#[derive(Debug)]
pub struct HeldLocks {
    table: Arc<LockTable>,
    owner: ContextId,
    held: Vec<PathAddress>,
}

impl HeldLocks {
    /// Empty set of locks for `owner`
    #[must_use]
    pub fn new(table: Arc<LockTable>, owner: ContextId) -> Self {
        Self {
            table,
            owner,
            held: Vec::new(),
        }
    }

    /// Held addresses in acquisition order
    #[must_use]
    pub fn held(&self) -> &[PathAddress] {
        &self.held
    }

    /// Move every held lock into a new owner handle, leaving this one empty
    pub(crate) fn detach(&mut self) -> HeldLocks {
        HeldLocks {
            table: Arc::clone(&self.table),
            owner: self.owner,
            held: std::mem::take(&mut self.held),
        }
    }

    /// Whether a held lock covers `address`
    #[must_use]
    pub fn covers(&self, address: &PathAddress) -> bool {
        self.held.iter().any(|h| h.is_prefix_of(address))
    }

    /// Outermost held lock covering `address`
    #[must_use]
    pub fn root_for(&self, address: &PathAddress) -> Option<&PathAddress> {
        self.held
            .iter()
            .filter(|h| h.is_prefix_of(address))
            .min_by_key(|h| h.len())
    }

    fn highest(&self) -> Option<&PathAddress> {
        self.held.iter().max()
    }

    /// Whether ordering allows waiting for `address`
    #[must_use]
    pub fn may_wait_for(&self, address: &PathAddress) -> bool {
        self.highest().map_or(true, |h| address > h)
    }

    /// Non-blocking acquisition
    ///
    /// # Errors
    /// [`OperationFailure::LockOrder`] when another context holds an
    /// overlapping lock.
    pub fn try_acquire(&mut self, address: &PathAddress) -> Result<(), OperationFailure> {
        if self.covers(address) {
            return Ok(());
        }
        if self.table.try_claim(address, self.owner) {
            self.held.push(address.clone());
            return Ok(());
        }
        Err(OperationFailure::LockOrder {
            requested: address.clone(),
            held: self.highest().cloned().unwrap_or_default(),
        })
    }

    /// Acquire, waiting if ordering allows it
    ///
    /// # Errors
    /// [`OperationFailure::LockOrder`] when the address is busy and lies
    /// below an address already held.
    pub async fn acquire(&mut self, address: &PathAddress) -> Result<(), OperationFailure> {
        if self.covers(address) {
            return Ok(());
        }
        if !self.may_wait_for(address) {
            return self.try_acquire(address);
        }
        self.table.claim(address, self.owner).await;
        self.held.push(address.clone());
        Ok(())
    }

    /// Acquire every address in ascending order, waiting as needed
    ///
    /// # Errors
    /// Propagates [`acquire`](Self::acquire) failures.
    pub async fn acquire_all(
        &mut self,
        mut addresses: Vec<PathAddress>,
    ) -> Result<(), OperationFailure> {
        addresses.sort();
        addresses.dedup();
        for address in &addresses {
            self.acquire(address).await?;
        }
        Ok(())
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.table.release_all(self.owner);
        }
    }
}
