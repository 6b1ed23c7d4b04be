use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Held {
    next_token: u64,
    /// The token of the lease currently holding each upload id.
    leases: HashMap<String, u64>,
}

/// Per-upload mutual exclusion for reassembly.
///
/// Acquisition never blocks: a held upload id is reported back to the caller
/// right away. Distinct upload ids never contend.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    held: Mutex<Held>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `upload_id`, or returns `None` if it is already held.
    ///
    /// The lock is released when the returned `Lease` is dropped.
    pub fn try_acquire(&self, upload_id: &str) -> Option<Lease<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.leases.contains_key(upload_id) {
            return None;
        }

        let token = held.next_token;
        held.next_token += 1;
        held.leases.insert(upload_id.to_owned(), token);
        Some(Lease {
            guard: self,
            upload_id: upload_id.to_owned(),
            token,
        })
    }

    /// Force-releases the lock for `upload_id`, returning whether it was held.
    ///
    /// The lease that held it becomes stale: dropping it later leaves any
    /// newer holder alone.
    pub fn release(&self, upload_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leases
            .remove(upload_id)
            .is_some()
    }

    pub fn is_held(&self, upload_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leases
            .contains_key(upload_id)
    }

    fn release_lease(&self, lease: &Lease<'_>) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.leases.get(&lease.upload_id) == Some(&lease.token) {
            held.leases.remove(&lease.upload_id);
        }
    }
}

/// Proof of holding the lock of one upload id.
#[must_use = "the lock is released as soon as the lease is dropped"]
#[derive(Debug)]
pub struct Lease<'g> {
    guard: &'g ConcurrencyGuard,
    upload_id: String,
    token: u64,
}

impl Lease<'_> {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.guard.release_lease(self);
    }
}
