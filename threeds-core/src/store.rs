//! Correlation stores for out-of-band milestones.
//!
//! A store is a set of server transaction identifiers that are known to have reached a
//! milestone (fingerprinting finished, challenge finished). Webhook ingestion inserts,
//! the polling path looks up and the orchestrator removes once it consumed the record.
//! Both paths arrive on independent connections, so every operation goes through one
//! mutex per store. Critical sections never span an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info};

/// The out-of-band milestone a store tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Milestone {
    /// The ACS finished collecting device attributes (3DS method).
    Fingerprint,
    /// The cardholder finished the interactive challenge.
    Challenge,
}

#[derive(Debug)]
struct CorrelationRecord {
    server_transaction_id: String,
    recorded_at: Instant,
}

/// A process-wide set of transaction identifiers that reached a [`Milestone`].
///
/// Membership is insertion ordered. Adding an identifier that is already present is a
/// no-op, so duplicate notifications before consumption never create a second record.
#[derive(Debug)]
pub struct CorrelationStore {
    milestone: Milestone,
    records: Mutex<Vec<CorrelationRecord>>,
}

impl CorrelationStore {
    /// Creates an empty store for `milestone`.
    #[must_use]
    pub const fn new(milestone: Milestone) -> Self {
        Self {
            milestone,
            records: Mutex::new(Vec::new()),
        }
    }

    /// The milestone this store tracks.
    #[must_use]
    pub const fn milestone(&self) -> Milestone {
        self.milestone
    }

    // A panic while holding the lock cannot leave the membership half-updated, so a
    // poisoned lock is still safe to use.
    fn records(&self) -> MutexGuard<'_, Vec<CorrelationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `server_transaction_id`. Returns `false` when it was already present.
    pub fn add(&self, server_transaction_id: &str) -> bool {
        let mut records = self.records();
        if records
            .iter()
            .any(|record| record.server_transaction_id == server_transaction_id)
        {
            debug!(
                milestone = %self.milestone,
                server_transaction_id,
                "duplicate correlation record ignored"
            );
            return false;
        }
        records.push(CorrelationRecord {
            server_transaction_id: server_transaction_id.to_string(),
            recorded_at: Instant::now(),
        });
        info!(milestone = %self.milestone, server_transaction_id, "correlation record added");
        true
    }

    /// Deletes `server_transaction_id`. Returns `false` when it was absent.
    pub fn remove(&self, server_transaction_id: &str) -> bool {
        let mut records = self.records();
        let Some(index) = records
            .iter()
            .position(|record| record.server_transaction_id == server_transaction_id)
        else {
            return false;
        };
        records.remove(index);
        info!(milestone = %self.milestone, server_transaction_id, "correlation record removed");
        true
    }

    /// Whether `server_transaction_id` is currently recorded.
    #[must_use]
    pub fn contains(&self, server_transaction_id: &str) -> bool {
        self.records()
            .iter()
            .any(|record| record.server_transaction_id == server_transaction_id)
    }

    /// All recorded identifiers in insertion order. Intended for diagnostics.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|record| record.server_transaction_id.clone())
            .collect()
    }

    /// Number of recorded identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Whether the store holds no identifiers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Drops records that were never consumed within `ttl`. Returns how many were dropped.
    ///
    /// Notifications for transactions nobody polls for would otherwise stay in the store
    /// until the process exits.
    pub fn expire_older_than(&self, ttl: Duration) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|record| record.recorded_at.elapsed() < ttl);
        let expired = before - records.len();
        if expired > 0 {
            info!(milestone = %self.milestone, expired, "expired stale correlation records");
        }
        expired
    }
}

/// The pair of stores shared by webhook ingestion and the orchestrator.
///
/// Cloning is cheap and every clone observes the same membership.
#[derive(Debug, Clone)]
pub struct CorrelationStores {
    /// Transactions whose device fingerprinting completed.
    pub fingerprint: Arc<CorrelationStore>,
    /// Transactions whose challenge completed.
    pub challenge: Arc<CorrelationStore>,
}

impl CorrelationStores {
    /// Creates two empty stores.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fingerprint: Arc::new(CorrelationStore::new(Milestone::Fingerprint)),
            challenge: Arc::new(CorrelationStore::new(Milestone::Challenge)),
        }
    }

    /// The store tracking `milestone`.
    #[must_use]
    pub const fn get(&self, milestone: Milestone) -> &Arc<CorrelationStore> {
        match milestone {
            Milestone::Fingerprint => &self.fingerprint,
            Milestone::Challenge => &self.challenge,
        }
    }

    /// Removes `server_transaction_id` from both stores.
    pub fn clear(&self, server_transaction_id: &str) {
        self.fingerprint.remove(server_transaction_id);
        self.challenge.remove(server_transaction_id);
    }

    /// Expires stale records in both stores. Returns the total dropped.
    pub fn expire_older_than(&self, ttl: Duration) -> usize {
        self.fingerprint.expire_older_than(ttl) + self.challenge.expire_older_than(ttl)
    }
}

impl Default for CorrelationStores {
    fn default() -> Self {
        Self::new()
    }
}
