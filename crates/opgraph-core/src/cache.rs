//! Fulfillment cache - 取得リクエストの重複排除台帳
//!
//! Entries are keyed by expiry time and record whether a fetch for a
//! signature is still in flight (`Pending`) or has been satisfied
//! (`Fulfilled`). Expiry is only checked when a validation looks the
//! signature up; nothing is expired in the background.
//!
//! Invariant: at most one entry exists per signature, so at most one is
//! `Pending`. Every read-modify-write happens under one lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::RequestComponents;

/// Identity of a logical fetch: entity name plus predicate string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchSignature {
    pub entity: String,
    pub predicate: String,
}

impl FetchSignature {
    pub fn new(entity: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: predicate.into(),
        }
    }

    /// `None` when the request names no entity.
    pub fn of(components: &RequestComponents) -> Option<Self> {
        let entity = components.entity_name()?;
        Some(Self::new(entity, components.predicate.signature()))
    }
}

impl std::fmt::Display for FetchSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.predicate.is_empty() {
            f.write_str(&self.entity)
        } else {
            write!(f, "{}?{}", self.entity, self.predicate)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Fulfilled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentEntry {
    pub signature: FetchSignature,
    pub status: FulfillmentStatus,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of validating a fetch against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// A new `Pending` entry was recorded; the caller should fetch.
    Proceed,
    /// Another fetch for the signature is in flight.
    AlreadyPending,
    /// A fulfilled fetch has not expired yet.
    StillFresh,
}

impl Validation {
    pub fn should_fetch(self) -> bool {
        matches!(self, Validation::Proceed)
    }
}

#[derive(Default)]
struct Ledger {
    entries: BTreeMap<(DateTime<Utc>, u64), FulfillmentEntry>,
    next_seq: u64,
}

impl Ledger {
    fn find(&self, signature: &FetchSignature) -> Option<(DateTime<Utc>, u64)> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.signature == *signature)
            .map(|(key, _)| *key)
    }

    fn insert(&mut self, entry: FulfillmentEntry) {
        let key = (entry.expires_at, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, entry);
    }
}

#[derive(Default)]
pub struct FulfillmentCache {
    ledger: Mutex<Ledger>,
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl.max(Duration::zero()))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl FulfillmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a fetch for `signature` should go to the network,
    /// claiming a `Pending` entry (expiring at `now + ttl`) if so.
    pub fn validate(
        &self,
        signature: &FetchSignature,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Validation {
        let mut ledger = self.ledger.lock();
        if let Some(key) = ledger.find(signature) {
            let (status, expires_at) = {
                let entry = &ledger.entries[&key];
                (entry.status, entry.expires_at)
            };
            match status {
                FulfillmentStatus::Pending => {
                    debug!(%signature, "fetch already pending");
                    return Validation::AlreadyPending;
                }
                FulfillmentStatus::Fulfilled if expires_at > now => {
                    debug!(%signature, %expires_at, "fetch still fresh");
                    return Validation::StillFresh;
                }
                FulfillmentStatus::Fulfilled => {
                    debug!(%signature, "fulfilled entry expired");
                    ledger.entries.remove(&key);
                }
            }
        }
        ledger.insert(FulfillmentEntry {
            signature: signature.clone(),
            status: FulfillmentStatus::Pending,
            expires_at: expiry(now, ttl),
        });
        Validation::Proceed
    }

    /// Flip the pending entry for `signature` to `Fulfilled`, expiring at
    /// `now + ttl`. Returns `false` if nothing was pending.
    pub fn fulfill(&self, signature: &FetchSignature, ttl: Duration, now: DateTime<Utc>) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(key) = ledger.find(signature) else {
            return false;
        };
        if ledger.entries[&key].status != FulfillmentStatus::Pending {
            return false;
        }
        ledger.entries.remove(&key);
        ledger.insert(FulfillmentEntry {
            signature: signature.clone(),
            status: FulfillmentStatus::Fulfilled,
            expires_at: expiry(now, ttl),
        });
        true
    }

    /// Drop the pending entry for `signature` so a later request may fetch.
    pub fn release(&self, signature: &FetchSignature) -> bool {
        let mut ledger = self.ledger.lock();
        match ledger.find(signature) {
            Some(key) if ledger.entries[&key].status == FulfillmentStatus::Pending => {
                ledger.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, signature: &FetchSignature) -> Option<FulfillmentEntry> {
        let ledger = self.ledger.lock();
        ledger.find(signature).map(|key| ledger.entries[&key].clone())
    }

    /// All entries, soonest expiry first.
    pub fn entries(&self) -> Vec<FulfillmentEntry> {
        self.ledger.lock().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.ledger.lock().entries.clear();
    }
}
