//! Recorder: bounded in-memory history of intercepted transactions.
//!
//! Writers (`begin`, `complete`) come from terminal callbacks on arbitrary
//! threads and only take a short mutex. History is a ring: when full, the
//! oldest completed transaction is evicted. Pending transactions are bounded
//! too, and the oldest pending entry is dropped when a new one would exceed
//! the bound.
//!
//! Events are broadcast while the store lock is held, so subscribers see
//! completions in the order the terminal callbacks fired.

use crate::config::RecorderConfig;
use crate::metrics;
use crate::model::{Outcome, Transaction, TransactionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Completed history was full
    Capacity,
    /// Too many transactions were in flight
    PendingOverflow,
    /// Pending longer than the reaper's grace period
    Stale,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::PendingOverflow => "pending_overflow",
            EvictionReason::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Started(Arc<Transaction>),
    Completed(Arc<Transaction>),
    Evicted {
        id: TransactionId,
        reason: EvictionReason,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub started: u64,
    pub completed: u64,
    pub evicted: u64,
    /// Completions that arrived after their pending entry was evicted
    pub late_completions: u64,
    pub pending: usize,
    pub retained: usize,
}

#[derive(Serialize)]
struct Export<'a> {
    exported_at: DateTime<Utc>,
    stats: RecorderStats,
    transactions: Vec<&'a Transaction>,
    pending: Vec<&'a Transaction>,
}

#[derive(Default)]
struct Store {
    pending: BTreeMap<TransactionId, Arc<Transaction>>,
    completed: VecDeque<Arc<Transaction>>,
}

pub struct Recorder {
    store: Mutex<Store>,
    capacity: usize,
    pending_capacity: usize,
    max_body_bytes: Option<usize>,
    events: broadcast::Sender<TransactionEvent>,
    started: AtomicU64,
    completed: AtomicU64,
    evicted: AtomicU64,
    late_completions: AtomicU64,
}

impl Recorder {
    pub fn new(config: &RecorderConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            store: Mutex::new(Store::default()),
            capacity: config.capacity.max(1),
            pending_capacity: config.pending_capacity.max(1),
            max_body_bytes: config.max_body_bytes,
            events,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            late_completions: AtomicU64::new(0),
        }
    }

    /// Recorder retaining at most `capacity` completed transactions.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&RecorderConfig {
            capacity,
            ..RecorderConfig::default()
        })
    }

    /// Register a pending transaction.
    pub fn begin(&self, transaction: Transaction) {
        let transaction = Arc::new(self.capture(transaction));
        let mut store = self.store.lock();

        if store.pending.len() >= self.pending_capacity {
            if let Some((id, _)) = store.pending.pop_first() {
                debug!("Pending transaction {} dropped: too many in flight", id);
                self.evicted_locked(id, EvictionReason::PendingOverflow);
            }
        }

        store.pending.insert(transaction.id, Arc::clone(&transaction));
        self.started.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(TransactionEvent::Started(transaction));
    }

    /// Move a transaction from pending into history. Also accepts
    /// transactions whose pending entry has already been evicted.
    pub fn complete(&self, transaction: Transaction) -> Arc<Transaction> {
        let transaction = Arc::new(self.capture(transaction));
        let mut store = self.store.lock();

        if store.pending.remove(&transaction.id).is_none() {
            self.late_completions.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Transaction {} completed after its pending entry was evicted",
                transaction.id
            );
        }

        store.completed.push_back(Arc::clone(&transaction));
        while store.completed.len() > self.capacity {
            if let Some(oldest) = store.completed.pop_front() {
                self.evicted_locked(oldest.id, EvictionReason::Capacity);
            }
        }

        self.completed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .events
            .send(TransactionEvent::Completed(Arc::clone(&transaction)));
        transaction
    }

    /// Evict pending transactions created more than `grace` ago.
    pub fn reap_pending(&self, grace: Duration) -> Vec<TransactionId> {
        let Ok(grace) = chrono::Duration::from_std(grace) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - grace;

        let mut store = self.store.lock();
        let stale: Vec<TransactionId> = store
            .pending
            .values()
            .filter(|t| t.request.created_at() <= cutoff)
            .map(|t| t.id)
            .collect();
        for id in &stale {
            store.pending.remove(id);
            self.evicted_locked(*id, EvictionReason::Stale);
        }
        drop(store);

        if !stale.is_empty() {
            info!("Reaped {} stale pending transactions", stale.len());
        }
        stale
    }

    /// Completed transactions, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Transaction>> {
        self.store.lock().completed.iter().cloned().collect()
    }

    /// In-flight transactions, by id.
    pub fn pending(&self) -> Vec<Arc<Transaction>> {
        self.store.lock().pending.values().cloned().collect()
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        let store = self.store.lock();
        if let Some(pending) = store.pending.get(&id) {
            return Some(Arc::clone(pending));
        }
        store.completed.iter().rev().find(|t| t.id == id).cloned()
    }

    /// Drop completed history. In-flight transactions are kept.
    pub fn clear(&self) {
        let cleared = {
            let mut store = self.store.lock();
            let n = store.completed.len();
            store.completed.clear();
            n
        };
        info!("Cleared {} recorded transactions", cleared);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.store.lock().completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RecorderStats {
        let store = self.store.lock();
        RecorderStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            late_completions: self.late_completions.load(Ordering::Relaxed),
            pending: store.pending.len(),
            retained: store.completed.len(),
        }
    }

    /// History and in-flight transactions as JSON. Bodies are base64.
    pub fn export_json(&self) -> serde_json::Result<String> {
        let stats = self.stats();
        let store = self.store.lock();
        let export = Export {
            exported_at: Utc::now(),
            stats,
            transactions: store.completed.iter().map(Arc::as_ref).collect(),
            pending: store.pending.values().map(Arc::as_ref).collect(),
        };
        serde_json::to_string_pretty(&export)
    }

    /// Apply the body capture limit before a transaction is stored.
    fn capture(&self, mut transaction: Transaction) -> Transaction {
        if let Some(limit) = self.max_body_bytes {
            transaction.request.cap_body(limit);
            if let Outcome::Response(response) = &mut transaction.outcome {
                response.cap_body(limit);
            }
        }
        transaction
    }

    /// Caller holds the store lock.
    fn evicted_locked(&self, id: TransactionId, reason: EvictionReason) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        metrics::record_eviction(reason.as_str(), 1);
        let _ = self.events.send(TransactionEvent::Evicted { id, reason });
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(&RecorderConfig::default())
    }
}
