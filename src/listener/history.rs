//! Exchange history logging

use super::proxy::{ProxyListener, HISTORY_LOG_ORDER};
use super::HttpSenderListener;
use crate::http::HttpMessage;
use crate::sender::{HttpSender, Initiator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history store is full ({0} entries)")]
    Full(usize),

    #[error("history store failure: {0}")]
    Store(String),
}

/// Durable log of completed exchanges
pub trait HistoryStore: Send + Sync {
    /// Persist a completed exchange, returning its history id.
    fn persist(&self, msg: &HttpMessage, initiator: Option<Initiator>) -> Result<u64, HistoryError>;
}

/// Stored exchange
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: u64,
    pub initiator: Option<Initiator>,
    pub recorded: SystemTime,
    pub message: HttpMessage,
}

/// In-memory history, optionally bounded
#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
    next_id: AtomicU64,
    capacity: Option<usize>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MemoryHistory {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl HistoryStore for MemoryHistory {
    fn persist(&self, msg: &HttpMessage, initiator: Option<Initiator>) -> Result<u64, HistoryError> {
        let mut entries = self.lock();
        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                return Err(HistoryError::Full(capacity));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        entries.push(HistoryEntry {
            id,
            initiator,
            recorded: SystemTime::now(),
            message: msg.clone(),
        });
        Ok(id)
    }
}

/// Writes completed exchanges to a history store
///
/// Registered as a sender listener it records outbound traffic; on the
/// proxy path it records what the browser saw. Store failures are logged
/// and never affect the exchange.
pub struct HistoryListener {
    store: Arc<dyn HistoryStore>,
    initiators: Option<Vec<Initiator>>,
}

impl HistoryListener {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        HistoryListener {
            store,
            initiators: None,
        }
    }

    /// Only record exchanges started by these initiators.
    pub fn only(mut self, initiators: &[Initiator]) -> Self {
        self.initiators = Some(initiators.to_vec());
        self
    }

    fn record(&self, msg: &HttpMessage, initiator: Option<Initiator>) {
        if msg.response().is_none() {
            return;
        }
        if let Err(e) = self.store.persist(msg, initiator) {
            log::warn!("Failed to persist {} to history: {}", msg.request().uri(), e);
        }
    }
}

impl HttpSenderListener for HistoryListener {
    fn order(&self) -> i32 {
        HISTORY_LOG_ORDER
    }

    fn on_response_receive(&self, msg: &mut HttpMessage, initiator: Initiator, _sender: &HttpSender) {
        let wanted = self
            .initiators
            .as_ref()
            .map_or(true, |list| list.contains(&initiator));
        if wanted {
            self.record(msg, Some(initiator));
        }
    }

    fn name(&self) -> &str {
        "history"
    }
}

impl ProxyListener for HistoryListener {
    fn order(&self) -> i32 {
        HISTORY_LOG_ORDER
    }

    fn on_request(&self, _msg: &mut HttpMessage) -> bool {
        true
    }

    fn on_response(&self, msg: &mut HttpMessage) -> bool {
        self.record(msg, Some(Initiator::Proxy));
        true
    }

    fn name(&self) -> &str {
        "history"
    }
}
