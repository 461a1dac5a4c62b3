//! Ordered observers around every send
//!
//! Listeners run in ascending `order`; equal orders run in the order they
//! were added. Each call is isolated: a listener that panics is logged and
//! skipped, and the exchange and the remaining listeners carry on.

pub mod history;
pub mod proxy;

pub use history::{HistoryEntry, HistoryError, HistoryListener, HistoryStore, MemoryHistory};
pub use proxy::{
    ProxyListener, ProxyListenerChain, ProxyScript, ScriptError, ScriptProxyListener,
    HISTORY_LOG_ORDER, SCRIPT_ORDER,
};

use crate::http::HttpMessage;
use crate::sender::{HttpSender, Initiator};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Observer notified before every send and after every receive
pub trait HttpSenderListener: Send + Sync {
    /// Position in the notification sequence, lowest first
    fn order(&self) -> i32;

    fn on_request_send(&self, _msg: &mut HttpMessage, _initiator: Initiator, _sender: &HttpSender) {
    }

    fn on_response_receive(
        &self,
        _msg: &mut HttpMessage,
        _initiator: Initiator,
        _sender: &HttpSender,
    ) {
    }

    /// Name used in log output
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

struct Entry<L: ?Sized> {
    order: i32,
    seq: u64,
    listener: Arc<L>,
}

/// Listeners kept sorted by `(order, insertion)`
pub(crate) struct OrderedList<L: ?Sized> {
    entries: RwLock<Vec<Entry<L>>>,
    next_seq: AtomicU64,
}

impl<L: ?Sized> OrderedList<L> {
    pub(crate) fn new() -> Self {
        OrderedList {
            entries: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, order: i32, listener: Arc<L>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pos = entries.partition_point(|e| (e.order, e.seq) < (order, seq));
        entries.insert(pos, Entry { order, seq, listener });
    }

    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        entries.len() != before
    }

    /// Current listeners, in notification order.
    ///
    /// Taken as a copy so listeners can send (and register others) while
    /// being notified.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().map(|e| e.listener.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Run one listener callback, containing any panic.
pub(crate) fn guarded<T>(what: &str, name: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::warn!("Listener {} failed in {}: {}", name, what, reason);
            None
        }
    }
}

/// The sender listeners of one transport context
pub struct ListenerRegistry {
    list: OrderedList<dyn HttpSenderListener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry {
            list: OrderedList::new(),
        }
    }

    pub fn add(&self, listener: Arc<dyn HttpSenderListener>) {
        self.list.add(listener.order(), listener);
    }

    pub fn remove(&self, listener: &Arc<dyn HttpSenderListener>) -> bool {
        self.list.remove(listener)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn notify_request(
        &self,
        msg: &mut HttpMessage,
        initiator: Initiator,
        sender: &HttpSender,
    ) {
        for listener in self.list.snapshot() {
            guarded("on_request_send", listener.name(), || {
                listener.on_request_send(msg, initiator, sender)
            });
        }
    }

    pub(crate) fn notify_response(
        &self,
        msg: &mut HttpMessage,
        initiator: Initiator,
        sender: &HttpSender,
    ) {
        for listener in self.list.snapshot() {
            guarded("on_response_receive", listener.name(), || {
                listener.on_response_receive(msg, initiator, sender)
            });
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
