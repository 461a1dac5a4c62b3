//! Veto chain for the browser-facing proxy path
//!
//! A proxy listener returning `false` drops the exchange; later listeners
//! are not consulted.

use super::{guarded, OrderedList};
use crate::http::HttpMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Order of the history logger, the last regular proxy listener
pub const HISTORY_LOG_ORDER: i32 = 5000;

/// Order of proxy scripts: near the end, but before history logging
pub const SCRIPT_ORDER: i32 = HISTORY_LOG_ORDER - 1;

/// Observer on the proxy path that may veto forwarding
pub trait ProxyListener: Send + Sync {
    fn order(&self) -> i32;

    /// Return `false` to drop the request.
    fn on_request(&self, msg: &mut HttpMessage) -> bool;

    /// Return `false` to drop the response.
    fn on_response(&self, msg: &mut HttpMessage) -> bool;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Proxy listeners in notification order
pub struct ProxyListenerChain {
    list: OrderedList<dyn ProxyListener>,
}

impl ProxyListenerChain {
    pub fn new() -> Self {
        ProxyListenerChain {
            list: OrderedList::new(),
        }
    }

    pub fn add(&self, listener: Arc<dyn ProxyListener>) {
        self.list.add(listener.order(), listener);
    }

    pub fn remove(&self, listener: &Arc<dyn ProxyListener>) -> bool {
        self.list.remove(listener)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the request should be forwarded.
    pub fn notify_request(&self, msg: &mut HttpMessage) -> bool {
        self.notify("on_request", msg, |l, m| l.on_request(m))
    }

    /// Whether the response should be returned to the client.
    pub fn notify_response(&self, msg: &mut HttpMessage) -> bool {
        self.notify("on_response", msg, |l, m| l.on_response(m))
    }

    fn notify(
        &self,
        what: &str,
        msg: &mut HttpMessage,
        call: impl Fn(&dyn ProxyListener, &mut HttpMessage) -> bool,
    ) -> bool {
        for listener in self.list.snapshot() {
            // A failing listener is ignored, not treated as a veto.
            let proceed = guarded(what, listener.name(), || call(listener.as_ref(), msg));
            if proceed == Some(false) {
                log::debug!("{} dropped by {}", msg.request().uri(), listener.name());
                return false;
            }
        }
        true
    }
}

impl Default for ProxyListenerChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Error raised by a proxy script
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

/// Request/response hooks provided by a script
pub trait ProxyScript: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` drops the request.
    fn proxy_request(&self, msg: &mut HttpMessage) -> Result<bool, ScriptError>;

    /// `Ok(false)` drops the response.
    fn proxy_response(&self, msg: &mut HttpMessage) -> Result<bool, ScriptError>;
}

struct ScriptSlot {
    script: Arc<dyn ProxyScript>,
    enabled: AtomicBool,
}

/// Runs the enabled proxy scripts, disabling any that fail
pub struct ScriptProxyListener {
    scripts: RwLock<Vec<Arc<ScriptSlot>>>,
}

impl ScriptProxyListener {
    pub fn new() -> Self {
        ScriptProxyListener {
            scripts: RwLock::new(Vec::new()),
        }
    }

    pub fn add_script(&self, script: Arc<dyn ProxyScript>) {
        let slot = Arc::new(ScriptSlot {
            script,
            enabled: AtomicBool::new(true),
        });
        match self.scripts.write() {
            Ok(mut guard) => guard.push(slot),
            Err(poisoned) => poisoned.into_inner().push(slot),
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.slots()
            .iter()
            .any(|slot| slot.script.name() == name && slot.enabled.load(Ordering::Acquire))
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        for slot in self.slots() {
            if slot.script.name() == name {
                slot.enabled.store(enabled, Ordering::Release);
            }
        }
    }

    fn slots(&self) -> Vec<Arc<ScriptSlot>> {
        match self.scripts.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn run(
        &self,
        msg: &mut HttpMessage,
        hook: impl Fn(&dyn ProxyScript, &mut HttpMessage) -> Result<bool, ScriptError>,
    ) -> bool {
        for slot in self.slots() {
            if !slot.enabled.load(Ordering::Acquire) {
                continue;
            }
            let name = slot.script.name().to_string();
            match guarded("proxy script", &name, || hook(slot.script.as_ref(), msg)) {
                Some(Ok(true)) => {}
                Some(Ok(false)) => return false,
                Some(Err(e)) => {
                    log::error!("Disabling proxy script {}: {}", name, e);
                    slot.enabled.store(false, Ordering::Release);
                }
                None => {
                    log::error!("Disabling proxy script {} after a panic", name);
                    slot.enabled.store(false, Ordering::Release);
                }
            }
        }
        true
    }
}

impl Default for ScriptProxyListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyListener for ScriptProxyListener {
    fn order(&self) -> i32 {
        SCRIPT_ORDER
    }

    fn on_request(&self, msg: &mut HttpMessage) -> bool {
        self.run(msg, |script, m| script.proxy_request(m))
    }

    fn on_response(&self, msg: &mut HttpMessage) -> bool {
        self.run(msg, |script, m| script.proxy_response(m))
    }

    fn name(&self) -> &str {
        "scripts"
    }
}
