//! Site-wide session re-validation

use super::{AuthError, AuthenticationContext};
use crate::http::HttpMessage;
use crate::listener::HttpSenderListener;
use crate::sender::{HttpSender, Initiator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Listener position of the monitor; ahead of history so the resubmitted
/// exchange is what gets recorded
pub const AUTH_MONITOR_ORDER: i32 = 1000;

/// Watches every received response and logs contexts back in
///
/// For a response inside a context that is fully configured and set to
/// re-authenticate, a logged-out verdict replays the context's login and
/// resubmits the message once. The resubmitted response replaces the
/// original one. Replays and resubmissions are sent as
/// [`Initiator::Authentication`] and never trigger the monitor again.
#[derive(Debug)]
pub struct AuthContextMonitor {
    contexts: RwLock<Vec<AuthenticationContext>>,
    enabled: AtomicBool,
}

impl AuthContextMonitor {
    pub fn new() -> Self {
        AuthContextMonitor {
            contexts: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Add a context, replacing one of the same name.
    pub fn add_context(&self, context: AuthenticationContext) {
        let mut contexts = self.write();
        contexts.retain(|c| c.name() != context.name());
        contexts.push(context);
    }

    pub fn remove_context(&self, name: &str) -> Option<AuthenticationContext> {
        let mut contexts = self.write();
        let pos = contexts.iter().position(|c| c.name() == name)?;
        Some(contexts.remove(pos))
    }

    /// Edit a context in place.
    pub fn with_context_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut AuthenticationContext) -> R,
    ) -> Option<R> {
        let mut contexts = self.write();
        contexts.iter_mut().find(|c| c.name() == name).map(f)
    }

    pub fn context_names(&self) -> Vec<String> {
        self.read().iter().map(|c| c.name().to_string()).collect()
    }

    /// Global switch over every context's own setting
    pub fn set_reauthenticate(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn reauthenticate(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<AuthenticationContext>> {
        match self.contexts.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<AuthenticationContext>> {
        match self.contexts.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Login request of the first context that wants `msg` resubmitted.
    ///
    /// The context lock is released before anything is sent.
    fn login_for(&self, msg: &HttpMessage) -> Option<(String, HttpMessage)> {
        let uri = msg.request().uri();
        let contexts = self.read();
        contexts
            .iter()
            .filter(|c| c.reauthenticate() && c.is_fully_configured() && c.contains(uri))
            .find(|c| c.is_logged_in(msg) == Some(false))
            .and_then(|c| {
                c.login_message()
                    .map(|login| (c.name().to_string(), login.clone_request()))
            })
    }

    fn reauthenticate_and_resubmit(
        &self,
        context: &str,
        mut login: HttpMessage,
        msg: &mut HttpMessage,
        sender: &HttpSender,
    ) -> Result<(), AuthError> {
        let auth_sender = sender.with_initiator(Initiator::Authentication);

        login.set_auth_exchange(true);
        login.set_requesting_user(None);
        auth_sender.send_and_receive(&mut login, true)?;
        log::debug!(
            "Replayed login of {} -> {:?}",
            context,
            login.status_code()
        );

        let mut retry = msg.clone_request();
        retry.request_mut().headers_mut().remove("Cookie");
        retry.set_auth_exchange(true);
        auth_sender.send_and_receive(&mut retry, false)?;

        if let Some(response) = retry.take_response() {
            msg.set_response(response);
        }
        if let (Some(sent), Some(elapsed)) = (retry.time_sent(), retry.elapsed()) {
            msg.set_timing(sent, elapsed);
        }
        Ok(())
    }
}

impl Default for AuthContextMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSenderListener for AuthContextMonitor {
    fn order(&self) -> i32 {
        AUTH_MONITOR_ORDER
    }

    fn on_response_receive(&self, msg: &mut HttpMessage, initiator: Initiator, sender: &HttpSender) {
        if !self.reauthenticate()
            || initiator == Initiator::Authentication
            || msg.is_auth_exchange()
            || msg.response().is_none()
        {
            return;
        }
        let (context, login) = match self.login_for(msg) {
            Some(found) => found,
            None => return,
        };

        log::info!(
            "{} looks logged out of {}, replaying login",
            msg.request().uri(),
            context
        );
        if let Err(e) = self.reauthenticate_and_resubmit(&context, login, msg, sender) {
            log::warn!("Re-authentication for {} failed: {}", context, e);
        }
    }

    fn name(&self) -> &str {
        "auth-context-monitor"
    }
}
