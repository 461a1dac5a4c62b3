//! Authentication and session re-validation
//!
//! Two mechanisms keep simulated sessions alive:
//!
//! - per message: a message sent on behalf of an [`Identity`] is checked
//!   after receipt and, if it looks logged out, resent once after the
//!   identity refreshes its session;
//! - per context: an [`AuthContextMonitor`] watches every response, and
//!   for contexts set up to re-authenticate it replays their login and
//!   resubmits the failed message once.

mod context;
mod identity;
mod monitor;

pub use context::{AuthIndicators, AuthenticationContext};
pub use identity::{FormIdentity, ManualIdentity};
pub use monitor::{AuthContextMonitor, AUTH_MONITOR_ORDER};

use crate::cookies::CookieJar;
use crate::http::{self, HttpMessage};
use crate::sender::HttpSender;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("login request failed: {0}")]
    Http(#[from] http::Error),

    #[error("invalid indicator pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("{0} is not configured for authentication")]
    NotConfigured(String),

    #[error("login for {0} was not accepted")]
    LoginRejected(String),
}

/// A simulated user with its own session state
pub trait Identity: Send + Sync {
    fn name(&self) -> &str;

    /// Cookie session of this user, kept apart from every other session
    fn cookies(&self) -> &CookieJar;

    /// Bring an outgoing message in line with the current session.
    fn adjust_request(&self, _msg: &mut HttpMessage) {}

    /// Whether a received response still belongs to a logged-in session.
    fn is_authenticated(&self, msg: &HttpMessage) -> bool;

    /// Establish a fresh session, replacing stored session tokens.
    fn refresh_session(&self, sender: &HttpSender) -> Result<(), AuthError>;
}

/// Whether a received message can tell us anything about the session.
fn worth_checking(msg: &HttpMessage) -> bool {
    !msg.response_body().is_empty() && !msg.request().is_image()
}

/// Send on behalf of `user`, re-authenticating and resending once if the
/// response looks logged out.
///
/// The retry resends the request as the caller built it, not whatever a
/// followed redirect left in `msg`. A failed refresh is logged and the
/// logged-out response is kept.
pub(crate) fn send_authenticated<R>(
    sender: &HttpSender,
    user: &dyn Identity,
    msg: &mut HttpMessage,
    mut send: impl FnMut(&mut HttpMessage) -> http::Result<R>,
) -> http::Result<R> {
    let original = msg.request().clone();
    user.adjust_request(msg);
    let outcome = send(msg)?;

    if !worth_checking(msg) || user.is_authenticated(msg) {
        return Ok(outcome);
    }

    log::info!(
        "{} looks logged out at {}, re-authenticating",
        user.name(),
        msg.request().uri()
    );
    if let Err(e) = user.refresh_session(sender) {
        log::warn!("Re-authentication of {} failed: {}", user.name(), e);
        return Ok(outcome);
    }

    msg.set_request(original);
    msg.take_response();
    user.adjust_request(msg);
    send(msg)
}
