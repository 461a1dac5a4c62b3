//! Redirect following under a redirection policy
//!
//! GET and HEAD redirects are followed by the executor, hop by hop, with
//! the validator consulted before each hop. POST and PUT are sent once
//! without following; a redirect answer is then re-issued by hand as a GET
//! to the `Location` target, after which the executor follows any further
//! hops of that GET.

use crate::cookies::CookieJar;
use crate::http::{HttpBody, HttpMessage, Method, Result, Status};
use crate::scope::{Mode, Scope};
use crate::sender::HttpSender;
use std::sync::{Arc, Mutex, RwLock};
use url::Url;

/// Redirect hops re-issued by hand for POST and PUT.
///
/// The GET that replaces the original request has its own redirects followed
/// by the transport, so deeper chains are not walked here.
pub const MANUAL_REDIRECT_HOPS: usize = 1;

/// Whether a status asks the client to go elsewhere.
pub fn is_redirect_status(status: Status) -> bool {
    matches!(status.code(), 301 | 302 | 303 | 307 | 308)
}

/// Policy deciding which redirects may be followed
pub trait RedirectionValidator: Send + Sync {
    /// Whether the redirect to `target` may be followed.
    fn is_valid(&self, target: &Url) -> bool;

    /// Called with every message received by following a redirect.
    fn on_message_received(&self, _msg: &HttpMessage) {}
}

/// Accepts every redirect
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

impl RedirectionValidator for PermissiveValidator {
    fn is_valid(&self, _target: &Url) -> bool {
        true
    }
}

/// Redirection policy derived from the operating mode
///
/// Safe mode rejects every redirect, protected mode accepts only targets in
/// scope, and the other modes accept everything. Mode and scope can change
/// while sends are in flight; each hop reads the current values.
#[derive(Debug)]
pub struct ModeRedirectionValidator {
    mode: RwLock<Mode>,
    scope: RwLock<Arc<Scope>>,
}

impl ModeRedirectionValidator {
    pub fn new(mode: Mode, scope: Scope) -> Self {
        ModeRedirectionValidator {
            mode: RwLock::new(mode),
            scope: RwLock::new(Arc::new(scope)),
        }
    }

    pub fn mode(&self) -> Mode {
        match self.mode.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        match self.mode.write() {
            Ok(mut guard) => *guard = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
    }

    pub fn set_scope(&self, scope: Scope) {
        match self.scope.write() {
            Ok(mut guard) => *guard = Arc::new(scope),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(scope),
        }
    }

    fn scope(&self) -> Arc<Scope> {
        match self.scope.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RedirectionValidator for ModeRedirectionValidator {
    fn is_valid(&self, target: &Url) -> bool {
        match self.mode() {
            Mode::Safe => false,
            Mode::Protect => self.scope().is_in_scope(target.as_str()),
            Mode::Standard | Mode::Attack => true,
        }
    }
}

/// What redirect following left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectOutcome {
    /// First redirect the policy refused, if any
    pub invalid_redirection: Option<Url>,
    /// Redirects re-issued by hand
    pub manual_hops: usize,
}

/// Wraps a validator and remembers the first target it rejected.
struct Recorder<'a> {
    inner: &'a dyn RedirectionValidator,
    first_invalid: Mutex<Option<Url>>,
}

impl Recorder<'_> {
    fn take(&self) -> Option<Url> {
        match self.first_invalid.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl RedirectionValidator for Recorder<'_> {
    fn is_valid(&self, target: &Url) -> bool {
        let valid = self.inner.is_valid(target);
        if !valid {
            let mut first = match self.first_invalid.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            first.get_or_insert_with(|| target.clone());
        }
        valid
    }

    fn on_message_received(&self, msg: &HttpMessage) {
        self.inner.on_message_received(msg);
    }
}

/// Sends a message and follows its redirects per a validator
pub struct RedirectFollower<'a> {
    validator: &'a dyn RedirectionValidator,
}

impl<'a> RedirectFollower<'a> {
    pub fn new(validator: &'a dyn RedirectionValidator) -> Self {
        RedirectFollower { validator }
    }

    /// Send `msg`, following redirects when asked.
    ///
    /// A rejected redirect is not an error: the message keeps the response
    /// that asked for it and the outcome names the rejected target.
    pub fn follow(
        &self,
        sender: &HttpSender,
        msg: &mut HttpMessage,
        follow_redirects: bool,
        jar: Option<&CookieJar>,
    ) -> Result<RedirectOutcome> {
        let recorder = Recorder {
            inner: self.validator,
            first_invalid: Mutex::new(None),
        };
        let method = msg.request().method();

        if !follow_redirects || !matches!(method, Method::Post | Method::Put) {
            sender.execute(msg, follow_redirects, Some(&recorder), jar)?;
            return Ok(RedirectOutcome {
                invalid_redirection: recorder.take(),
                manual_hops: 0,
            });
        }

        sender.execute(msg, false, None, jar)?;

        let mut trailing: Option<HttpMessage> = None;
        let mut manual_hops = 0;
        for _ in 0..MANUAL_REDIRECT_HOPS {
            let last = trailing.as_ref().unwrap_or(&*msg);
            let next = match redirect_request(last) {
                Some(next) => next,
                None => break,
            };
            let target = next.request().url()?;
            if !recorder.is_valid(&target) {
                log::debug!("Not following {} redirect to {}", method, target);
                break;
            }

            let mut next = next;
            sender.execute(&mut next, true, Some(&recorder), jar)?;
            recorder.on_message_received(&next);
            manual_hops += 1;
            trailing = Some(next);
        }

        if let Some(last) = trailing {
            copy_exchange(msg, last);
        }
        Ok(RedirectOutcome {
            invalid_redirection: recorder.take(),
            manual_hops,
        })
    }
}

/// The GET that replaces a redirected request, if its response redirects.
fn redirect_request(msg: &HttpMessage) -> Option<HttpMessage> {
    let response = msg.response()?;
    let status = response.status();
    if !status.is_redirection() || status == Status::NOT_MODIFIED {
        return None;
    }
    let base = msg.request().url().ok()?;
    let target = crate::sender::redirect_target(&base, response)?;

    let mut next = msg.clone_request();
    let request = next.request_mut();
    request.set_method(Method::Get);
    request.set_body(HttpBody::new());
    request.set_content_length(0);
    request.set_uri(&target);
    request.headers_mut().remove("Cookie");
    Some(next)
}

/// Move the trailing exchange onto the original message.
fn copy_exchange(msg: &mut HttpMessage, mut last: HttpMessage) {
    msg.set_request(last.request().clone());
    if let Some(response) = last.take_response() {
        msg.set_response(response);
    }
    if let (Some(sent), Some(elapsed)) = (last.time_sent(), last.elapsed()) {
        msg.set_timing(sent, elapsed);
    }
    msg.set_upgraded(last.upgraded().cloned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_mode_policy() {
        let scope = Scope::with_prefix("http://example.com/");
        let validator = ModeRedirectionValidator::new(Mode::Safe, scope);
        let inside = url("http://example.com/done");
        let outside = url("http://elsewhere.com/");

        assert!(!validator.is_valid(&inside));

        validator.set_mode(Mode::Protect);
        assert!(validator.is_valid(&inside));
        assert!(!validator.is_valid(&outside));

        validator.set_mode(Mode::Standard);
        assert!(validator.is_valid(&outside));
        validator.set_mode(Mode::Attack);
        assert!(validator.is_valid(&outside));
    }

    #[test]
    fn test_recorder_keeps_first_rejection() {
        let inner = ModeRedirectionValidator::new(Mode::Safe, Scope::new());
        let recorder = Recorder {
            inner: &inner,
            first_invalid: Mutex::new(None),
        };

        assert!(!recorder.is_valid(&url("http://a.example/")));
        assert!(!recorder.is_valid(&url("http://b.example/")));
        assert_eq!(recorder.take(), Some(url("http://a.example/")));
    }

    #[test]
    fn test_redirect_request_rewrites_to_get() {
        let mut msg = HttpMessage::new(
            crate::http::HttpRequest::builder()
                .method(Method::Post)
                .uri("http://example.com/submit")
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(b"x=1".to_vec())
                .build(),
        );
        msg.set_response(
            HttpResponse::builder()
                .status(Status::new(302).unwrap())
                .header("Location", "/ok")
                .build(),
        );

        let next = redirect_request(&msg).unwrap();
        assert_eq!(next.request().method(), Method::Get);
        assert_eq!(next.request().uri(), "http://example.com/ok");
        assert_eq!(next.request().content_length(), Some(0));
        assert!(next.request().body().is_empty());
        assert_eq!(next.request().headers().get("Host"), Some("example.com"));
    }

    #[test]
    fn test_not_modified_is_not_followed() {
        let mut msg = HttpMessage::get("http://example.com/");
        msg.set_response(
            HttpResponse::builder()
                .status(Status::NOT_MODIFIED)
                .header("Location", "/elsewhere")
                .build(),
        );
        assert!(redirect_request(&msg).is_none());
        assert!(!is_redirect_status(Status::NOT_MODIFIED));
    }
}
