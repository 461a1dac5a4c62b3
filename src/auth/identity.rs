//! Simulated users

use super::{AuthError, AuthIndicators, Identity};
use crate::cookies::CookieJar;
use crate::http::HttpMessage;
use crate::sender::{HttpSender, Initiator};
use url::Url;

/// A user who logs in by submitting a stored login request
///
/// The session lives in the identity's own cookie jar. Refreshing it clears
/// the jar and replays the login, following its redirects so cookies set
/// along the way are collected too.
#[derive(Debug)]
pub struct FormIdentity {
    name: String,
    jar: CookieJar,
    login: HttpMessage,
    indicators: AuthIndicators,
}

impl FormIdentity {
    pub fn new(name: impl Into<String>, login: &HttpMessage, indicators: AuthIndicators) -> Self {
        let mut login = login.clone_request();
        login.set_requesting_user(None);
        FormIdentity {
            name: name.into(),
            jar: CookieJar::new(),
            login,
            indicators,
        }
    }

    pub fn login_message(&self) -> &HttpMessage {
        &self.login
    }

    pub fn indicators(&self) -> &AuthIndicators {
        &self.indicators
    }
}

impl Identity for FormIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    /// Cookies come from this user's jar only.
    fn adjust_request(&self, msg: &mut HttpMessage) {
        msg.request_mut().headers_mut().remove("Cookie");
    }

    fn is_authenticated(&self, msg: &HttpMessage) -> bool {
        self.indicators.evaluate(msg).unwrap_or(true)
    }

    fn refresh_session(&self, sender: &HttpSender) -> Result<(), AuthError> {
        self.jar.clear();

        let mut login = self.login.clone_request();
        login.set_auth_exchange(true);
        sender
            .with_initiator(Initiator::Authentication)
            .send_in_session(&mut login, &self.jar, true)?;

        if self.indicators.evaluate(&login) == Some(false) {
            return Err(AuthError::LoginRejected(self.name.clone()));
        }
        log::debug!(
            "{} logged in, {} session cookie(s)",
            self.name,
            self.jar.len()
        );
        Ok(())
    }
}

/// A user whose session cookies are set by hand
///
/// There is no way to log back in, so responses are always taken as
/// authenticated.
#[derive(Debug)]
pub struct ManualIdentity {
    name: String,
    jar: CookieJar,
}

impl ManualIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        ManualIdentity {
            name: name.into(),
            jar: CookieJar::new(),
        }
    }

    pub fn set_cookie(&self, url: &Url, name: &str, value: &str) {
        self.jar.set(url, name, value);
    }
}

impl Identity for ManualIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    fn is_authenticated(&self, _msg: &HttpMessage) -> bool {
        true
    }

    fn refresh_session(&self, _sender: &HttpSender) -> Result<(), AuthError> {
        Err(AuthError::NotConfigured(self.name.clone()))
    }
}
