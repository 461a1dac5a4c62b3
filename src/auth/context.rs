//! Authentication contexts and logged-in indicators

use super::AuthError;
use crate::http::HttpMessage;
use crate::scope::Scope;
use regex::Regex;

/// Patterns telling logged-in responses from logged-out ones
///
/// Each pattern is matched against the response header block and body.
#[derive(Debug, Clone, Default)]
pub struct AuthIndicators {
    logged_in: Option<Regex>,
    logged_out: Option<Regex>,
}

impl AuthIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the logged-in pattern.
    pub fn set_logged_in(&mut self, pattern: &str) -> Result<(), AuthError> {
        self.logged_in = Some(Regex::new(pattern)?);
        Ok(())
    }

    /// Replace the logged-out pattern.
    pub fn set_logged_out(&mut self, pattern: &str) -> Result<(), AuthError> {
        self.logged_out = Some(Regex::new(pattern)?);
        Ok(())
    }

    pub fn clear_logged_in(&mut self) {
        self.logged_in = None;
    }

    pub fn clear_logged_out(&mut self) {
        self.logged_out = None;
    }

    pub fn logged_in(&self) -> Option<&str> {
        self.logged_in.as_ref().map(Regex::as_str)
    }

    pub fn logged_out(&self) -> Option<&str> {
        self.logged_out.as_ref().map(Regex::as_str)
    }

    pub fn is_configured(&self) -> bool {
        self.logged_in.is_some() || self.logged_out.is_some()
    }

    /// Whether the response of `msg` shows a logged-in session.
    ///
    /// `None` when no pattern is set or no response has been received.
    pub fn evaluate(&self, msg: &HttpMessage) -> Option<bool> {
        if !self.is_configured() {
            return None;
        }
        let response = msg.response()?;
        let text = response.http_body().to_string_lossy();

        if self.logged_in.as_ref().is_some_and(|re| re.is_match(&text)) {
            return Some(true);
        }
        match &self.logged_out {
            // No logout marker means the session is still alive
            Some(re) => Some(!re.is_match(&text)),
            None => Some(false),
        }
    }
}

/// Authentication settings of one context
#[derive(Debug, Clone)]
pub struct AuthenticationContext {
    name: String,
    scope: Scope,
    login: Option<HttpMessage>,
    logout: Option<HttpMessage>,
    indicators: AuthIndicators,
    reauthenticate: bool,
}

impl AuthenticationContext {
    pub fn new(name: impl Into<String>, scope: Scope) -> Self {
        AuthenticationContext {
            name: name.into(),
            scope,
            login: None,
            logout: None,
            indicators: AuthIndicators::new(),
            reauthenticate: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
    }

    /// Whether `uri` belongs to this context
    pub fn contains(&self, uri: &str) -> bool {
        self.scope.is_in_scope(uri)
    }

    /// Store the login request to replay; any response on it is dropped.
    pub fn set_login_message(&mut self, msg: &HttpMessage) {
        self.login = Some(msg.clone_request());
    }

    pub fn set_logout_message(&mut self, msg: &HttpMessage) {
        self.logout = Some(msg.clone_request());
    }

    pub fn clear_login_message(&mut self) {
        self.login = None;
    }

    pub fn clear_logout_message(&mut self) {
        self.logout = None;
    }

    pub fn login_message(&self) -> Option<&HttpMessage> {
        self.login.as_ref()
    }

    pub fn logout_message(&self) -> Option<&HttpMessage> {
        self.logout.as_ref()
    }

    pub fn set_logged_in_indicator(&mut self, pattern: &str) -> Result<(), AuthError> {
        self.indicators.set_logged_in(pattern)
    }

    pub fn set_logged_out_indicator(&mut self, pattern: &str) -> Result<(), AuthError> {
        self.indicators.set_logged_out(pattern)
    }

    pub fn clear_logged_in_indicator(&mut self) {
        self.indicators.clear_logged_in();
    }

    pub fn clear_logged_out_indicator(&mut self) {
        self.indicators.clear_logged_out();
    }

    pub fn indicators(&self) -> &AuthIndicators {
        &self.indicators
    }

    pub fn set_reauthenticate(&mut self, reauthenticate: bool) {
        self.reauthenticate = reauthenticate;
    }

    pub fn reauthenticate(&self) -> bool {
        self.reauthenticate
    }

    /// A login to replay and some way to tell whether it is needed
    pub fn is_fully_configured(&self) -> bool {
        self.login.is_some() && self.indicators.is_configured()
    }

    /// See [`AuthIndicators::evaluate`].
    pub fn is_logged_in(&self, msg: &HttpMessage) -> Option<bool> {
        self.indicators.evaluate(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, Status};

    fn with_body(body: &str) -> HttpMessage {
        let mut msg = HttpMessage::get("http://example.com/");
        msg.set_response(
            HttpResponse::builder()
                .status(Status::OK)
                .body(body.as_bytes().to_vec())
                .build(),
        );
        msg
    }

    #[test]
    fn test_indicator_logic() {
        let mut indicators = AuthIndicators::new();
        assert_eq!(indicators.evaluate(&with_body("anything")), None);

        indicators.set_logged_in(r"Welcome, \w+").unwrap();
        assert_eq!(indicators.evaluate(&with_body("Welcome, alice")), Some(true));
        assert_eq!(indicators.evaluate(&with_body("Sign in")), Some(false));

        indicators.set_logged_out("Sign in").unwrap();
        assert_eq!(indicators.evaluate(&with_body("Sign in")), Some(false));
        assert_eq!(indicators.evaluate(&with_body("Dashboard")), Some(true));

        indicators.clear_logged_in();
        assert_eq!(indicators.logged_out(), Some("Sign in"));
        assert_eq!(indicators.evaluate(&with_body("Dashboard")), Some(true));
    }

    #[test]
    fn test_indicators_ignore_headers() {
        let mut indicators = AuthIndicators::new();
        indicators.set_logged_in("Welcome").unwrap();

        let mut msg = HttpMessage::get("http://example.com/");
        msg.set_response(
            HttpResponse::builder()
                .status(Status::OK)
                .header("X-Banner", "Welcome")
                .body(b"Sign in".to_vec())
                .build(),
        );
        assert_eq!(indicators.evaluate(&msg), Some(false));
    }

    #[test]
    fn test_setting_indicator_replaces_previous() {
        let mut ctx = AuthenticationContext::new("app", Scope::new());
        ctx.set_logged_out_indicator("first").unwrap();
        ctx.set_logged_out_indicator("second").unwrap();
        assert_eq!(ctx.indicators().logged_out(), Some("second"));
        assert!(ctx.set_logged_in_indicator("(unclosed").is_err());
    }

    #[test]
    fn test_fully_configured() {
        let mut ctx = AuthenticationContext::new("app", Scope::with_prefix("http://example.com/"));
        assert!(!ctx.is_fully_configured());

        ctx.set_login_message(&with_body("ignored"));
        assert!(ctx.login_message().unwrap().response().is_none());
        assert!(!ctx.is_fully_configured());

        ctx.set_logged_in_indicator("Logout").unwrap();
        assert!(ctx.is_fully_configured());
        assert!(ctx.contains("http://example.com/app"));

        ctx.clear_login_message();
        assert!(!ctx.is_fully_configured());
    }
}
