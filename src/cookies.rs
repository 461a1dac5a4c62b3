//! Cookie state stores
//!
//! A `CookieJar` holds the cookies one session has been given. The sender
//! keeps one shared jar for ordinary traffic; every simulated user carries
//! its own so that their sessions never mix.

use crate::http::Headers;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use url::Url;

/// A stored cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Set when no `Domain` attribute was given: only the exact host matches
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub expires: Option<SystemTime>,
}

impl Cookie {
    /// Parse a `Set-Cookie` value received from `url`.
    pub fn parse(set_cookie: &str, url: &Url) -> Option<Cookie> {
        let host = url.host_str()?.to_ascii_lowercase();
        let mut parts = set_cookie.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            host_only: true,
            path: default_path(url),
            secure: false,
            expires: None,
        };

        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attribute.trim(), ""),
            };
            if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
                let domain = val.trim_start_matches('.').to_ascii_lowercase();
                // A server may only widen a cookie to a domain it belongs to.
                if host != domain && !host.ends_with(&format!(".{}", domain)) {
                    log::debug!("Rejecting cookie {} for foreign domain {}", name, domain);
                    return None;
                }
                cookie.domain = domain;
                cookie.host_only = false;
            } else if key.eq_ignore_ascii_case("path") && val.starts_with('/') {
                cookie.path = val.to_string();
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if key.eq_ignore_ascii_case("max-age") {
                if let Ok(seconds) = val.parse::<i64>() {
                    cookie.expires = Some(if seconds <= 0 {
                        SystemTime::UNIX_EPOCH
                    } else {
                        SystemTime::now() + Duration::from_secs(seconds as u64)
                    });
                }
            }
        }

        Some(cookie)
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        let path = url.path();
        let path_ok = path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')));

        domain_ok && path_ok && (!self.secure || url.scheme() == "https")
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Thread-safe cookie store
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Cookie>> {
        match self.cookies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store (or replace, or delete) a cookie.
    pub fn insert(&self, cookie: Cookie) {
        let mut cookies = self.lock();
        cookies.retain(|c| !c.same_slot(&cookie));
        if !cookie.is_expired(SystemTime::now()) {
            cookies.push(cookie);
        }
    }

    /// Store every `Set-Cookie` of a response received from `url`.
    pub fn store_response(&self, url: &Url, headers: &Headers) {
        for value in headers.get_all("Set-Cookie") {
            match Cookie::parse(value, url) {
                Some(cookie) => self.insert(cookie),
                None => log::debug!("Ignoring unparsable Set-Cookie: {}", value),
            }
        }
    }

    /// Set a host-only cookie directly, e.g. for a manually supplied session.
    pub fn set(&self, url: &Url, name: &str, value: &str) {
        if let Some(host) = url.host_str() {
            self.insert(Cookie {
                name: name.to_string(),
                value: value.to_string(),
                domain: host.to_ascii_lowercase(),
                host_only: true,
                path: "/".to_string(),
                secure: false,
                expires: None,
            });
        }
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    ///
    /// More specific paths come first.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let now = SystemTime::now();
        let mut cookies = self.lock();
        cookies.retain(|c| !c.is_expired(now));

        let mut matching: Vec<&Cookie> = cookies.iter().filter(|c| c.matches(url)).collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Value of the first cookie with this name
    pub fn get(&self, name: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
