//! Request execution
//!
//! Runs one logical exchange: listeners before, the transport call on a
//! pooled (or, for upgrades, dedicated) connection, listeners after. When
//! asked to, GET-like requests have their redirects followed here, one
//! connection exchange per hop.

use super::HttpSender;
use crate::cookies::CookieJar;
use crate::http::client::ReceivedResponse;
use crate::http::{
    Error, HttpMessage, HttpRequest, HttpResponse, Result, Status, UpgradedConnection,
};
use crate::pool::{Connection, Target};
use crate::redirect::{is_redirect_status, RedirectionValidator};
use std::time::{Instant, SystemTime};
use url::Url;

/// Result of one connection-level exchange
struct Exchange {
    response: HttpResponse,
    upgraded: Option<UpgradedConnection>,
}

impl HttpSender {
    /// Send `msg` and fill in its response.
    ///
    /// Listeners are notified before the send and after it, even when it
    /// fails. `jar` overrides the cookie session chosen from the message.
    pub(crate) fn execute(
        &self,
        msg: &mut HttpMessage,
        follow_redirects: bool,
        validator: Option<&dyn RedirectionValidator>,
        jar: Option<&CookieJar>,
    ) -> Result<()> {
        let listeners = self.ctx.listeners();
        listeners.notify_request(msg, self.initiator, self);

        let result = self.transmit(msg, follow_redirects, validator, jar);
        if let Err(e) = &result {
            log::debug!(
                "[{}] {} {} failed: {}",
                self.initiator,
                msg.request().method(),
                msg.request().uri(),
                e
            );
        }

        listeners.notify_response(msg, self.initiator, self);
        result
    }

    fn transmit(
        &self,
        msg: &mut HttpMessage,
        follow_redirects: bool,
        validator: Option<&dyn RedirectionValidator>,
        jar: Option<&CookieJar>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(agent) = self.ctx.user_agent() {
            msg.request_mut().headers_mut().set("User-Agent", agent);
        }

        let user = msg.requesting_user().cloned();
        let jar = match (jar, user.as_ref()) {
            (Some(jar), _) => jar,
            (None, Some(user)) => user.cookies(),
            (None, None) => self.ctx.cookies(),
        };

        let sent_at = SystemTime::now();
        let started = Instant::now();
        let first = self.exchange(msg.request_mut(), jar);
        let first = match first {
            Ok(exchange) => exchange,
            Err(e) => {
                msg.set_timing(sent_at, started.elapsed());
                return Err(e);
            }
        };
        msg.set_upgraded(first.upgraded);
        let mut response = first.response;

        if follow_redirects && msg.request().method().is_get_like() {
            response = self.follow_transport_redirects(msg.request(), response, validator, jar)?;
        }

        msg.set_timing(sent_at, started.elapsed());
        msg.set_response(response);
        Ok(())
    }

    /// Follow redirects of a GET-like request, hop by hop.
    ///
    /// The validator vets every hop; the first rejection ends the chain with
    /// the response that asked for it.
    fn follow_transport_redirects(
        &self,
        original: &HttpRequest,
        mut response: HttpResponse,
        validator: Option<&dyn RedirectionValidator>,
        jar: &CookieJar,
    ) -> Result<HttpResponse> {
        let mut current = original.url()?;
        let mut hop = original.clone();

        for _ in 0..self.ctx.max_redirects() {
            if !is_redirect_status(response.status()) {
                return Ok(response);
            }
            let next = match redirect_target(&current, &response) {
                Some(next) => next,
                None => return Ok(response),
            };
            if let Some(validator) = validator {
                if !validator.is_valid(&next) {
                    log::debug!("Not following redirect to {}", next);
                    return Ok(response);
                }
            }
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            log::trace!("Following {} redirect to {}", response.status(), next);
            hop.set_uri(&next);
            hop.headers_mut().remove("Cookie");
            response = self.exchange(&mut hop, jar)?.response;
            current = next;

            if let Some(validator) = validator {
                let mut received = HttpMessage::new(hop.clone());
                received.set_response(response.clone());
                validator.on_message_received(&received);
            }
        }

        if is_redirect_status(response.status()) {
            log::debug!(
                "Gave up on {} after {} redirects",
                original.uri(),
                self.ctx.max_redirects()
            );
        }
        Ok(response)
    }

    /// One request/response on a connection chosen for the request.
    ///
    /// Stored cookies are added to `request`, so the caller sees the headers
    /// that actually went out; `Set-Cookie` answers go back into `jar`.
    fn exchange(&self, request: &mut HttpRequest, jar: &CookieJar) -> Result<Exchange> {
        let url = request.url()?;
        let target = Target::from_url(&url)?;
        if let Some(stored) = jar.cookie_header(&url) {
            let merged = merge_cookies(request.headers().get("Cookie"), &stored);
            request.headers_mut().set("Cookie", merged);
        }

        let exchange = if request.is_upgrade() {
            self.exchange_dedicated(request, &target)?
        } else {
            self.exchange_pooled(request, &target)?
        };

        jar.store_response(&url, exchange.response.headers());
        log::debug!(
            "[{}] {} {} -> {}",
            self.initiator,
            request.method(),
            request.uri(),
            exchange.response.status()
        );
        Ok(exchange)
    }

    fn exchange_pooled(&self, request: &HttpRequest, target: &Target) -> Result<Exchange> {
        let connections = self.ctx.connections();
        let mut lease = connections.acquire(target)?;
        let preemptive = lease
            .proxy_credentials()
            .filter(|c| c.preemptive())
            .map(|c| c.basic_authorization());

        let reused = lease.exchanges() > 0;
        let mut received = match self.send_on(&mut lease, request, preemptive.as_deref()) {
            Ok(received) => received,
            // A kept-alive connection the server closed while idle
            Err(e) if reused && request.method().is_get_like() && is_retryable(&e) => {
                log::debug!("Retrying {} on a fresh connection: {}", request.uri(), e);
                drop(lease);
                lease = connections.acquire(target)?;
                self.send_on(&mut lease, request, preemptive.as_deref())?
            }
            Err(e) => return Err(e),
        };

        if received.response.status() == Status::PROXY_AUTHENTICATION_REQUIRED
            && preemptive.is_none()
        {
            let challenges = received.response.headers().get_all("Proxy-Authenticate");
            let answer = lease
                .proxy_credentials()
                .filter(|c| challenges.iter().any(|ch| c.answers(ch)))
                .map(|c| c.basic_authorization());
            if let Some(auth) = answer {
                log::debug!("Answering proxy challenge for {}", request.uri());
                if !received.reusable {
                    drop(lease);
                    lease = connections.acquire(target)?;
                }
                received = self.send_on(&mut lease, request, Some(&auth))?;
            }
        }

        lease.set_reusable(received.reusable);
        Ok(finish(received, None))
    }

    fn exchange_dedicated(&self, request: &HttpRequest, target: &Target) -> Result<Exchange> {
        let mut conn = self.ctx.connections().open_dedicated(target)?;
        let preemptive = conn
            .proxy_credentials()
            .filter(|c| c.preemptive())
            .map(|c| c.basic_authorization());

        let received = match self.send_on(&mut conn, request, preemptive.as_deref()) {
            Ok(received) => received,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        if received.response.status() == Status::SWITCHING_PROTOCOLS {
            log::debug!("{} upgraded its connection", request.uri());
            let upgraded = UpgradedConnection::new(conn.into_session());
            Ok(finish(received, Some(upgraded)))
        } else {
            conn.close();
            Ok(finish(received, None))
        }
    }

    fn send_on(
        &self,
        conn: &mut Connection,
        request: &HttpRequest,
        proxy_authorization: Option<&str>,
    ) -> Result<ReceivedResponse> {
        let target = conn.request_target(request.uri(), request.origin_form());
        let close = request.headers().has_token("Connection", "close");
        let client = conn.client_mut();

        match proxy_authorization {
            Some(auth) => {
                let mut with_auth = request.clone();
                with_auth.headers_mut().set("Proxy-Authorization", auth);
                client.send_request(&with_auth, &target)?;
            }
            None => client.send_request(request, &target)?,
        }
        let received = client.receive_response(request.method(), close, Some(&self.cancel))?;
        conn.record_exchange();
        Ok(received)
    }
}

/// Materialize a received response: a decoded chunked body is no longer
/// chunked, so the framing headers are rewritten to match.
fn finish(received: ReceivedResponse, upgraded: Option<UpgradedConnection>) -> Exchange {
    let mut response = received.response;
    if received.dechunked {
        let length = response.body().len();
        let headers = response.headers_mut();
        headers.remove("Transfer-Encoding");
        headers.set("Content-Length", length.to_string());
    }
    Exchange { response, upgraded }
}

fn is_retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::HeaderRead(_) | Error::ConnectionClosed | Error::Io(_)
    )
}

/// Absolute target of a redirect response, resolved against `base`.
pub(crate) fn redirect_target(base: &Url, response: &HttpResponse) -> Option<Url> {
    let location = response.headers().get("Location")?.trim();
    if location.is_empty() {
        return None;
    }
    match base.join(location) {
        Ok(mut url) => {
            url.set_fragment(None);
            Some(url)
        }
        Err(e) => {
            log::debug!("Ignoring unusable Location {:?}: {}", location, e);
            None
        }
    }
}

/// Add stored cookies to an explicit `Cookie` header without overriding it.
fn merge_cookies(existing: Option<&str>, stored: &str) -> String {
    let existing = match existing.map(str::trim).filter(|v| !v.is_empty()) {
        Some(existing) => existing,
        None => return stored.to_string(),
    };
    let present: Vec<&str> = existing
        .split(';')
        .filter_map(|pair| pair.split('=').next())
        .map(str::trim)
        .collect();

    let mut merged = existing.to_string();
    for pair in stored.split("; ") {
        let name = pair.split('=').next().unwrap_or_default().trim();
        if !present.contains(&name) {
            merged.push_str("; ");
            merged.push_str(pair);
        }
    }
    merged
}
