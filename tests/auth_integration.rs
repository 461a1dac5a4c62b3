//! Re-authentication against a loopback application

mod common;

use common::{ok, redirect, respond, Reply, Seen, TestServer};
use httpsend::auth::{
    AuthContextMonitor, AuthIndicators, AuthenticationContext, FormIdentity, Identity,
    ManualIdentity,
};
use httpsend::http::{HttpRequest, Method};
use httpsend::scope::Scope;
use httpsend::{HttpMessage, HttpSender, Initiator, SenderConfig, TransportContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

/// `/login` hands out a session, `/account` wants it.
fn app(seen: &Seen) -> Reply {
    match seen.path() {
        "/login" => respond(
            "200 OK",
            &[("Set-Cookie", "sid=fresh; Path=/")],
            "Welcome back",
        ),
        _ if seen.cookie().contains("sid=fresh") => ok("Account of alice"),
        _ => ok("Sign in to continue"),
    }
}

fn login_form(server: &TestServer) -> HttpMessage {
    let body = "user=alice&pass=secret";
    let mut request = HttpRequest::builder()
        .method(Method::Post)
        .uri(server.url("/login"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body.as_bytes().to_vec())
        .build();
    request.set_content_length(body.len());
    HttpMessage::new(request)
}

fn sender() -> HttpSender {
    let ctx = TransportContext::new(SenderConfig::default()).unwrap();
    HttpSender::new(ctx, Initiator::ActiveScanner)
}

#[test]
fn test_identity_reauthenticates_once() {
    let server = TestServer::start(app);
    let sender = sender();
    let mut indicators = AuthIndicators::new();
    indicators.set_logged_out("Sign in").unwrap();
    let alice = Arc::new(FormIdentity::new("alice", &login_form(&server), indicators));

    let mut msg = HttpMessage::get(server.url("/account"));
    msg.set_requesting_user(Some(alice.clone()));
    sender.send_and_receive(&mut msg, true).unwrap();

    assert_eq!(msg.response_body(), b"Account of alice");
    assert_eq!(server.paths(), vec!["/account", "/login", "/account"]);
    assert_eq!(server.requests()[1].method, Method::Post);
    assert_eq!(alice.cookies().get("sid").as_deref(), Some("fresh"));
    // The shared session is untouched
    assert!(sender.context().cookies().is_empty());
}

#[test]
fn test_redirected_post_is_resent_after_login() {
    let server = TestServer::start(|seen| match seen.path() {
        "/login" => respond("200 OK", &[("Set-Cookie", "sid=fresh; Path=/")], "Welcome back"),
        "/transfer" if seen.cookie().contains("sid=fresh") => ok("Transfer done"),
        "/transfer" => redirect("302 Found", "/login-page"),
        _ => ok("Sign in to continue"),
    });
    let sender = sender();
    let mut indicators = AuthIndicators::new();
    indicators.set_logged_out("Sign in").unwrap();
    let alice = Arc::new(FormIdentity::new("alice", &login_form(&server), indicators));

    let body = "amount=10";
    let mut request = HttpRequest::builder()
        .method(Method::Post)
        .uri(server.url("/transfer"))
        .body(body.as_bytes().to_vec())
        .build();
    request.set_content_length(body.len());
    let mut msg = HttpMessage::new(request);
    msg.set_requesting_user(Some(alice));
    sender.send_and_receive(&mut msg, true).unwrap();

    let seen = server.requests();
    let sent: Vec<(Method, &str)> = seen.iter().map(|s| (s.method, s.path())).collect();
    assert_eq!(
        sent,
        vec![
            (Method::Post, "/transfer"),
            (Method::Get, "/login-page"),
            (Method::Post, "/login"),
            (Method::Post, "/transfer"),
        ]
    );
    assert_eq!(seen[3].body, body.as_bytes());
    assert_eq!(msg.request().method(), Method::Post);
    assert_eq!(msg.response_body(), b"Transfer done");
}

#[test]
fn test_failed_login_keeps_logged_out_response() {
    let server = TestServer::start(|seen| match seen.path() {
        "/login" => ok("Sign in failed"),
        _ => ok("Sign in to continue"),
    });
    let sender = sender();
    let mut indicators = AuthIndicators::new();
    indicators.set_logged_out("Sign in").unwrap();
    let alice = Arc::new(FormIdentity::new("alice", &login_form(&server), indicators));

    let mut msg = HttpMessage::get(server.url("/account"));
    msg.set_requesting_user(Some(alice));
    sender.send_and_receive(&mut msg, false).unwrap();

    assert_eq!(msg.response_body(), b"Sign in to continue");
    assert_eq!(server.paths(), vec!["/account", "/login"]);
}

#[test]
fn test_identities_do_not_share_cookies() {
    let server = TestServer::start(|_| ok("hello"));
    let sender = sender();
    let url = Url::parse(&server.url("/")).unwrap();

    let bob = Arc::new(ManualIdentity::new("bob"));
    bob.set_cookie(&url, "sid", "bob-session");
    let carol = Arc::new(ManualIdentity::new("carol"));
    carol.set_cookie(&url, "sid", "carol-session");

    let users: [Arc<dyn Identity>; 2] = [bob, carol];
    for user in users {
        let mut msg = HttpMessage::get(server.url("/"));
        msg.set_requesting_user(Some(user));
        sender.send_and_receive(&mut msg, false).unwrap();
    }

    let seen = server.requests();
    assert_eq!(seen[0].cookie(), "sid=bob-session");
    assert_eq!(seen[1].cookie(), "sid=carol-session");
}

fn monitored(server: &TestServer) -> (HttpSender, Arc<AuthContextMonitor>) {
    let sender = sender();
    let mut context = AuthenticationContext::new("app", Scope::with_prefix(&server.url("/")));
    context.set_login_message(&login_form(server));
    context.set_logged_in_indicator("Account of").unwrap();
    context.set_logged_out_indicator("Sign in").unwrap();
    context.set_reauthenticate(true);

    let monitor = Arc::new(AuthContextMonitor::new());
    monitor.add_context(context);
    sender.context().listeners().add(monitor.clone());
    (sender, monitor)
}

#[test]
fn test_monitor_replays_login_and_resubmits() {
    let server = TestServer::start(app);
    let (sender, _monitor) = monitored(&server);

    let mut msg = HttpMessage::get(server.url("/account"));
    sender.send_and_receive(&mut msg, false).unwrap();

    assert_eq!(msg.response_body(), b"Account of alice");
    assert_eq!(server.paths(), vec!["/account", "/login", "/account"]);
    assert_eq!(sender.context().cookies().get("sid").as_deref(), Some("fresh"));

    // Logged in now, nothing more to replay
    let mut again = HttpMessage::get(server.url("/account"));
    sender.send_and_receive(&mut again, false).unwrap();
    assert_eq!(server.paths().len(), 4);
}

#[test]
fn test_monitor_resubmits_only_once() {
    let logins = Arc::new(AtomicUsize::new(0));
    let counter = logins.clone();
    let server = TestServer::start(move |seen| match seen.path() {
        "/login" => {
            counter.fetch_add(1, Ordering::SeqCst);
            ok("Sign in rejected")
        }
        _ => ok("Sign in to continue"),
    });
    let (sender, _monitor) = monitored(&server);

    let mut msg = HttpMessage::get(server.url("/account"));
    sender.send_and_receive(&mut msg, false).unwrap();

    assert_eq!(logins.load(Ordering::SeqCst), 1);
    assert_eq!(server.paths(), vec!["/account", "/login", "/account"]);
    assert_eq!(msg.response_body(), b"Sign in to continue");
}

#[test]
fn test_monitor_switched_off() {
    let server = TestServer::start(app);
    let (sender, monitor) = monitored(&server);
    monitor.set_reauthenticate(false);

    let mut msg = HttpMessage::get(server.url("/account"));
    sender.send_and_receive(&mut msg, false).unwrap();

    assert_eq!(msg.response_body(), b"Sign in to continue");
    assert_eq!(server.paths(), vec!["/account"]);
}
