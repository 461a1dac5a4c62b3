//! httpsend - HTTP message transport for an intercepting security proxy
//!
//! This crate provides the outbound side of a web-application security proxy:
//! a blocking HTTP/1.1 sender with pooled direct and proxied connections,
//! redirect following under a safety mode, transparent re-authentication of
//! simulated users, and ordered listener hooks around every exchange.

pub mod auth;
pub mod cookies;
pub mod http;
pub mod listener;
pub mod pool;
pub mod redirect;
pub mod scope;
pub mod sender;
pub mod spider;

pub use http::{Error, HttpMessage, HttpRequest, HttpResponse, Method, Result};
pub use sender::{HttpSender, Initiator, SenderConfig, TransportContext};
