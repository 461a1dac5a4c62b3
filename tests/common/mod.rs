//! Loopback test server shared by the integration tests

#![allow(dead_code)]

use httpsend::http::framing::read_header;
use httpsend::http::parser::parse_request_head;
use httpsend::http::{Headers, Method};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// A request as the server saw it
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Seen {
    pub fn path(&self) -> &str {
        match self.target.find("://") {
            Some(scheme_end) => {
                let rest = &self.target[scheme_end + 3..];
                rest.find('/').map_or("/", |i| &rest[i..])
            }
            None => &self.target,
        }
    }

    pub fn cookie(&self) -> &str {
        self.headers.get("Cookie").unwrap_or_default()
    }
}

/// What a handler wants written back
pub enum Reply {
    /// Write these bytes and keep reading requests
    Bytes(Vec<u8>),
    /// Write these bytes, then hand the raw stream to a closure
    Takeover(Vec<u8>, Box<dyn FnOnce(TcpStream) + Send>),
}

type Handler = dyn Fn(&Seen) -> Reply + Send + Sync;

/// Accepts any number of keep-alive connections, answering each request
/// with the handler and recording what arrived.
pub struct TestServer {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn start(handler: impl Fn(&Seen) -> Reply + Send + Sync + 'static) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::new(handler);

        let (log, count) = (seen.clone(), connections.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                count.fetch_add(1, Ordering::SeqCst);
                let (handler, log) = (handler.clone(), log.clone());
                thread::spawn(move || serve(stream, handler, log));
            }
        });

        TestServer {
            addr,
            seen,
            connections,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().iter().map(|s| s.path().to_string()).collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve(mut stream: TcpStream, handler: Arc<Handler>, log: Arc<Mutex<Vec<Seen>>>) {
    loop {
        let block = match read_header(&mut stream) {
            Ok(block) => block,
            Err(_) => return,
        };
        let head = parse_request_head(&block).unwrap();
        let length = head
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let seen = Seen {
            method: head.method,
            target: head.target,
            headers: head.headers,
            body,
        };
        log.lock().unwrap().push(seen.clone());

        match handler(&seen) {
            Reply::Bytes(bytes) => {
                if stream.write_all(&bytes).is_err() {
                    return;
                }
            }
            Reply::Takeover(bytes, then) => {
                stream.write_all(&bytes).unwrap();
                then(stream);
                return;
            }
        }
    }
}

/// A length-delimited response
pub fn respond(status: &str, headers: &[(&str, &str)], body: &str) -> Reply {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    Reply::Bytes(out.into_bytes())
}

pub fn ok(body: &str) -> Reply {
    respond("200 OK", &[("Content-Type", "text/html")], body)
}

pub fn redirect(status: &str, location: &str) -> Reply {
    respond(status, &[("Location", location)], "")
}
