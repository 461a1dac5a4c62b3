//! Integration tests for the HTTP wire layer
//!
//! A raw loopback server writes exact byte sequences; the client side reads
//! them through a real socket session.

use httpsend::http::session::FdSessionOps;
use httpsend::http::{Error, HttpClient, HttpRequest, Method};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Accept one connection, answer each of `requests` reads with the next
/// reply, then hold the socket open for `linger`.
fn scripted(replies: Vec<&'static [u8]>, linger: Duration) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 2048];
        for reply in replies {
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(reply).unwrap();
        }
        thread::sleep(linger);
    });
    (addr, handle)
}

fn request(addr: SocketAddr) -> HttpRequest {
    HttpRequest::builder()
        .method(Method::Get)
        .uri(format!("http://{}/", addr))
        .build()
}

#[test]
fn test_pipelined_bodies_are_not_overread() {
    // Both responses arrive in one write; each body read must stop exactly
    // at its declared length.
    for buffer_size in [1, 3, 4096] {
        let (addr, handle) = scripted(
            vec![b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nfirst!!HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond"],
            Duration::from_millis(0),
        );
        let stream = TcpStream::connect(addr).unwrap();
        let mut client = HttpClient::new(FdSessionOps::new(stream)).with_buffer_size(buffer_size);

        client.send_request(&request(addr), "/").unwrap();
        let first = client.receive_response(Method::Get, false, None).unwrap();
        let second = client.receive_response(Method::Get, false, None).unwrap();

        assert_eq!(first.response.body(), b"first!!", "buffer {}", buffer_size);
        assert_eq!(second.response.body(), b"second", "buffer {}", buffer_size);
        handle.join().unwrap();
    }
}

#[test]
fn test_bare_lf_header_block() {
    let (addr, handle) = scripted(
        vec![b"HTTP/1.1 200 OK\nContent-Type: text/plain\nContent-Length: 4\n\nbody"],
        Duration::from_millis(0),
    );
    let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));

    let response = client.exchange(&request(addr), "/").unwrap();
    assert_eq!(response.status().code(), 200);
    assert_eq!(response.headers().get("content-type"), Some("text/plain"));
    assert_eq!(response.body(), b"body");
    handle.join().unwrap();
}

#[test]
fn test_large_body_in_many_reads() {
    static BODY: std::sync::OnceLock<Vec<u8>> = std::sync::OnceLock::new();
    let body = BODY.get_or_init(|| {
        let mut wire = b"HTTP/1.1 200 OK\r\nContent-Length: 20000\r\n\r\n".to_vec();
        wire.extend(std::iter::repeat(b'x').take(20000));
        wire
    });
    let (addr, handle) = scripted(vec![body.as_slice()], Duration::from_millis(0));
    let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));

    let response = client.exchange(&request(addr), "/").unwrap();
    assert_eq!(response.body().len(), 20000);
    handle.join().unwrap();
}

#[test]
fn test_header_timeout_is_an_error() {
    let (addr, handle) = scripted(vec![b"HTTP/1.1 200 OK\r\n"], Duration::from_millis(500));
    let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
    client.set_timeout(Duration::from_millis(100));

    client.send_request(&request(addr), "/").unwrap();
    let err = client.receive_response(Method::Get, false, None).unwrap_err();
    assert!(matches!(err, Error::Timeout | Error::HeaderRead(_) | Error::Io(_)));
    assert!(err.is_transport());
    handle.join().unwrap();
}

#[test]
fn test_body_timeout_keeps_partial_body() {
    let (addr, handle) = scripted(
        vec![b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial"],
        Duration::from_millis(500),
    );
    let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
    client.set_timeout(Duration::from_millis(100));

    client.send_request(&request(addr), "/").unwrap();
    let received = client.receive_response(Method::Get, false, None).unwrap();
    assert_eq!(received.response.body(), b"partial");
    assert!(!received.reusable);
    handle.join().unwrap();
}

#[test]
fn test_eof_before_header_end() {
    let (addr, handle) = scripted(vec![b"HTTP/1.1 200 OK\r\nContent-"], Duration::from_millis(0));
    let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));

    client.send_request(&request(addr), "/").unwrap();
    handle.join().unwrap();
    let err = client.receive_response(Method::Get, false, None).unwrap_err();
    assert!(matches!(err, Error::HeaderRead(_)));
}
