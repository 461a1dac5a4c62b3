//! HTTP client implementation
//!
//! One `HttpClient` drives request/response exchanges over a single session.
//! It owns the connection's reusable body buffer.

use super::chunked;
use super::framing::{read_header, BodyLength, BodyReader, CancelToken};
use super::message::charset_of;
use super::parser::parse_response_head;
use super::{
    HttpBody, HttpRequest, HttpResponse, HttpSession, Method, Result, SessionOps, Status,
    Version,
};

/// A response read off the wire, with what the connection can do next.
#[derive(Debug)]
pub struct ReceivedResponse {
    pub response: HttpResponse,
    /// The body arrived chunked and was decoded in place
    pub dechunked: bool,
    /// The connection can carry another exchange
    pub reusable: bool,
}

/// HTTP client
///
/// Provides methods for sending requests and receiving responses.
pub struct HttpClient<S: SessionOps> {
    session: HttpSession<S>,
    body_reader: BodyReader,
}

impl<S: SessionOps> HttpClient<S> {
    /// Create a new HTTP client with a session
    pub fn new(session: S) -> Self {
        Self::from_session(HttpSession::new(session))
    }

    pub fn from_session(session: HttpSession<S>) -> Self {
        HttpClient {
            session,
            body_reader: BodyReader::new(),
        }
    }

    /// Use a body buffer of the given size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.body_reader = BodyReader::with_buffer_size(size);
        self
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: std::time::Duration) {
        self.session.set_timeout(Some(timeout));
    }

    /// Write a request using the given request-target
    pub fn send_request(&mut self, request: &HttpRequest, target: &str) -> Result<()> {
        let wire = request.to_wire(target);
        self.session.write_all(&wire)
    }

    /// Read the next final response for a request made with `method`.
    ///
    /// Interim `1xx` responses other than `101` are skipped.
    pub fn receive_response(
        &mut self,
        method: Method,
        request_close: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<ReceivedResponse> {
        let head = loop {
            let block = read_header(&mut self.session)?;
            let head = parse_response_head(&block)?;
            if head.status.is_informational() && head.status != Status::SWITCHING_PROTOCOLS {
                log::debug!("Skipping interim response {}", head.status);
                continue;
            }
            break head;
        };

        let status = head.status;
        let headers = head.headers;
        let mut body = HttpBody::new();
        if let Some(ct) = headers.get("Content-Type") {
            body.set_charset(charset_of(ct));
        }

        let no_body = method == Method::Head
            || status.is_informational()
            || status == Status::NO_CONTENT
            || status == Status::NOT_MODIFIED;

        let chunked = headers.has_token("Transfer-Encoding", "chunked");
        let (delimited, truncated) = if no_body {
            (true, false)
        } else if chunked {
            let read = chunked::read_chunked_body(
                &mut self.session,
                &mut self.body_reader,
                &mut body,
                cancel,
            )?;
            (true, read.truncated)
        } else if let Some(length) = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            let read =
                self.body_reader
                    .read_body(&mut self.session, BodyLength::Sized(length), &mut body, cancel);
            (true, read.truncated)
        } else {
            self.body_reader
                .read_body(&mut self.session, BodyLength::UntilClose, &mut body, cancel);
            (false, false)
        };

        let keep_alive = match head.version {
            Version::Http11 => !headers.has_token("Connection", "close"),
            Version::Http10 => headers.has_token("Connection", "keep-alive"),
        };
        let reusable = delimited
            && !truncated
            && keep_alive
            && !request_close
            && status != Status::SWITCHING_PROTOCOLS;

        let response = HttpResponse::builder()
            .version(head.version)
            .status(status)
            .reason(head.reason)
            .headers(headers)
            .body(body)
            .build();

        Ok(ReceivedResponse {
            response,
            dechunked: chunked && !no_body,
            reusable,
        })
    }

    /// Send a request and read its response
    pub fn exchange(&mut self, request: &HttpRequest, target: &str) -> Result<HttpResponse> {
        self.send_request(request, target)?;
        let close = request.headers().has_token("Connection", "close");
        Ok(self.receive_response(request.method(), close, None)?.response)
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Whether an idle connection can no longer be used
    pub fn is_stale(&self) -> bool {
        self.session.is_stale()
    }

    /// Get a reference to the underlying session
    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    /// Get a mutable reference to the underlying session
    pub fn session_mut(&mut self) -> &mut HttpSession<S> {
        &mut self.session
    }

    pub fn into_session(self) -> HttpSession<S> {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::FdSessionOps;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn serve_once(reply: &'static [u8]) -> (std::net::SocketAddr, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(reply).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        (addr, handle)
    }

    #[test]
    fn test_send_request() {
        let (addr, handle) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request = HttpRequest::builder()
            .method(Method::Get)
            .uri(format!("http://{}/", addr))
            .build();
        let response = client.exchange(&request, "/").unwrap();

        let seen = handle.join().unwrap();
        assert!(seen.starts_with("GET / HTTP/1.1\r\n"));
        assert!(seen.contains(&format!("Host: {}", addr)));
        assert_eq!(response.body(), b"OK");
    }

    #[test]
    fn test_receive_response() {
        let (addr, handle) = serve_once(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nHello",
        );

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request = HttpRequest::builder().uri(format!("http://{}/", addr)).build();
        client.send_request(&request, "/").unwrap();
        let received = client.receive_response(Method::Get, false, None).unwrap();

        assert_eq!(received.response.status().code(), 200);
        assert_eq!(received.response.body(), b"Hello");
        assert_eq!(received.response.headers().get("Content-Type"), Some("text/plain"));
        assert!(received.reusable);

        handle.join().unwrap();
    }

    #[test]
    fn test_receive_chunked_response() {
        let (addr, handle) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n0\r\n\r\n",
        );

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request = HttpRequest::builder().uri(format!("http://{}/", addr)).build();
        client.send_request(&request, "/").unwrap();
        let received = client.receive_response(Method::Get, false, None).unwrap();

        assert!(received.dechunked);
        assert!(received.reusable);
        assert_eq!(received.response.body(), b"Hello");

        handle.join().unwrap();
    }

    #[test]
    fn test_until_close_is_not_reusable() {
        let (addr, handle) = serve_once(b"HTTP/1.0 200 OK\r\n\r\nstreamed until close");

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request = HttpRequest::builder().uri(format!("http://{}/", addr)).build();
        client.send_request(&request, "/").unwrap();
        handle.join().unwrap();

        let received = client.receive_response(Method::Get, false, None).unwrap();
        assert_eq!(received.response.body(), b"streamed until close");
        assert!(!received.reusable);
    }

    #[test]
    fn test_head_has_no_body() {
        let (addr, handle) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request = HttpRequest::builder()
            .method(Method::Head)
            .uri(format!("http://{}/", addr))
            .build();
        let response = client.exchange(&request, "/").unwrap();

        assert_eq!(response.content_length(), Some(10));
        assert!(response.body().is_empty());
        handle.join().unwrap();
    }
}
