//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! `HttpSession` adds a poll-based read/write timeout on top of a
//! `SessionOps` and exposes it as `std::io::Read`/`Write`, which is what the
//! header framer and body reader consume.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the session
    fn close(&mut self) -> Result<()>;
}

/// Type-erased session used by pooled connections
pub type BoxedSessionOps = Box<dyn SessionOps + Send>;

impl<S: SessionOps + ?Sized> SessionOps for Box<S> {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        (**self).poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Poll a raw descriptor, shared by the plain and TLS session types.
pub(crate) fn poll_fd(
    fd: std::os::fd::RawFd,
    events: PollEvents,
    timeout: Option<Duration>,
) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1); // -1 = infinite

    // SAFETY: pfd is a valid, initialized pollfd and nfds is 1.
    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(result > 0)
}

/// HTTP session wrapping a transport with session operations
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Create a new HTTP session
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read data with timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.read(buf)
    }

    /// Write data with timeout
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.write(buf)
    }

    /// Write the whole buffer
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf = &buf[n..];
        }
        self.session.flush()
    }

    /// Whether an idle connection has become unusable.
    ///
    /// An idle keep-alive connection must have nothing to read; readability
    /// means the peer closed it or sent unsolicited data.
    pub fn is_stale(&self) -> bool {
        match self.session.poll(PollEvents::Read, Some(Duration::ZERO)) {
            Ok(readable) => readable,
            Err(_) => true,
        }
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Get a reference to the underlying session
    pub fn get_ref(&self) -> &S {
        &self.session
    }

    /// Get a mutable reference to the underlying session
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_inner(self) -> S {
        self.session
    }
}

fn into_io_error(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
        Error::ConnectionClosed => io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        other => io::Error::other(other),
    }
}

impl<S: SessionOps> Read for HttpSession<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        HttpSession::read(self, buf).map_err(into_io_error)
    }
}

impl<S: SessionOps> Write for HttpSession<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        HttpSession::write(self, buf).map_err(into_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.flush().map_err(into_io_error)
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

/// Helper to create an HTTP session from a TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<FdSessionOps> {
    HttpSession::new(FdSessionOps::new(stream))
}
