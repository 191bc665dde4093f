//! Connection pool for info sockets.
//!
//! One pool per node, one FIFO queue per port. The pool lock protects only
//! the queues; all I/O happens on sockets the caller has popped, and every
//! acquire is paired with exactly one release-or-close.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use rustls_pki_types::ServerName;

use crate::config::Timeouts;
use crate::error::Error;
use crate::info;

/// A pooled byte stream, plaintext or TLS. The pool never mixes the two
/// for the same node.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Tcp(s) => s,
            Self::Tls(s) => &s.sock,
        }
    }

    /// Probe liveness without blocking. A pooled socket with unread bytes
    /// is desynchronized and counts as dead.
    fn is_live(&self) -> bool {
        let tcp = self.tcp();

        if tcp.set_nonblocking(true).is_err() {
            return false;
        }
        let mut buf = [0u8; 1];
        let live = match tcp.peek(&mut buf) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        tcp.set_nonblocking(false).is_ok() && live
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// A socket checked out of a pool. Must be handed back through
/// [`Pool::release`] on every path; a socket that saw an I/O error is
/// closed there instead of being pooled again.
pub struct Socket {
    stream: Stream,
    port: u16,
    faulted: bool,
}

impl Socket {
    /// Execute one info command: frame it, send it, read one reply and
    /// strip the command echo.
    pub fn execute(&mut self, command: &str) -> Result<String, Error> {
        match self.try_execute(command) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.faulted = true;
                Err(e)
            }
        }
    }

    fn try_execute(&mut self, command: &str) -> Result<String, Error> {
        self.stream
            .write_all(&info::encode(command))
            .map_err(Error::from_io)?;
        self.stream.flush().map_err(Error::from_io)?;

        let payload = info::decode(&mut self.stream)?;

        Ok(info::strip_echo(command, &payload).to_owned())
    }
}

struct Inner {
    queues: HashMap<u16, VecDeque<Stream>>,
    closed: bool,
}

/// Per-node socket pool, indexed by port.
pub struct Pool {
    host: String,
    tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
    timeouts: Timeouts,
    inner: Mutex<Inner>,
}

impl Pool {
    pub fn new(
        host: impl Into<String>,
        tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            host: host.into(),
            tls,
            timeouts,
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Pop a live pooled socket for the port, or dial a new one.
    pub fn acquire(&self, port: u16) -> Result<Socket, Error> {
        {
            let mut inner = self.inner.lock().expect("pool lock is never poisoned");

            if let Some(queue) = inner.queues.get_mut(&port) {
                while let Some(stream) = queue.pop_front() {
                    if stream.is_live() {
                        return Ok(Socket {
                            stream,
                            port,
                            faulted: false,
                        });
                    }
                    // Dead socket: dropped here, closing it.
                }
            }
        }
        let stream = self.connect(port)?;

        Ok(Socket {
            stream,
            port,
            faulted: false,
        })
    }

    /// Return a socket. Faulted sockets are closed, and once the pool is
    /// drained nothing is pooled again.
    pub fn release(&self, socket: Socket) {
        if socket.faulted {
            return;
        }
        let mut inner = self.inner.lock().expect("pool lock is never poisoned");

        if inner.closed {
            return;
        }
        inner
            .queues
            .entry(socket.port)
            .or_default()
            .push_back(socket.stream);
    }

    /// Drain the pool, closing every idle socket. Idempotent.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().expect("pool lock is never poisoned");

        inner.queues.clear();
        inner.closed = true;
    }

    /// Number of idle sockets pooled for a port.
    pub fn idle(&self, port: u16) -> usize {
        let inner = self.inner.lock().expect("pool lock is never poisoned");

        inner.queues.get(&port).map_or(0, VecDeque::len)
    }

    fn connect(&self, port: u16) -> Result<Stream, Error> {
        let addr = (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::Unreachable(format!("{}:{port}: {e}", self.host)))?
            .next()
            .ok_or_else(|| {
                Error::Unreachable(format!("{}:{port}: no address resolved", self.host))
            })?;

        let stream = TcpStream::connect_timeout(&addr, self.timeouts.connect)
            .map_err(Error::from_io)?;

        stream
            .set_read_timeout(Some(self.timeouts.read))
            .map_err(Error::from_io)?;
        stream.set_nodelay(true).ok();

        match &self.tls {
            None => Ok(Stream::Tcp(stream)),
            Some((config, name)) => {
                let conn = rustls::ClientConnection::new(config.clone(), name.clone())
                    .map_err(|e| Error::Unreachable(format!("TLS setup failed: {e}")))?;

                Ok(Stream::Tls(Box::new(rustls::StreamOwned::new(conn, stream))))
            }
        }
    }
}
