//! Blocking client for tools and tests.

use crate::connection::{Connection, ConnectionId};
use crate::error::ProtocolError;
use crate::protocol::Message;
use crate::selector::{Mode, Selector, Timeout};
use crate::socket::Socket;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const CLIENT_INBOUND_LIMIT: usize = 2 << 20;
const SEND_STALL: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Synchronous connection to a host.
#[derive(Debug)]
pub struct Client {
    conn: Connection,
    selector: Selector,
    pending: VecDeque<Message>,
    closed: bool,
}

impl Client {
    /// Connect to `addr`, giving up after ten seconds.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Self::connect_timeout(addr, CONNECT_TIMEOUT)
    }

    /// Connect to `addr` with an upper bound on the handshake time.
    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let mut socket = Socket::new();
        socket.connect_timeout(addr, timeout)?;
        let mut selector = Selector::new(1)?;
        selector.add(&mut socket)?;
        Ok(Self {
            conn: Connection::new(ConnectionId(0), socket, CLIENT_INBOUND_LIMIT, ()),
            selector,
            pending: VecDeque::new(),
            closed: false,
        })
    }

    /// Local address of the connection.
    pub fn local_addr(&mut self) -> io::Result<SocketAddr> {
        self.conn.socket_mut().local_addr()
    }

    /// Encode and send `msg`, blocking until the OS has taken every byte.
    pub fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.conn.queue(msg)?;
        self.flush()
    }

    /// Send raw bytes, bypassing the encoder.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.conn.queue_bytes(bytes);
        self.flush()
    }

    fn flush(&mut self) -> Result<(), ProtocolError> {
        let id = self.conn.socket_id();
        loop {
            self.conn.flush()?;
            if !self.conn.has_pending_output() {
                return Ok(());
            }
            self.selector.clear(id, Mode::Write);
            if self
                .selector
                .select(Mode::Write, Timeout::After(SEND_STALL))?
                == 0
            {
                return Err(io::Error::from(io::ErrorKind::TimedOut).into());
            }
        }
    }

    /// Next message from the host, waiting at most `timeout`.
    ///
    /// `Ok(None)` on timeout. Once the host has closed the connection and
    /// every buffered message was returned, fails with `UnexpectedEof`.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let id = self.conn.socket_id();

        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(Some(msg));
            }
            if self.closed {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }

            let ingress = self.conn.fill()?;
            if ingress.closed {
                self.closed = true;
            }
            self.decode_pending()?;
            if !self.pending.is_empty() || self.closed {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if ingress.drained {
                self.selector.clear(id, Mode::Read);
                self.selector
                    .select(Mode::Read, Timeout::After(deadline - now))?;
            }
        }
    }

    fn decode_pending(&mut self) -> Result<(), ProtocolError> {
        let parts = self.conn.parts();
        while let Some((msg, used)) = Message::decode(parts.inbound.unread())?.complete() {
            parts.inbound.consume(used);
            self.pending.push_back(msg);
        }
        parts.inbound.compact();
        Ok(())
    }

    /// Whether the host has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connection.
    pub fn close(&mut self) {
        let _ = self.selector.remove(self.conn.socket_mut());
        self.conn.close();
        self.closed = true;
    }
}
