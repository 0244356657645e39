//! Stream socket with an explicit lifecycle.
//!
//! `Unbound → Bound → Listening` on the server, `Unbound → Connected` on the
//! client, and every accepted peer starts `Connected`. All sockets with an OS
//! handle are non-blocking; readiness comes from the [`Selector`].
//!
//! [`Selector`]: crate::selector::Selector

use mio::net::{TcpListener, TcpStream};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique socket identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock{}", self.0)
    }
}

/// Lifecycle position of a [`Socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No OS handle yet.
    Unbound,
    /// Bound to a local address.
    Bound,
    /// Accepting peers.
    Listening,
    /// Connected stream.
    Connected,
    /// Handle released.
    Closed,
}

#[derive(Debug)]
enum Handle {
    None,
    Listener(TcpListener),
    Stream(TcpStream),
}

/// Thin non-buffering TCP socket.
#[derive(Debug)]
pub struct Socket {
    id: SocketId,
    state: SocketState,
    handle: Handle,
    backlog: Option<u32>,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_state(op: &str, state: SocketState) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot {op} a socket in state {state:?}"),
    )
}

impl Socket {
    /// Fresh unbound socket.
    pub fn new() -> Self {
        Self {
            id: SocketId::next(),
            state: SocketState::Unbound,
            handle: Handle::None,
            backlog: None,
        }
    }

    fn from_stream(stream: TcpStream) -> Self {
        Self {
            id: SocketId::next(),
            state: SocketState::Connected,
            handle: Handle::Stream(stream),
            backlog: None,
        }
    }

    /// Identity used by the selector.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Backlog recorded by [`Socket::listen`].
    pub fn backlog(&self) -> Option<u32> {
        self.backlog
    }

    /// Bind to `addr`. Port 0 picks an ephemeral port.
    ///
    /// The OS listen queue is opened here with the platform backlog.
    pub fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        if self.state != SocketState::Unbound {
            return Err(wrong_state("bind", self.state));
        }
        let listener = TcpListener::bind(addr)?;
        debug!(socket = %self.id, addr = %listener.local_addr()?, "bound");
        self.handle = Handle::Listener(listener);
        self.state = SocketState::Bound;
        Ok(())
    }

    /// Start accepting peers.
    pub fn listen(&mut self, backlog: u32) -> io::Result<()> {
        if self.state != SocketState::Bound {
            return Err(wrong_state("listen on", self.state));
        }
        self.backlog = Some(backlog);
        self.state = SocketState::Listening;
        Ok(())
    }

    /// Accept one pending peer.
    ///
    /// Returns `WouldBlock` when no peer is waiting.
    pub fn accept(&mut self) -> io::Result<(Socket, SocketAddr)> {
        match (&self.handle, self.state) {
            (Handle::Listener(listener), SocketState::Listening) => {
                let (stream, peer) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok((Socket::from_stream(stream), peer))
            }
            _ => Err(wrong_state("accept on", self.state)),
        }
    }

    /// Connect to `addr`, blocking until the handshake completes.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.connect_with(addr, None)
    }

    /// Connect with an upper bound on the handshake time.
    pub fn connect_timeout(&mut self, addr: SocketAddr, timeout: Duration) -> io::Result<()> {
        self.connect_with(addr, Some(timeout))
    }

    fn connect_with(&mut self, addr: SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
        if self.state != SocketState::Unbound {
            return Err(wrong_state("connect", self.state));
        }
        let stream = match timeout {
            Some(timeout) => std::net::TcpStream::connect_timeout(&addr, timeout)?,
            None => std::net::TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.handle = Handle::Stream(TcpStream::from_std(stream));
        self.state = SocketState::Connected;
        debug!(socket = %self.id, %addr, "connected");
        Ok(())
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.handle {
            Handle::Stream(stream) => Ok(stream),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Send as much of `bytes` as the OS takes right now.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.stream()?.write(bytes)
    }

    /// Receive up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    pub fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    /// Half-close: no more sends, receiving continues.
    pub fn shutdown(&mut self) -> io::Result<()> {
        match self.stream()?.shutdown(Shutdown::Write) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Release the OS handle. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == SocketState::Closed {
            return;
        }
        if let Handle::Stream(stream) = &self.handle {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.handle = Handle::None;
        self.state = SocketState::Closed;
        debug!(socket = %self.id, "closed");
    }

    /// Whether the socket still owns an OS handle.
    pub fn is_open(&self) -> bool {
        !matches!(self.handle, Handle::None)
    }

    /// Local address of the OS handle.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.handle {
            Handle::Listener(listener) => listener.local_addr(),
            Handle::Stream(stream) => stream.local_addr(),
            Handle::None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.handle {
            Handle::Stream(stream) => stream.peer_addr(),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        match &mut self.handle {
            Handle::Listener(listener) => Some(listener),
            Handle::Stream(stream) => Some(stream),
            Handle::None => None,
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.receive(buf)
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::thread;
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    fn listening() -> (Socket, SocketAddr) {
        let mut server = Socket::new();
        server.bind(loopback()).unwrap();
        server.listen(8).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    fn accept_within(server: &mut Socket, limit: Duration) -> Socket {
        let start = Instant::now();
        loop {
            match server.accept() {
                Ok((peer, _)) => return peer,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < limit, "no peer arrived");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        }
    }

    #[test]
    fn lifecycle_follows_server_path() {
        let (server, _) = listening();
        assert_eq!(server.state(), SocketState::Listening);
        assert_eq!(server.backlog(), Some(8));
    }

    #[test]
    fn listen_requires_bind() {
        let mut socket = Socket::new();
        let err = socket.listen(4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(socket.state(), SocketState::Unbound);
    }

    #[test]
    fn accept_without_peer_would_block() {
        let (mut server, _) = listening();
        let err = server.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn bytes_flow_between_connected_sockets() {
        let (mut server, addr) = listening();
        let mut client = Socket::new();
        client.connect(addr).unwrap();
        assert_eq!(client.state(), SocketState::Connected);

        let mut peer = accept_within(&mut server, Duration::from_secs(5));
        assert_eq!(peer.state(), SocketState::Connected);
        assert_ne!(peer.id(), client.id());

        assert_eq!(client.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        let start = Instant::now();
        let received = loop {
            match peer.receive(&mut buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < Duration::from_secs(5));
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("receive failed: {err}"),
            }
        };
        assert_eq!(&buf[..received], b"ping");
    }

    #[test]
    fn bounded_connect_reaches_listener() {
        let (mut server, addr) = listening();
        let mut client = Socket::new();
        client.connect_timeout(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(client.state(), SocketState::Connected);
        accept_within(&mut server, Duration::from_secs(5));

        let err = client
            .connect_timeout(addr, Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut server, _) = listening();
        server.close();
        server.close();
        assert_eq!(server.state(), SocketState::Closed);
        assert!(!server.is_open());
        assert_eq!(
            server.send(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
