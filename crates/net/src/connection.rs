//! Per-peer state: a socket, its inbound and outbound byte queues, and where
//! the peer is in the session lifecycle.

use crate::buffer::{Ingress, WireBuffer};
use crate::dispatch::{self, MessageHandler};
use crate::error::{EncodeError, ProtocolError};
use crate::protocol::Message;
use crate::socket::{Socket, SocketId};
use std::fmt;
use std::io;
use tracing::debug;

/// Server-assigned connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Session lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, nothing sent yet.
    Accepted,
    /// ServerInfo sent, waiting for Login.
    Authenticating,
    /// Logged in; takes part in world synchronization.
    Ready,
    /// Terminal.
    Disconnected,
}

/// Disjoint mutable views into a [`Connection`], so a handler can update
/// state and queue replies while the inbound buffer is being drained.
#[derive(Debug)]
pub struct Parts<'a, S> {
    /// Connection handle.
    pub id: ConnectionId,
    /// Received, unparsed bytes.
    pub inbound: &'a mut WireBuffer,
    /// Encoded, unsent bytes.
    pub outbound: &'a mut WireBuffer,
    /// Lifecycle state.
    pub state: &'a mut ConnectionState,
    /// Caller-defined session data.
    pub session: &'a mut S,
}

/// One peer. `S` carries whatever the owner tracks per session.
#[derive(Debug)]
pub struct Connection<S = ()> {
    id: ConnectionId,
    socket: Socket,
    inbound: WireBuffer,
    outbound: WireBuffer,
    state: ConnectionState,
    inbound_limit: usize,
    session: S,
}

impl<S> Connection<S> {
    /// Wrap a connected socket. At most `inbound_limit` unparsed bytes are
    /// buffered before the peer is treated as abusive.
    pub fn new(id: ConnectionId, socket: Socket, inbound_limit: usize, session: S) -> Self {
        Self {
            id,
            socket,
            inbound: WireBuffer::new(),
            outbound: WireBuffer::new(),
            state: ConnectionState::Accepted,
            inbound_limit,
            session,
        }
    }

    /// Connection handle.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identity of the underlying socket.
    pub fn socket_id(&self) -> SocketId {
        self.socket.id()
    }

    /// Underlying socket.
    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `state`.
    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(conn = %self.id, from = ?self.state, to = ?state, "state change");
            self.state = state;
        }
    }

    /// Per-session data.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Per-session data, mutably.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Unparsed received bytes.
    pub fn inbound(&self) -> &WireBuffer {
        &self.inbound
    }

    /// Encode `msg` onto the outbound queue.
    pub fn queue(&mut self, msg: &Message) -> Result<(), EncodeError> {
        msg.encode(self.outbound.tail())
    }

    /// Append already-encoded frames to the outbound queue.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Whether encoded bytes are waiting to be sent.
    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Pull whatever the socket has into the inbound buffer.
    pub fn fill(&mut self) -> Result<Ingress, ProtocolError> {
        if self.inbound.len() >= self.inbound_limit {
            return Err(ProtocolError::InboundOverflow {
                limit: self.inbound_limit,
            });
        }
        Ok(self.inbound.ingress(&mut self.socket, self.inbound_limit)?)
    }

    /// Send as much queued output as the socket takes.
    pub fn flush(&mut self) -> io::Result<usize> {
        self.outbound.egress(&mut self.socket)
    }

    /// Dispatch every complete frame received so far to `handler`.
    pub fn process<H: MessageHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<usize, ProtocolError> {
        dispatch::drain(&mut self.inbound, self.id, handler)
    }

    /// Split into disjoint borrows.
    pub fn parts(&mut self) -> Parts<'_, S> {
        Parts {
            id: self.id,
            inbound: &mut self.inbound,
            outbound: &mut self.outbound,
            state: &mut self.state,
            session: &mut self.session,
        }
    }

    /// Close the socket and enter `Disconnected`. Buffered bytes are dropped.
    pub fn close(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        self.socket.close();
        self.inbound.clear();
        self.outbound.clear();
    }

    /// Write pending output, half-close, then close.
    pub fn close_gracefully(&mut self) {
        if let Err(err) = self.flush() {
            debug!(conn = %self.id, %err, "final flush failed");
        }
        let _ = self.socket.shutdown();
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Chat, Ready};
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected_pair() -> (Socket, Socket) {
        let mut server = Socket::new();
        server
            .bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .unwrap();
        server.listen(4).unwrap();
        let mut client = Socket::new();
        client.connect(server.local_addr().unwrap()).unwrap();
        let start = Instant::now();
        loop {
            match server.accept() {
                Ok((peer, _)) => return (client, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    assert!(start.elapsed() < Duration::from_secs(5));
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        }
    }

    fn fill_until(conn: &mut Connection, bytes: usize) {
        let start = Instant::now();
        while conn.inbound().len() < bytes {
            conn.fill().unwrap();
            assert!(start.elapsed() < Duration::from_secs(5), "bytes never arrived");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[derive(Default)]
    struct Seen(Vec<Message>);

    impl MessageHandler for Seen {
        fn on_chat(&mut self, _conn: ConnectionId, msg: Chat) -> Result<(), ProtocolError> {
            self.0.push(msg.into());
            Ok(())
        }

        fn on_ready(&mut self, _conn: ConnectionId, msg: Ready) -> Result<(), ProtocolError> {
            self.0.push(msg.into());
            Ok(())
        }
    }

    #[test]
    fn queued_messages_reach_the_peer_in_order() {
        let (client, peer) = connected_pair();
        let mut sender = Connection::new(ConnectionId(1), client, 1024, ());
        let mut receiver = Connection::new(ConnectionId(2), peer, 1024, ());

        sender.queue(&Chat::new("", "hi").into()).unwrap();
        sender.queue(&Ready.into()).unwrap();
        assert!(sender.has_pending_output());
        let sent = sender.flush().unwrap();
        assert!(!sender.has_pending_output());

        fill_until(&mut receiver, sent);
        let mut seen = Seen::default();
        assert_eq!(receiver.process(&mut seen).unwrap(), sent);
        assert_eq!(seen.0.len(), 2);
        assert!(matches!(seen.0[0], Message::Chat(_)));
        assert!(matches!(seen.0[1], Message::Ready(_)));
    }

    #[test]
    fn invalid_message_queues_nothing() {
        let (client, _peer) = connected_pair();
        let mut conn = Connection::new(ConnectionId(1), client, 1024, ());
        assert!(conn.queue(&Chat::new("", "").into()).is_err());
        assert!(!conn.has_pending_output());
    }

    #[test]
    fn full_inbound_buffer_is_an_overflow() {
        let (mut client, peer) = connected_pair();
        let mut conn = Connection::new(ConnectionId(1), peer, 8, ());
        // A login frame that declares more bytes than will ever fit.
        client.send(&[0x02, 20, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h']).unwrap();
        fill_until(&mut conn, 8);
        assert_eq!(conn.process(&mut Seen::default()).unwrap(), 0);
        assert!(matches!(
            conn.fill(),
            Err(ProtocolError::InboundOverflow { limit: 8 })
        ));
    }

    #[test]
    fn close_is_terminal() {
        let (client, _peer) = connected_pair();
        let mut conn = Connection::new(ConnectionId(4), client, 64, 0u8);
        *conn.session_mut() = 3;
        conn.set_state(ConnectionState::Ready);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.flush().is_ok());
        assert_eq!(*conn.session(), 3);
    }
}
