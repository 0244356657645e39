//! Readiness multiplexer over a set of [`Socket`]s.
//!
//! mio reports readiness edges; the selector keeps them as sticky per-socket
//! flags so callers can ask "is this socket ready?" in the usual level
//! sense. A flag stays set until the caller reports that an operation hit
//! `WouldBlock` via [`Selector::clear`].

use crate::socket::{Socket, SocketId};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

const WAKE_TOKEN: Token = Token(0);

/// Which readiness a `select` call waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Readable, or a listener with a pending peer.
    Read,
    /// Writable.
    Write,
}

/// How long `select` may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Report what is ready right now.
    Poll,
    /// Wait until something is ready or the selector is woken.
    Block,
    /// Wait at most this long.
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        if value.is_zero() {
            Timeout::Poll
        } else {
            Timeout::After(value)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    readable: bool,
    writable: bool,
}

impl Flags {
    fn get(self, mode: Mode) -> bool {
        match mode {
            Mode::Read => self.readable,
            Mode::Write => self.writable,
        }
    }
}

/// Watches sockets and reports which are ready for a [`Mode`].
#[derive(Debug)]
pub struct Selector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    watched: HashMap<SocketId, Flags>,
    snapshot: Option<HashSet<SocketId>>,
    woken: bool,
}

fn token_of(id: SocketId) -> Token {
    Token(id.get() as usize)
}

impl Selector {
    /// Selector able to report on at least `capacity` sockets per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            // Room for every watched socket, the listener and the waker.
            events: Events::with_capacity(capacity.max(1) + 2),
            waker,
            watched: HashMap::with_capacity(capacity),
            snapshot: None,
            woken: false,
        })
    }

    /// Handle that interrupts a pending `select` from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Start watching `socket` for both modes.
    ///
    /// Fails with `AlreadyExists` when the socket is already watched and
    /// `InvalidInput` when it has no OS handle.
    pub fn add(&mut self, socket: &mut Socket) -> io::Result<()> {
        let id = socket.id();
        if self.watched.contains_key(&id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{id} is already watched"),
            ));
        }
        let source = socket.source().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{id} has no handle"))
        })?;
        self.poll.registry().register(
            source,
            token_of(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.watched.insert(id, Flags::default());
        trace!(socket = %id, "watching");
        Ok(())
    }

    /// Stop watching `socket`.
    ///
    /// Fails with `NotFound` when the socket was never added.
    pub fn remove(&mut self, socket: &mut Socket) -> io::Result<()> {
        let id = socket.id();
        if self.watched.remove(&id).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{id} is not watched"),
            ));
        }
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.remove(&id);
        }
        // A closed socket has already left the OS poll set.
        if let Some(source) = socket.source() {
            self.poll.registry().deregister(source)?;
        }
        trace!(socket = %id, "unwatched");
        Ok(())
    }

    /// Whether `id` is watched.
    pub fn contains(&self, id: SocketId) -> bool {
        self.watched.contains_key(&id)
    }

    /// Number of watched sockets.
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Wait until at least one watched socket is ready for `mode`, the
    /// selector is woken, or `timeout` runs out. Returns how many sockets are
    /// ready; query them with [`Selector::is_ready`] or [`Selector::ready`].
    pub fn select(&mut self, mode: Mode, timeout: Timeout) -> io::Result<usize> {
        let deadline = match timeout {
            Timeout::After(limit) => Some(Instant::now() + limit),
            _ => None,
        };
        self.woken = false;

        loop {
            let pending = self.watched.values().any(|flags| flags.get(mode));
            let wait = if pending {
                Some(Duration::ZERO)
            } else {
                match (timeout, deadline) {
                    (Timeout::Poll, _) => Some(Duration::ZERO),
                    (Timeout::Block, _) => None,
                    (Timeout::After(_), Some(deadline)) => {
                        Some(deadline.saturating_duration_since(Instant::now()))
                    }
                    (Timeout::After(limit), None) => Some(limit),
                }
            };

            match self.poll.poll(&mut self.events, wait) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.woken = true;
                    continue;
                }
                let id = SocketId::from_raw(event.token().0 as u64);
                let Some(flags) = self.watched.get_mut(&id) else {
                    continue;
                };
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    flags.readable = true;
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    flags.writable = true;
                }
            }

            let ready: HashSet<SocketId> = self
                .watched
                .iter()
                .filter(|(_, flags)| flags.get(mode))
                .map(|(id, _)| *id)
                .collect();

            let expired = match (timeout, deadline) {
                (Timeout::Poll, _) => true,
                (Timeout::After(_), Some(deadline)) => Instant::now() >= deadline,
                _ => false,
            };
            if !ready.is_empty() || self.woken || expired {
                let count = ready.len();
                self.snapshot = Some(ready);
                return Ok(count);
            }
        }
    }

    /// Whether `id` was ready in the last `select` snapshot.
    ///
    /// # Panics
    ///
    /// Panics when called before any `select`.
    pub fn is_ready(&self, id: SocketId) -> bool {
        self.snapshot().contains(&id)
    }

    /// Sockets ready in the last `select` snapshot.
    ///
    /// # Panics
    ///
    /// Panics when called before any `select`.
    pub fn ready(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.snapshot().iter().copied()
    }

    fn snapshot(&self) -> &HashSet<SocketId> {
        match &self.snapshot {
            Some(snapshot) => snapshot,
            None => panic!("Selector queried before the first select()"),
        }
    }

    /// Whether the last `select` returned because of the waker.
    pub fn was_woken(&self) -> bool {
        self.woken
    }

    /// Record that `id` hit `WouldBlock` for `mode`; it is no longer ready
    /// until the OS reports a new edge.
    pub fn clear(&mut self, id: SocketId, mode: Mode) {
        if let Some(flags) = self.watched.get_mut(&id) {
            match mode {
                Mode::Read => flags.readable = false,
                Mode::Write => flags.writable = false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::thread;

    fn listener() -> (Socket, SocketAddr) {
        let mut server = Socket::new();
        server
            .bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .unwrap();
        server.listen(16).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    /// Returns (client side, accepted side) pairs.
    fn pairs(count: usize) -> Vec<(Socket, Socket)> {
        let (mut server, addr) = listener();
        let mut selector = Selector::new(1).unwrap();
        selector.add(&mut server).unwrap();

        let mut out = Vec::new();
        for _ in 0..count {
            let mut client = Socket::new();
            client.connect(addr).unwrap();
            loop {
                selector
                    .select(Mode::Read, Timeout::After(Duration::from_secs(5)))
                    .unwrap();
                assert!(selector.is_ready(server.id()), "no peer arrived");
                match server.accept() {
                    Ok((peer, _)) => {
                        out.push((client, peer));
                        break;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        selector.clear(server.id(), Mode::Read);
                    }
                    Err(err) => panic!("accept failed: {err}"),
                }
            }
        }
        out
    }

    #[test]
    #[should_panic(expected = "before the first select")]
    fn querying_before_select_panics() {
        let selector = Selector::new(4).unwrap();
        let (socket, _) = listener();
        selector.is_ready(socket.id());
    }

    #[test]
    fn add_twice_and_remove_unknown_fail() {
        let mut selector = Selector::new(4).unwrap();
        let (mut socket, _) = listener();
        selector.add(&mut socket).unwrap();
        assert_eq!(
            selector.add(&mut socket).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
        selector.remove(&mut socket).unwrap();
        assert_eq!(
            selector.remove(&mut socket).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert!(selector.is_empty());
    }

    #[test]
    fn unbound_socket_cannot_be_watched() {
        let mut selector = Selector::new(4).unwrap();
        let mut socket = Socket::new();
        assert_eq!(
            selector.add(&mut socket).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn only_the_socket_whose_peer_sent_becomes_readable() {
        let mut pairs = pairs(4);
        let mut selector = Selector::new(pairs.len()).unwrap();
        for (_, accepted) in pairs.iter_mut() {
            selector.add(accepted).unwrap();
        }

        assert_eq!(selector.select(Mode::Read, Timeout::Poll).unwrap(), 0);
        assert_eq!(selector.ready().count(), 0);

        let target = pairs[2].1.id();
        pairs[2].0.send(b"hello").unwrap();

        let count = selector
            .select(Mode::Read, Timeout::After(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(count, 1);
        assert!(selector.is_ready(target));
        for (_, accepted) in &pairs {
            if accepted.id() != target {
                assert!(!selector.is_ready(accepted.id()));
            }
        }
    }

    #[test]
    fn readiness_sticks_until_cleared() {
        let mut pairs = pairs(1);
        let (client, accepted) = &mut pairs[0];
        let mut selector = Selector::new(1).unwrap();
        selector.add(accepted).unwrap();

        client.send(b"abc").unwrap();
        selector
            .select(Mode::Read, Timeout::After(Duration::from_secs(5)))
            .unwrap();
        assert!(selector.is_ready(accepted.id()));

        // No new edge arrives, but the data has not been read yet.
        selector.select(Mode::Read, Timeout::Poll).unwrap();
        assert!(selector.is_ready(accepted.id()));

        let mut buf = [0u8; 8];
        assert_eq!(accepted.receive(&mut buf).unwrap(), 3);
        assert_eq!(
            accepted.receive(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        selector.clear(accepted.id(), Mode::Read);
        selector.select(Mode::Read, Timeout::Poll).unwrap();
        assert!(!selector.is_ready(accepted.id()));
    }

    #[test]
    fn connected_sockets_report_writable() {
        let mut pairs = pairs(1);
        let mut selector = Selector::new(1).unwrap();
        selector.add(&mut pairs[0].1).unwrap();
        let count = selector
            .select(Mode::Write, Timeout::After(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn waker_interrupts_a_blocking_select() {
        let mut selector = Selector::new(1).unwrap();
        let waker = selector.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });
        assert_eq!(selector.select(Mode::Read, Timeout::Block).unwrap(), 0);
        assert!(selector.was_woken());
        handle.join().unwrap();
    }

    #[test]
    fn timed_select_returns_after_deadline() {
        let mut selector = Selector::new(1).unwrap();
        let start = Instant::now();
        assert_eq!(
            selector
                .select(Mode::Read, Timeout::After(Duration::from_millis(30)))
                .unwrap(),
            0
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
