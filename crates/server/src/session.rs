//! Session host: owns the listener, the selector and every connection, and
//! drives accept → authenticate → synchronize → disconnect.
//!
//! The host runs on one thread. Other threads reach it through a
//! [`SessionHandle`], which posts encoded frames and wakes the selector.

use crate::accounts::AccountStore;
use crate::chunks::{self, ChunkJob, ChunkWorker};
use crate::config::HostConfig;
use crate::hooks::{HookContext, SessionHooks};
use crate::world::WorldGate;
use blockhost_core::{EntityId, LockFacility};
use blockhost_net::{
    drain, AttachEntity, AuthMode, Beam, BlockAction, Chat, Chunk, ChunkUnchanged,
    Connection, ConnectionId, ConnectionState, CreateEntity, DestroyBlock, EncodeError, Login,
    LoginOk, Message, MessageHandler, Mode, Opcode, OpenContainer, Parts, ProtocolError, Ready,
    RequestChunk, Selector, ServerInfo, SetBlock, Socket, SocketId, Timeout, Use,
};
use mio::Waker;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Lock facility shared by the host, its workers and the simulation.
pub type SharedFacility<W> = Arc<LockFacility<W, AccountStore>>;

/// Fatal host failures. Per-connection problems never surface here.
#[derive(Debug, Error)]
pub enum HostError {
    /// Listener could not be opened.
    #[error("failed to bind {addr}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// Selector or listener failure.
    #[error("host I/O failure")]
    Io(#[from] io::Error),
    /// Message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The host is no longer running.
    #[error("session host has stopped")]
    Stopped,
}

/// Recipients of an outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One connection.
    One(ConnectionId),
    /// Every logged-in connection.
    Ready,
    /// Every logged-in connection but one.
    ReadyExcept(ConnectionId),
}

/// Frames produced while handling input, delivered once handling finishes.
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<(Target, Vec<u8>)>,
}

impl Outbox {
    pub(crate) fn push(&mut self, target: Target, msg: &Message) -> Result<(), EncodeError> {
        self.frames.push((target, msg.to_bytes()?));
        Ok(())
    }

    fn take(&mut self) -> Vec<(Target, Vec<u8>)> {
        mem::take(&mut self.frames)
    }

    fn append(&mut self, staged: &mut Outbox) {
        self.frames.append(&mut staged.frames);
    }
}

/// Thread-safe access to a running host.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    posted: Sender<(Target, Vec<u8>)>,
    waker: Arc<Waker>,
    keep_running: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Send `msg` to one connection. Dropped silently if it has left.
    pub fn send(&self, conn: ConnectionId, msg: &Message) -> Result<(), HostError> {
        self.post(Target::One(conn), msg)
    }

    /// Send `msg` to every logged-in connection.
    pub fn broadcast(&self, msg: &Message) -> Result<(), HostError> {
        self.post(Target::Ready, msg)
    }

    fn post(&self, target: Target, msg: &Message) -> Result<(), HostError> {
        let frame = msg.to_bytes()?;
        self.posted
            .send((target, frame))
            .map_err(|_| HostError::Stopped)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Ask the host to disconnect everyone and return from `run`.
    pub fn shutdown(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake session host");
        }
    }

    /// Whether the host has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Session {
    username: Option<String>,
    entity: Option<EntityId>,
}

type Peer = Connection<Session>;

/// The server orchestrator.
pub struct SessionHost<W: WorldGate, H: SessionHooks<W> = ()> {
    config: HostConfig,
    facility: SharedFacility<W>,
    hooks: H,
    listener: Socket,
    selector: Selector,
    peers: BTreeMap<ConnectionId, Peer>,
    sockets: HashMap<SocketId, ConnectionId>,
    next_id: u32,
    inbound_limit: usize,
    posted: Receiver<(Target, Vec<u8>)>,
    handle: SessionHandle,
    chunk_worker: Option<ChunkWorker>,
}

impl<W: WorldGate, H: SessionHooks<W>> SessionHost<W, H> {
    /// Open the listener described by `config`.
    pub fn bind(
        config: HostConfig,
        facility: SharedFacility<W>,
        hooks: H,
    ) -> Result<Self, HostError> {
        let addr = config.socket_addr();
        let mut listener = Socket::new();
        listener
            .bind(addr)
            .map_err(|source| HostError::Bind { addr, source })?;
        listener.listen(u32::try_from(config.max_connections).unwrap_or(u32::MAX))?;

        let mut selector = Selector::new(config.max_connections + 1)?;
        selector.add(&mut listener)?;

        let (posted_tx, posted) = mpsc::channel();
        let handle = SessionHandle {
            posted: posted_tx,
            waker: selector.waker(),
            keep_running: Arc::new(AtomicBool::new(true)),
        };

        let chunk_worker = match ChunkWorker::spawn(Arc::clone(&facility), handle.clone()) {
            Ok(worker) => Some(worker),
            Err(err) => {
                warn!(%err, "chunk worker unavailable, generating chunks inline");
                None
            }
        };

        info!(
            addr = %listener.local_addr()?,
            auth = ?config.auth_mode,
            max_connections = config.max_connections,
            "session host listening"
        );

        let inbound_limit = config.inbound_limit();
        Ok(Self {
            config,
            facility,
            hooks,
            listener,
            selector,
            peers: BTreeMap::new(),
            sockets: HashMap::new(),
            next_id: 1,
            inbound_limit,
            posted,
            handle,
            chunk_worker,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle usable from other threads.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Shared lock facility.
    pub fn facility(&self) -> &SharedFacility<W> {
        &self.facility
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Serve until [`SessionHandle::shutdown`] is called.
    pub fn run(&mut self) -> Result<(), HostError> {
        while self.handle.is_running() {
            self.poll_once()?;
        }
        self.close_all();
        Ok(())
    }

    /// Ask the loop to stop.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// One reactor iteration: wait, accept, read and dispatch, deliver, flush.
    #[instrument(skip_all, level = "trace")]
    pub fn poll_once(&mut self) -> Result<(), HostError> {
        self.selector
            .select(Mode::Read, Timeout::After(self.config.select_timeout()))?;
        let ready: Vec<SocketId> = self.selector.ready().collect();

        for socket in ready {
            if socket == self.listener.id() {
                self.accept_pending()?;
            } else if let Some(conn) = self.sockets.get(&socket).copied() {
                self.service(conn);
            }
        }

        let posted: Vec<_> = self.posted.try_iter().collect();
        self.deliver(posted);
        self.flush_all()
    }

    fn accept_pending(&mut self) -> Result<(), HostError> {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => self.admit(socket, addr)?,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.selector.clear(self.listener.id(), Mode::Read);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn admit(&mut self, mut socket: Socket, addr: SocketAddr) -> Result<(), HostError> {
        if self.peers.len() >= self.config.max_connections {
            warn!(%addr, limit = self.config.max_connections, "player limit reached, refusing");
            socket.close();
            return Ok(());
        }

        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let mut peer = Connection::new(
            id,
            socket,
            self.inbound_limit,
            Session::default(),
        );
        if let Err(err) = self.selector.add(peer.socket_mut()) {
            warn!(conn = %id, %err, "could not watch accepted socket");
            peer.close();
            return Ok(());
        }

        peer.queue(
            &ServerInfo {
                auth_mode: self.config.auth_mode,
                flags: self.config.announced_flags(),
            }
            .into(),
        )?;
        peer.set_state(ConnectionState::Authenticating);

        self.sockets.insert(peer.socket_id(), id);
        self.peers.insert(id, peer);
        info!(conn = %id, %addr, "accepted");
        self.hooks.on_connect(id, addr);
        Ok(())
    }

    fn service(&mut self, id: ConnectionId) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        let mut outbox = Outbox::default();
        let outcome = self.read_and_dispatch(&mut peer, &mut outbox);
        self.peers.insert(id, peer);
        self.deliver(outbox.take());

        match outcome {
            Ok(true) => {}
            Ok(false) => self.disconnect(id, "peer closed the connection"),
            Err(err) => self.disconnect(id, err),
        }
    }

    /// Returns false once the peer has closed its side.
    fn read_and_dispatch(
        &mut self,
        peer: &mut Peer,
        outbox: &mut Outbox,
    ) -> Result<bool, ProtocolError> {
        let socket = peer.socket_id();
        loop {
            let ingress = peer.fill()?;
            if ingress.drained {
                self.selector.clear(socket, Mode::Read);
            }

            let Parts {
                id,
                inbound,
                state,
                session,
                ..
            } = peer.parts();
            let mut handler = Dispatcher {
                id,
                state,
                session,
                outbox: &mut *outbox,
                config: &self.config,
                facility: &*self.facility,
                hooks: &mut self.hooks,
                chunk_worker: self.chunk_worker.as_ref(),
                peers: &self.peers,
            };
            drain(inbound, id, &mut handler)?;

            if ingress.closed {
                return Ok(false);
            }
            if ingress.drained {
                return Ok(true);
            }
        }
    }

    fn deliver(&mut self, frames: Vec<(Target, Vec<u8>)>) {
        for (target, frame) in frames {
            match target {
                Target::One(id) => match self.peers.get_mut(&id) {
                    Some(peer) if peer.state() != ConnectionState::Disconnected => {
                        peer.queue_bytes(&frame)
                    }
                    _ => debug!(conn = %id, "dropping frame for departed connection"),
                },
                Target::Ready | Target::ReadyExcept(_) => {
                    let skip = match target {
                        Target::ReadyExcept(id) => Some(id),
                        _ => None,
                    };
                    for (id, peer) in self.peers.iter_mut() {
                        if peer.state() == ConnectionState::Ready && Some(*id) != skip {
                            peer.queue_bytes(&frame);
                        }
                    }
                }
            }
        }
    }

    fn flush_all(&mut self) -> Result<(), HostError> {
        if !self.peers.values().any(|peer| peer.has_pending_output()) {
            return Ok(());
        }
        self.selector.select(Mode::Write, Timeout::Poll)?;

        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            let socket = peer.socket_id();
            if !peer.has_pending_output() || !self.selector.is_ready(socket) {
                continue;
            }
            match peer.flush() {
                Ok(_) if peer.has_pending_output() => self.selector.clear(socket, Mode::Write),
                Ok(_) => {}
                Err(err) => failed.push((*id, err)),
            }
        }
        for (id, err) in failed {
            self.disconnect(id, ProtocolError::Transport(err));
        }
        Ok(())
    }

    fn disconnect(&mut self, id: ConnectionId, reason: impl fmt::Display) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        self.sockets.remove(&peer.socket_id());
        if let Err(err) = self.selector.remove(peer.socket_mut()) {
            debug!(conn = %id, %err, "socket was not watched");
        }

        let username = peer.session_mut().username.take();
        if let Some(entity) = peer.session_mut().entity.take() {
            let removed = self.facility.world().borrow_mut().remove_entity(entity);
            if let Err(err) = removed {
                debug!(conn = %id, %err, "player entity already gone");
            }
        }
        peer.close_gracefully();

        info!(
            conn = %id,
            user = username.as_deref().unwrap_or("-"),
            %reason,
            "disconnected"
        );
        self.hooks.on_disconnect(id, username.as_deref());
    }

    fn close_all(&mut self) {
        let ids: Vec<_> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect(id, "host shutting down");
        }
        if let Err(err) = self.selector.remove(&mut self.listener) {
            debug!(%err, "listener was not watched");
        }
        self.listener.close();
        info!("session host stopped");
    }
}

impl<W: WorldGate, H: SessionHooks<W>> fmt::Debug for SessionHost<W, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHost")
            .field("listener", &self.listener.id())
            .field("peers", &self.peers.len())
            .field("running", &self.handle.is_running())
            .finish_non_exhaustive()
    }
}

/// Per-connection message handler, built fresh for each read.
struct Dispatcher<'a, W, H> {
    id: ConnectionId,
    state: &'a mut ConnectionState,
    session: &'a mut Session,
    outbox: &'a mut Outbox,
    config: &'a HostConfig,
    facility: &'a LockFacility<W, AccountStore>,
    hooks: &'a mut H,
    chunk_worker: Option<&'a ChunkWorker>,
    peers: &'a BTreeMap<ConnectionId, Peer>,
}

impl<W: WorldGate, H: SessionHooks<W>> Dispatcher<'_, W, H> {
    fn require_ready(&self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            _ => Err(ProtocolError::Violation("message before login")),
        }
    }

    fn reply(&mut self, msg: impl Into<Message>) -> Result<(), ProtocolError> {
        Ok(self.outbox.push(Target::One(self.id), &msg.into())?)
    }

    fn broadcast(&mut self, msg: impl Into<Message>) -> Result<(), ProtocolError> {
        Ok(self.outbox.push(Target::Ready, &msg.into())?)
    }

    fn server_only(&self, opcode: Opcode) -> Result<(), ProtocolError> {
        warn!(conn = %self.id, ?opcode, "client sent a server message");
        Err(ProtocolError::Violation("server-to-client message from client"))
    }

    fn authenticate(&self, login: &Login) -> Result<(), ProtocolError> {
        if self.config.auth_mode == AuthMode::Key {
            let accounts = self.facility.accounts();
            let accounts = accounts.borrow();
            if accounts.find_account(&login.username).is_none() {
                return Err(ProtocolError::AuthenticationFailed("unknown user"));
            }
            if !accounts.verify(&login.username, &login.password) {
                return Err(ProtocolError::AuthenticationFailed("wrong password"));
            }
        }
        let taken = self
            .peers
            .values()
            .any(|peer| peer.session().username.as_deref() == Some(login.username.as_str()));
        if taken {
            return Err(ProtocolError::AuthenticationFailed("already logged in"));
        }
        Ok(())
    }
}

impl<W: WorldGate, H: SessionHooks<W>> MessageHandler for Dispatcher<'_, W, H> {
    fn on_login(&mut self, conn: ConnectionId, msg: Login) -> Result<(), ProtocolError> {
        if *self.state != ConnectionState::Authenticating {
            return Err(ProtocolError::Violation("login attempted twice"));
        }
        self.authenticate(&msg)?;

        let (entity, announce) = {
            let world = self.facility.world();
            let mut world = world.borrow_mut();
            let entity = world
                .spawn_player(&self.config.player_class)
                .map_err(|err| {
                    warn!(%conn, %err, "cannot spawn player");
                    ProtocolError::Violation("player could not be spawned")
                })?;
            let announce = world
                .find_entity(entity)
                .map(|record| record.to_message(entity));
            (entity, announce)
        };

        self.session.username = Some(msg.username.clone());
        self.session.entity = Some(entity);
        *self.state = ConnectionState::Ready;
        info!(%conn, user = %msg.username, %entity, "logged in");

        // Nothing reaches the wire unless the login hook accepts.
        let mut staged = Outbox::default();
        staged.push(Target::One(conn), &LoginOk { entity_id: entity }.into())?;
        if let Some(announce) = announce {
            staged.push(Target::ReadyExcept(conn), &announce.into())?;
        }
        let mut ctx = HookContext::new(conn, Some(entity), self.facility, &mut staged);
        self.hooks.on_login(&mut ctx, &msg.username)?;
        self.outbox.append(&mut staged);
        Ok(())
    }

    fn on_ready(&mut self, conn: ConnectionId, _msg: Ready) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let entity = self
            .session
            .entity
            .ok_or(ProtocolError::Violation("no player entity"))?;
        let beam = self.facility.world().borrow().beam(entity).map_err(|err| {
            warn!(%conn, %err, "cannot place player");
            ProtocolError::Violation("player has no placement")
        })?;
        self.reply(beam)
    }

    fn on_chat(&mut self, _conn: ConnectionId, mut msg: Chat) -> Result<(), ProtocolError> {
        self.require_ready()?;
        msg.sender = self.session.username.clone().unwrap_or_default();
        self.broadcast(msg)
    }

    fn on_set_block(&mut self, conn: ConnectionId, msg: SetBlock) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let applied = self
            .facility
            .world()
            .borrow_mut()
            .set_block(msg.position, &msg.class_id);
        match applied {
            Ok(()) => self.broadcast(msg),
            Err(err) => {
                warn!(%conn, %err, "set block refused");
                Ok(())
            }
        }
    }

    fn on_destroy_block(
        &mut self,
        conn: ConnectionId,
        msg: DestroyBlock,
    ) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let applied = self.facility.world().borrow_mut().destroy_block(msg.position);
        match applied {
            Ok(()) => self.broadcast(msg),
            Err(err) => {
                warn!(%conn, %err, "destroy block refused");
                Ok(())
            }
        }
    }

    fn on_create_entity(
        &mut self,
        conn: ConnectionId,
        msg: CreateEntity,
    ) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let created = {
            let world = self.facility.world();
            let mut world = world.borrow_mut();
            world
                .create_entity(&msg.class_id, msg.chunk, msg.offset, msg.heading)
                .and_then(|id| {
                    let Some(attachment) = &msg.parent else {
                        return Ok(id);
                    };
                    match world.attach_entity(id, attachment.parent, &attachment.hook) {
                        Ok(()) => Ok(id),
                        Err(err) => {
                            if let Err(undo) = world.remove_entity(id) {
                                debug!(%conn, %id, %undo, "unattached entity already gone");
                            }
                            Err(err)
                        }
                    }
                })
        };
        match created {
            Ok(id) => self.broadcast(CreateEntity { id, ..msg }),
            Err(err) => {
                warn!(%conn, %err, "create entity refused");
                Ok(())
            }
        }
    }

    fn on_request_chunk(
        &mut self,
        conn: ConnectionId,
        msg: RequestChunk,
    ) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let cached = self
            .facility
            .world()
            .borrow()
            .chunk(msg.position)
            .map(|chunk| chunks::loaded_reply(chunk, msg.timestamp));
        if let Some(reply) = cached {
            return self.reply(reply);
        }

        let job = ChunkJob {
            conn,
            position: msg.position,
            timestamp: msg.timestamp,
        };
        if self.chunk_worker.is_some_and(|worker| worker.submit(job)) {
            debug!(%conn, position = ?msg.position, "chunk queued for generation");
            return Ok(());
        }

        let generated = chunks::chunk_reply(
            &mut *self.facility.world().borrow_mut(),
            msg.position,
            msg.timestamp,
        );
        match generated {
            Ok(reply) => self.reply(reply),
            Err(err) => {
                warn!(%conn, %err, "chunk request refused");
                Ok(())
            }
        }
    }

    fn on_block_action(
        &mut self,
        conn: ConnectionId,
        msg: BlockAction,
    ) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let mut ctx = HookContext::new(conn, self.session.entity, self.facility, &mut *self.outbox);
        self.hooks.on_block_action(&mut ctx, msg)
    }

    fn on_use(&mut self, conn: ConnectionId, msg: Use) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let mut ctx = HookContext::new(conn, self.session.entity, self.facility, &mut *self.outbox);
        self.hooks.on_use(&mut ctx, msg)
    }

    fn on_attach_entity(
        &mut self,
        conn: ConnectionId,
        msg: AttachEntity,
    ) -> Result<(), ProtocolError> {
        self.require_ready()?;
        let attached =
            self.facility
                .world()
                .borrow_mut()
                .attach_entity(msg.source, msg.target, &msg.hook_id);
        if let Err(err) = attached {
            warn!(%conn, %err, "attach refused");
            return Ok(());
        }
        self.outbox.push(Target::Ready, &msg.clone().into())?;
        let mut ctx = HookContext::new(conn, self.session.entity, self.facility, &mut *self.outbox);
        self.hooks.on_attach_entity(&mut ctx, &msg)
    }

    fn on_server_info(&mut self, _conn: ConnectionId, _msg: ServerInfo) -> Result<(), ProtocolError> {
        self.server_only(Opcode::ServerInfo)
    }

    fn on_login_ok(&mut self, _conn: ConnectionId, _msg: LoginOk) -> Result<(), ProtocolError> {
        self.server_only(Opcode::LoginOk)
    }

    fn on_beam(&mut self, _conn: ConnectionId, _msg: Beam) -> Result<(), ProtocolError> {
        self.server_only(Opcode::Beam)
    }

    fn on_chunk(&mut self, _conn: ConnectionId, _msg: Chunk) -> Result<(), ProtocolError> {
        self.server_only(Opcode::Chunk)
    }

    fn on_chunk_unchanged(
        &mut self,
        _conn: ConnectionId,
        _msg: ChunkUnchanged,
    ) -> Result<(), ProtocolError> {
        self.server_only(Opcode::ChunkUnchanged)
    }

    fn on_open_container(
        &mut self,
        _conn: ConnectionId,
        _msg: OpenContainer,
    ) -> Result<(), ProtocolError> {
        self.server_only(Opcode::OpenContainer)
    }
}
