//! Extension points for game logic layered on the session host.

use crate::accounts::AccountStore;
use crate::session::{Outbox, Target};
use blockhost_core::{EntityId, FacilityGuard, LockFacility};
use blockhost_net::{
    AttachEntity, BlockAction, ConnectionId, EncodeError, Message, ProtocolError, Use,
};
use std::net::SocketAddr;
use tracing::debug;

/// What a hook may touch while handling one message.
pub struct HookContext<'a, W> {
    conn: ConnectionId,
    player: Option<EntityId>,
    facility: &'a LockFacility<W, AccountStore>,
    outbox: &'a mut Outbox,
}

impl<'a, W> HookContext<'a, W> {
    pub(crate) fn new(
        conn: ConnectionId,
        player: Option<EntityId>,
        facility: &'a LockFacility<W, AccountStore>,
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            conn,
            player,
            facility,
            outbox,
        }
    }

    /// Connection the message came from.
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// Entity controlled by that connection.
    pub fn player(&self) -> Option<EntityId> {
        self.player
    }

    /// Lock the world. Do not hold the guard's borrow across another call
    /// that locks the world.
    pub fn world(&self) -> FacilityGuard<'_, W> {
        self.facility.world()
    }

    /// Lock the account store.
    pub fn accounts(&self) -> FacilityGuard<'_, AccountStore> {
        self.facility.accounts()
    }

    /// Queue `msg` for the originating connection.
    pub fn reply(&mut self, msg: impl Into<Message>) -> Result<(), EncodeError> {
        self.outbox.push(Target::One(self.conn), &msg.into())
    }

    /// Queue `msg` for another connection.
    pub fn send_to(&mut self, conn: ConnectionId, msg: impl Into<Message>) -> Result<(), EncodeError> {
        self.outbox.push(Target::One(conn), &msg.into())
    }

    /// Queue `msg` for every logged-in connection.
    pub fn broadcast(&mut self, msg: impl Into<Message>) -> Result<(), EncodeError> {
        self.outbox.push(Target::Ready, &msg.into())
    }
}

/// Game logic callbacks. Every method defaults to doing nothing.
///
/// Hooks run on the reactor thread and must not block on anything but the
/// lock facility.
#[allow(unused_variables)]
pub trait SessionHooks<W>: Send {
    /// A peer was accepted.
    fn on_connect(&mut self, conn: ConnectionId, peer: SocketAddr) {}

    /// A peer left; `username` is set when it had logged in.
    fn on_disconnect(&mut self, conn: ConnectionId, username: Option<&str>) {}

    /// A login succeeded and LoginOk is queued.
    fn on_login(
        &mut self,
        ctx: &mut HookContext<'_, W>,
        username: &str,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// A block was clicked.
    fn on_block_action(
        &mut self,
        ctx: &mut HookContext<'_, W>,
        msg: BlockAction,
    ) -> Result<(), ProtocolError> {
        debug!(conn = %ctx.connection(), ?msg.position, "block action ignored");
        Ok(())
    }

    /// An entity was used.
    fn on_use(&mut self, ctx: &mut HookContext<'_, W>, msg: Use) -> Result<(), ProtocolError> {
        debug!(conn = %ctx.connection(), entity = %msg.entity_id, "use ignored");
        Ok(())
    }

    /// An attachment was applied to the world and broadcast.
    fn on_attach_entity(
        &mut self,
        ctx: &mut HookContext<'_, W>,
        msg: &AttachEntity,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl<W> SessionHooks<W> for () {}
