//! Opcode dispatch: decode the frame at the front of a buffer and route it to
//! the handler method for its kind.

use crate::buffer::WireBuffer;
use crate::codec::Decoded;
use crate::connection::ConnectionId;
use crate::error::ProtocolError;
use crate::protocol::{
    AttachEntity, Beam, BlockAction, Chat, Chunk, ChunkUnchanged, CreateEntity, DestroyBlock,
    Login, LoginOk, Message, Opcode, OpenContainer, Ready, RequestChunk, ServerInfo, SetBlock,
    Use,
};
use tracing::{debug, trace};

/// Receives decoded messages, one method per kind.
///
/// Every method defaults to logging and ignoring the message, so an
/// implementor only overrides the kinds it understands. Returning an error
/// ends the originating connection.
#[allow(unused_variables)]
pub trait MessageHandler {
    /// Called for every kind the implementor does not override.
    fn unhandled(&mut self, conn: ConnectionId, opcode: Opcode) -> Result<(), ProtocolError> {
        debug!(%conn, ?opcode, "unhandled message");
        Ok(())
    }

    /// `ServerInfo` arrived.
    fn on_server_info(&mut self, conn: ConnectionId, msg: ServerInfo) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::ServerInfo)
    }

    /// `Login` arrived.
    fn on_login(&mut self, conn: ConnectionId, msg: Login) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::Login)
    }

    /// `LoginOk` arrived.
    fn on_login_ok(&mut self, conn: ConnectionId, msg: LoginOk) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::LoginOk)
    }

    /// `Beam` arrived.
    fn on_beam(&mut self, conn: ConnectionId, msg: Beam) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::Beam)
    }

    /// `Ready` arrived.
    fn on_ready(&mut self, conn: ConnectionId, msg: Ready) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::Ready)
    }

    /// `RequestChunk` arrived.
    fn on_request_chunk(
        &mut self,
        conn: ConnectionId,
        msg: RequestChunk,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::RequestChunk)
    }

    /// `Chunk` arrived.
    fn on_chunk(&mut self, conn: ConnectionId, msg: Chunk) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::Chunk)
    }

    /// `ChunkUnchanged` arrived.
    fn on_chunk_unchanged(
        &mut self,
        conn: ConnectionId,
        msg: ChunkUnchanged,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::ChunkUnchanged)
    }

    /// `CreateEntity` arrived.
    fn on_create_entity(
        &mut self,
        conn: ConnectionId,
        msg: CreateEntity,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::CreateEntity)
    }

    /// `Chat` arrived.
    fn on_chat(&mut self, conn: ConnectionId, msg: Chat) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::Chat)
    }

    /// `DestroyBlock` arrived.
    fn on_destroy_block(
        &mut self,
        conn: ConnectionId,
        msg: DestroyBlock,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::DestroyBlock)
    }

    /// `SetBlock` arrived.
    fn on_set_block(&mut self, conn: ConnectionId, msg: SetBlock) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::SetBlock)
    }

    /// `BlockAction` arrived.
    fn on_block_action(
        &mut self,
        conn: ConnectionId,
        msg: BlockAction,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::BlockAction)
    }

    /// `AttachEntity` arrived.
    fn on_attach_entity(
        &mut self,
        conn: ConnectionId,
        msg: AttachEntity,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::AttachEntity)
    }

    /// `Use` arrived.
    fn on_use(&mut self, conn: ConnectionId, msg: Use) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::Use)
    }

    /// `OpenContainer` arrived.
    fn on_open_container(
        &mut self,
        conn: ConnectionId,
        msg: OpenContainer,
    ) -> Result<(), ProtocolError> {
        self.unhandled(conn, Opcode::OpenContainer)
    }
}

/// Hand an already-decoded message to the matching handler method.
pub fn route<H: MessageHandler + ?Sized>(
    handler: &mut H,
    conn: ConnectionId,
    msg: Message,
) -> Result<(), ProtocolError> {
    match msg {
        Message::ServerInfo(m) => handler.on_server_info(conn, m),
        Message::Login(m) => handler.on_login(conn, m),
        Message::LoginOk(m) => handler.on_login_ok(conn, m),
        Message::Beam(m) => handler.on_beam(conn, m),
        Message::Ready(m) => handler.on_ready(conn, m),
        Message::RequestChunk(m) => handler.on_request_chunk(conn, m),
        Message::Chunk(m) => handler.on_chunk(conn, m),
        Message::ChunkUnchanged(m) => handler.on_chunk_unchanged(conn, m),
        Message::CreateEntity(m) => handler.on_create_entity(conn, m),
        Message::Chat(m) => handler.on_chat(conn, m),
        Message::DestroyBlock(m) => handler.on_destroy_block(conn, m),
        Message::SetBlock(m) => handler.on_set_block(conn, m),
        Message::BlockAction(m) => handler.on_block_action(conn, m),
        Message::AttachEntity(m) => handler.on_attach_entity(conn, m),
        Message::Use(m) => handler.on_use(conn, m),
        Message::OpenContainer(m) => handler.on_open_container(conn, m),
    }
}

/// Dispatch the frame at the front of `bytes`.
///
/// Returns the frame length (opcode included) once the handler has run, or 0
/// when the frame is not complete yet. An empty buffer yields 0.
pub fn dispatch<H: MessageHandler + ?Sized>(
    bytes: &[u8],
    conn: ConnectionId,
    handler: &mut H,
) -> Result<usize, ProtocolError> {
    match Message::decode(bytes)? {
        Decoded::Complete { value, consumed } => {
            trace!(%conn, opcode = ?value.opcode(), consumed, "dispatching");
            route(handler, conn, value)?;
            Ok(consumed)
        }
        Decoded::NeedMoreData => Ok(0),
    }
}

/// Dispatch every complete frame in `buffer`, in arrival order, then compact.
///
/// Stops early once `keep_going` reports false, leaving later frames queued.
/// Returns the total number of bytes consumed.
pub fn drain_while<H, F>(
    buffer: &mut WireBuffer,
    conn: ConnectionId,
    handler: &mut H,
    mut keep_going: F,
) -> Result<usize, ProtocolError>
where
    H: MessageHandler + ?Sized,
    F: FnMut(&H) -> bool,
{
    let mut total = 0;
    while !buffer.is_empty() && keep_going(&*handler) {
        let used = dispatch(buffer.unread(), conn, handler)?;
        if used == 0 {
            break;
        }
        buffer.consume(used);
        total += used;
    }
    buffer.compact();
    Ok(total)
}

/// Dispatch every complete frame in `buffer`.
pub fn drain<H: MessageHandler + ?Sized>(
    buffer: &mut WireBuffer,
    conn: ConnectionId,
    handler: &mut H,
) -> Result<usize, ProtocolError> {
    drain_while(buffer, conn, handler, |_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockhost_core::ChunkPos;

    #[derive(Default)]
    struct Recorder {
        chunks: Vec<(ConnectionId, RequestChunk)>,
        chats: Vec<Chat>,
        ignored: Vec<Opcode>,
    }

    impl MessageHandler for Recorder {
        fn unhandled(&mut self, _conn: ConnectionId, opcode: Opcode) -> Result<(), ProtocolError> {
            self.ignored.push(opcode);
            Ok(())
        }

        fn on_request_chunk(
            &mut self,
            conn: ConnectionId,
            msg: RequestChunk,
        ) -> Result<(), ProtocolError> {
            self.chunks.push((conn, msg));
            Ok(())
        }

        fn on_chat(&mut self, _conn: ConnectionId, msg: Chat) -> Result<(), ProtocolError> {
            if msg.message == "boom" {
                return Err(ProtocolError::Violation("chat rejected"));
            }
            self.chats.push(msg);
            Ok(())
        }
    }

    fn request(x: u16, timestamp: u32) -> Vec<u8> {
        Message::from(RequestChunk {
            position: ChunkPos::new(x, 0, 0),
            timestamp,
        })
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn back_to_back_frames_dispatch_in_order() {
        let conn = ConnectionId(7);
        let first = request(1, 10);
        let frame_size = first.len();
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(&first);
        buffer.extend_from_slice(&request(2, 20));

        let mut handler = Recorder::default();
        let consumed = drain(&mut buffer, conn, &mut handler).unwrap();

        assert_eq!(consumed, 2 * frame_size);
        assert!(buffer.is_empty());
        let xs: Vec<_> = handler.chunks.iter().map(|(_, m)| m.position.x).collect();
        assert_eq!(xs, vec![1, 2]);
        assert!(handler.chunks.iter().all(|(c, _)| *c == conn));
    }

    #[test]
    fn partial_frame_is_left_for_later() {
        let bytes = request(3, 0);
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(&bytes[..4]);

        let mut handler = Recorder::default();
        assert_eq!(drain(&mut buffer, ConnectionId(1), &mut handler).unwrap(), 0);
        assert_eq!(buffer.len(), 4);

        buffer.extend_from_slice(&bytes[4..]);
        assert_eq!(
            drain(&mut buffer, ConnectionId(1), &mut handler).unwrap(),
            bytes.len()
        );
        assert_eq!(handler.chunks.len(), 1);
    }

    #[test]
    fn empty_buffer_dispatches_nothing() {
        let mut handler = Recorder::default();
        assert_eq!(dispatch(&[], ConnectionId(1), &mut handler).unwrap(), 0);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let mut handler = Recorder::default();
        let err = dispatch(&[0x7f, 0, 0], ConnectionId(1), &mut handler).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOpcode(0x7f)));
    }

    #[test]
    fn default_methods_report_unhandled_kinds() {
        let mut handler = Recorder::default();
        let bytes = Message::from(Ready).to_bytes().unwrap();
        assert_eq!(dispatch(&bytes, ConnectionId(1), &mut handler).unwrap(), 1);
        assert_eq!(handler.ignored, vec![Opcode::Ready]);
    }

    #[test]
    fn handler_error_stops_the_drain() {
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(&Message::from(Chat::new("", "boom")).to_bytes().unwrap());
        buffer.extend_from_slice(&request(1, 1));

        let mut handler = Recorder::default();
        let err = drain(&mut buffer, ConnectionId(2), &mut handler).unwrap_err();
        assert!(matches!(err, ProtocolError::Violation(_)));
        assert!(handler.chunks.is_empty());
    }

    #[test]
    fn drain_while_can_pause_between_frames() {
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(&request(1, 1));
        buffer.extend_from_slice(&request(2, 2));

        let mut handler = Recorder::default();
        drain_while(&mut buffer, ConnectionId(3), &mut handler, |h| h.chunks.is_empty()).unwrap();
        assert_eq!(handler.chunks.len(), 1);
        assert_eq!(buffer.unread(), request(2, 2).as_slice());
    }
}
