//! Message definitions for client-server communication.
//!
//! The message set is closed: every kind has a fixed one-byte opcode and a
//! hand-specified big-endian layout (see `codec`).

use blockhost_core::{BlockPos, ChunkPos, EntityId, Facing};
use serde::{Deserialize, Serialize};

/// Longest accepted username (bytes).
pub const MAX_USERNAME_LEN: usize = 24;

/// Longest accepted planet name (bytes).
pub const MAX_PLANET_NAME_LEN: usize = 24;

/// Most distinct class ids a chunk message may carry.
/// Block entries index them with 12 bits.
pub const MAX_CHUNK_CLASS_IDS: usize = 0x0fff;

/// Bits of a chunk block entry holding the class-id index.
pub const BLOCK_CLASS_MASK: u16 = 0x0fff;

/// ServerInfo flag: the server expects a password.
pub const FLAG_PASSWORD: u8 = 1 << 0;

/// Largest frame a client may send: a Chat with channel and sender at 255
/// bytes and a 65535-byte message.
pub const MAX_CLIENT_FRAME: usize = 1 + 2 * (1 + u8::MAX as usize) + 2 + u16::MAX as usize;

/// One-byte message tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Server announces authentication mode.
    ServerInfo = 0x01,
    /// Client credentials.
    Login = 0x02,
    /// Login accepted.
    LoginOk = 0x03,
    /// Server places the client on a planet.
    Beam = 0x04,
    /// Client finished loading.
    Ready = 0x05,
    /// Client asks for chunk contents.
    RequestChunk = 0x06,
    /// Chunk contents.
    Chunk = 0x07,
    /// Client copy of a chunk is current.
    ChunkUnchanged = 0x08,
    /// Entity spawned.
    CreateEntity = 0x09,
    /// Chat line.
    Chat = 0x0a,
    /// Block removed.
    DestroyBlock = 0x0b,
    /// Block placed.
    SetBlock = 0x0c,
    /// Block clicked.
    BlockAction = 0x0d,
    /// Entity attached to another entity's hook.
    AttachEntity = 0x0e,
    /// Entity used.
    Use = 0x0f,
    /// Container opened.
    OpenContainer = 0x10,
}

impl Opcode {
    /// Every opcode in wire order.
    pub const ALL: [Opcode; 16] = [
        Opcode::ServerInfo,
        Opcode::Login,
        Opcode::LoginOk,
        Opcode::Beam,
        Opcode::Ready,
        Opcode::RequestChunk,
        Opcode::Chunk,
        Opcode::ChunkUnchanged,
        Opcode::CreateEntity,
        Opcode::Chat,
        Opcode::DestroyBlock,
        Opcode::SetBlock,
        Opcode::BlockAction,
        Opcode::AttachEntity,
        Opcode::Use,
        Opcode::OpenContainer,
    ];

    /// Look up the kind for a wire byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01..=0x10 => Some(Self::ALL[usize::from(byte) - 1]),
            _ => None,
        }
    }

    /// Wire byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// How the server authenticates logins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AuthMode {
    /// Any well-formed login is accepted.
    #[default]
    Open = 0,
    /// Logins are checked against the account store.
    Key = 1,
}

impl AuthMode {
    /// Map a wire value back to a mode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::Key),
            _ => None,
        }
    }
}

/// Server capabilities, sent right after accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// `FLAG_*` bitmask.
    pub flags: u8,
}

/// Login request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    /// Account name, 1..=24 bytes.
    pub username: String,
    /// Password, 1..=255 bytes.
    pub password: String,
}

impl Login {
    /// Build a login request.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Login accepted; carries the player's entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginOk {
    /// Entity controlled by the client.
    pub entity_id: EntityId,
}

/// Places the client on a planet.
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    /// Planet name, 1..=24 bytes.
    pub planet_name: String,
    /// Position on the planet; finite and non-negative.
    pub position: [f32; 3],
    /// Heading in degrees, below 360.
    pub angle: u16,
    /// Planet size in chunks; every axis at least 1.
    pub planet_size: [u16; 3],
    /// Chunk size in blocks; every axis at least 1.
    pub chunk_size: [u8; 3],
}

/// Client finished loading and wants to enter the world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready;

/// Request for a chunk newer than `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestChunk {
    /// Chunk wanted.
    pub position: ChunkPos,
    /// Modification time of the client's copy (0 if none).
    pub timestamp: u32,
}

/// Chunk contents: a class-id palette plus one entry per block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk position.
    pub position: ChunkPos,
    /// Modification time of this copy.
    pub timestamp: u32,
    /// Distinct class ids referenced by `blocks`.
    pub class_ids: Vec<String>,
    /// Low 12 bits: index into `class_ids`; high 4 bits: flags.
    pub blocks: Vec<u16>,
}

impl Chunk {
    /// Empty chunk message for `position`.
    pub fn new(position: ChunkPos, timestamp: u32) -> Self {
        Self {
            position,
            timestamp,
            ..Self::default()
        }
    }

    fn palette_index(&mut self, class_id: &str) -> Option<u16> {
        if let Some(index) = self.class_ids.iter().position(|id| id == class_id) {
            return Some(index as u16);
        }
        if self.class_ids.len() >= MAX_CHUNK_CLASS_IDS {
            return None;
        }
        self.class_ids.push(class_id.to_owned());
        Some((self.class_ids.len() - 1) as u16)
    }

    /// Append a block, adding its class id to the palette if needed.
    ///
    /// Returns false when the palette is full.
    pub fn push_block(&mut self, class_id: &str, flags: u8) -> bool {
        let Some(index) = self.palette_index(class_id) else {
            return false;
        };
        self.blocks.push(index | (u16::from(flags & 0x0f) << 12));
        true
    }

    /// Replace the class of block `index`, keeping its flags.
    ///
    /// Returns false when `index` is out of range or the palette is full.
    pub fn set_block(&mut self, index: usize, class_id: &str) -> bool {
        if index >= self.blocks.len() {
            return false;
        }
        let Some(class) = self.palette_index(class_id) else {
            return false;
        };
        let entry = &mut self.blocks[index];
        *entry = (*entry & !BLOCK_CLASS_MASK) | class;
        true
    }

    /// Class id of block `index`.
    pub fn block_class(&self, index: usize) -> Option<&str> {
        let entry = *self.blocks.get(index)?;
        self.class_ids
            .get(usize::from(entry & BLOCK_CLASS_MASK))
            .map(String::as_str)
    }

    /// Flags of block `index`.
    pub fn block_flags(&self, index: usize) -> Option<u8> {
        self.blocks.get(index).map(|entry| (entry >> 12) as u8)
    }
}

/// The client's copy of a chunk is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkUnchanged {
    /// Chunk position.
    pub position: ChunkPos,
}

/// Hook attachment of a freshly created entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Hook on the parent.
    pub hook: String,
    /// Parent entity.
    pub parent: EntityId,
}

/// Entity spawned in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateEntity {
    /// Entity id (ignored when sent by a client).
    pub id: EntityId,
    /// Chunk containing the entity.
    pub chunk: ChunkPos,
    /// Offset inside the chunk; finite.
    pub offset: [f32; 3],
    /// Heading in 1/256 turns.
    pub heading: u8,
    /// Entity class.
    pub class_id: String,
    /// Optional parent hook.
    pub parent: Option<Attachment>,
}

/// Chat line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chat {
    /// Channel; may be empty.
    pub channel: String,
    /// Author; filled in by the server.
    pub sender: String,
    /// Text, 1..=65535 bytes.
    pub message: String,
}

impl Chat {
    /// Chat line on `channel` with no sender.
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sender: String::new(),
            message: message.into(),
        }
    }
}

/// Block removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyBlock {
    /// Block position.
    pub position: BlockPos,
}

/// Block placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetBlock {
    /// Block position.
    pub position: BlockPos,
    /// Block class.
    pub class_id: String,
}

/// Block clicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAction {
    /// Block position.
    pub position: BlockPos,
    /// Face that was clicked.
    pub facing: Facing,
    /// Primary (true) or secondary action.
    pub primary: bool,
}

/// Entity attached to another entity's hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachEntity {
    /// Entity being attached.
    pub source: EntityId,
    /// Entity owning the hook.
    pub target: EntityId,
    /// Hook id.
    pub hook_id: String,
}

/// Entity used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    /// Entity used.
    pub entity_id: EntityId,
}

/// Container opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenContainer {
    /// Container id.
    pub container_id: u32,
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Message {
    ServerInfo(ServerInfo),
    Login(Login),
    LoginOk(LoginOk),
    Beam(Beam),
    Ready(Ready),
    RequestChunk(RequestChunk),
    Chunk(Chunk),
    ChunkUnchanged(ChunkUnchanged),
    CreateEntity(CreateEntity),
    Chat(Chat),
    DestroyBlock(DestroyBlock),
    SetBlock(SetBlock),
    BlockAction(BlockAction),
    AttachEntity(AttachEntity),
    Use(Use),
    OpenContainer(OpenContainer),
}

macro_rules! message_kinds {
    ($($kind:ident),* $(,)?) => {
        impl Message {
            /// Wire tag of this message.
            pub fn opcode(&self) -> Opcode {
                match self {
                    $(Message::$kind(_) => Opcode::$kind,)*
                }
            }
        }

        $(
            impl From<$kind> for Message {
                fn from(value: $kind) -> Self {
                    Message::$kind(value)
                }
            }
        )*
    };
}

message_kinds!(
    ServerInfo,
    Login,
    LoginOk,
    Beam,
    Ready,
    RequestChunk,
    Chunk,
    ChunkUnchanged,
    CreateEntity,
    Chat,
    DestroyBlock,
    SetBlock,
    BlockAction,
    AttachEntity,
    Use,
    OpenContainer,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_table_is_dense_and_bijective() {
        for (index, opcode) in Opcode::ALL.iter().enumerate() {
            assert_eq!(usize::from(opcode.as_u8()), index + 1);
            assert_eq!(Opcode::from_u8(opcode.as_u8()), Some(*opcode));
        }
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0x11), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn message_reports_its_opcode() {
        let msg: Message = Use {
            entity_id: EntityId(3),
        }
        .into();
        assert_eq!(msg.opcode(), Opcode::Use);
        assert_eq!(Message::from(Ready).opcode(), Opcode::Ready);
    }

    #[test]
    fn chunk_palette_deduplicates_class_ids() {
        let mut chunk = Chunk::new(ChunkPos::new(1, 2, 3), 9);
        chunk.push_block("base/stone", 0);
        chunk.push_block("base/dirt", 3);
        chunk.push_block("base/stone", 1);

        assert_eq!(chunk.class_ids, vec!["base/stone", "base/dirt"]);
        assert_eq!(chunk.blocks.len(), 3);
        assert_eq!(chunk.block_class(2), Some("base/stone"));
        assert_eq!(chunk.block_flags(1), Some(3));
        assert_eq!(chunk.block_class(3), None);
    }

    #[test]
    fn set_block_keeps_flags() {
        let mut chunk = Chunk::new(ChunkPos::new(0, 0, 0), 1);
        assert!(chunk.push_block("base/stone", 5));
        assert!(chunk.set_block(0, "base/ore"));
        assert_eq!(chunk.block_class(0), Some("base/ore"));
        assert_eq!(chunk.block_flags(0), Some(5));
        assert!(!chunk.set_block(1, "base/ore"));
    }
}
