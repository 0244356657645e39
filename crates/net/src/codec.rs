//! Message encoding and decoding.
//!
//! Frame format: `[opcode: u8][payload]`. There is no length prefix, so a
//! decoder learns a frame is complete only by parsing its payload. Every
//! decode either yields a message and the exact number of bytes it used, asks
//! for more data without consuming anything, or rejects the bytes.
//!
//! Encoding validates before committing: a rejected message leaves the output
//! buffer as it was.

use crate::error::{DecodeError, EncodeError, ProtocolError};
use crate::protocol::{
    Attachment, AttachEntity, AuthMode, Beam, BlockAction, Chat, Chunk, ChunkUnchanged,
    CreateEntity, DestroyBlock, Login, LoginOk, Message, Opcode, OpenContainer, Ready,
    RequestChunk, ServerInfo, SetBlock, Use, BLOCK_CLASS_MASK, MAX_CHUNK_CLASS_IDS,
    MAX_PLANET_NAME_LEN, MAX_USERNAME_LEN,
};
use crate::wire::{Bounds, Reader, Writer};
use blockhost_core::{BlockPos, ChunkPos, EntityId, Facing};

/// Result of a decode attempt that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A value was parsed from the first `consumed` bytes.
    Complete {
        /// Parsed value.
        value: T,
        /// Bytes it occupied.
        consumed: usize,
    },
    /// The bytes form a valid prefix; nothing was consumed.
    NeedMoreData,
}

impl<T> Decoded<T> {
    /// Convert into `Some((value, consumed))`, or `None` when incomplete.
    pub fn complete(self) -> Option<(T, usize)> {
        match self {
            Decoded::Complete { value, consumed } => Some((value, consumed)),
            Decoded::NeedMoreData => None,
        }
    }
}

/// A message kind with a fixed wire layout.
pub trait Payload: Sized + Into<Message> {
    /// Opcode written before the payload.
    const OPCODE: Opcode;

    /// Append the payload. May leave partial output on error; callers roll back.
    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError>;

    /// Parse the payload.
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

/// Append the payload of `value` (no opcode) to `out`.
///
/// On error nothing is appended.
pub fn serialize<P: Payload>(value: &P, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let start = out.len();
    let result = value.write(&mut Writer::new(out));
    if result.is_err() {
        out.truncate(start);
    }
    result
}

/// Parse a payload of kind `P` (no opcode) from the front of `bytes`.
pub fn deserialize<P: Payload>(bytes: &[u8]) -> Result<Decoded<P>, ProtocolError> {
    let mut reader = Reader::new(bytes);
    match P::read(&mut reader) {
        Ok(value) => Ok(Decoded::Complete {
            value,
            consumed: reader.position(),
        }),
        Err(err) => classify(P::OPCODE, err),
    }
}

fn classify<T>(opcode: Opcode, err: DecodeError) -> Result<Decoded<T>, ProtocolError> {
    match err {
        DecodeError::Incomplete => Ok(Decoded::NeedMoreData),
        DecodeError::Malformed { field, reason } => Err(ProtocolError::Malformed {
            opcode,
            field,
            reason,
        }),
    }
}

type DecodeFn = fn(&mut Reader<'_>) -> Result<Message, DecodeError>;

fn decode_as<P: Payload>(r: &mut Reader<'_>) -> Result<Message, DecodeError> {
    P::read(r).map(Into::into)
}

/// Payload decoders indexed by `opcode - 1`.
static DECODERS: [(Opcode, DecodeFn); 16] = [
    (Opcode::ServerInfo, decode_as::<ServerInfo>),
    (Opcode::Login, decode_as::<Login>),
    (Opcode::LoginOk, decode_as::<LoginOk>),
    (Opcode::Beam, decode_as::<Beam>),
    (Opcode::Ready, decode_as::<Ready>),
    (Opcode::RequestChunk, decode_as::<RequestChunk>),
    (Opcode::Chunk, decode_as::<Chunk>),
    (Opcode::ChunkUnchanged, decode_as::<ChunkUnchanged>),
    (Opcode::CreateEntity, decode_as::<CreateEntity>),
    (Opcode::Chat, decode_as::<Chat>),
    (Opcode::DestroyBlock, decode_as::<DestroyBlock>),
    (Opcode::SetBlock, decode_as::<SetBlock>),
    (Opcode::BlockAction, decode_as::<BlockAction>),
    (Opcode::AttachEntity, decode_as::<AttachEntity>),
    (Opcode::Use, decode_as::<Use>),
    (Opcode::OpenContainer, decode_as::<OpenContainer>),
];

/// Decode only the payload of an already-identified kind.
pub fn decode_payload(opcode: Opcode, bytes: &[u8]) -> Result<Decoded<Message>, ProtocolError> {
    let (_, decode) = DECODERS[usize::from(opcode.as_u8()) - 1];
    let mut reader = Reader::new(bytes);
    match decode(&mut reader) {
        Ok(value) => Ok(Decoded::Complete {
            value,
            consumed: reader.position(),
        }),
        Err(err) => classify(opcode, err),
    }
}

impl Message {
    /// Append `[opcode][payload]` to `out`. On error nothing is appended.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        let start = out.len();
        out.push(self.opcode().as_u8());
        let result = {
            let w = &mut Writer::new(out);
            match self {
                Message::ServerInfo(m) => m.write(w),
                Message::Login(m) => m.write(w),
                Message::LoginOk(m) => m.write(w),
                Message::Beam(m) => m.write(w),
                Message::Ready(m) => m.write(w),
                Message::RequestChunk(m) => m.write(w),
                Message::Chunk(m) => m.write(w),
                Message::ChunkUnchanged(m) => m.write(w),
                Message::CreateEntity(m) => m.write(w),
                Message::Chat(m) => m.write(w),
                Message::DestroyBlock(m) => m.write(w),
                Message::SetBlock(m) => m.write(w),
                Message::BlockAction(m) => m.write(w),
                Message::AttachEntity(m) => m.write(w),
                Message::Use(m) => m.write(w),
                Message::OpenContainer(m) => m.write(w),
            }
        };
        if result.is_err() {
            out.truncate(start);
        }
        result
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decode one frame from the front of `bytes`. `consumed` includes the
    /// opcode byte.
    pub fn decode(bytes: &[u8]) -> Result<Decoded<Message>, ProtocolError> {
        let Some(&first) = bytes.first() else {
            return Ok(Decoded::NeedMoreData);
        };
        let opcode = Opcode::from_u8(first).ok_or(ProtocolError::UnknownOpcode(first))?;
        Ok(match decode_payload(opcode, &bytes[1..])? {
            Decoded::Complete { value, consumed } => Decoded::Complete {
                value,
                consumed: consumed + 1,
            },
            Decoded::NeedMoreData => Decoded::NeedMoreData,
        })
    }
}

fn put_chunk_pos(w: &mut Writer<'_>, pos: ChunkPos) {
    w.put_u16(pos.x);
    w.put_u16(pos.y);
    w.put_u16(pos.z);
}

fn chunk_pos(r: &mut Reader<'_>) -> Result<ChunkPos, DecodeError> {
    Ok(ChunkPos::new(r.u16()?, r.u16()?, r.u16()?))
}

fn put_block_pos(w: &mut Writer<'_>, pos: BlockPos) {
    w.put_u32(pos.x);
    w.put_u32(pos.y);
    w.put_u32(pos.z);
}

fn block_pos(r: &mut Reader<'_>) -> Result<BlockPos, DecodeError> {
    Ok(BlockPos::new(r.u32()?, r.u32()?, r.u32()?))
}

fn put_vec3(w: &mut Writer<'_>, field: &'static str, v: [f32; 3]) -> Result<(), EncodeError> {
    v.iter().try_for_each(|c| w.put_f32(field, *c))
}

fn vec3(r: &mut Reader<'_>, field: &'static str) -> Result<[f32; 3], DecodeError> {
    Ok([r.f32(field)?, r.f32(field)?, r.f32(field)?])
}

impl Payload for ServerInfo {
    const OPCODE: Opcode = Opcode::ServerInfo;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_u8(self.auth_mode as u8);
        w.put_u8(self.flags);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let auth_mode = AuthMode::from_u8(r.u8()?)
            .ok_or_else(|| DecodeError::malformed("auth_mode", "unknown mode"))?;
        Ok(Self {
            auth_mode,
            flags: r.u8()?,
        })
    }
}

impl Payload for Login {
    const OPCODE: Opcode = Opcode::Login;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_str8("username", &self.username, Bounds::required(MAX_USERNAME_LEN))?;
        w.put_str8("password", &self.password, Bounds::REQUIRED)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            username: r.str8("username", Bounds::required(MAX_USERNAME_LEN))?,
            password: r.str8("password", Bounds::REQUIRED)?,
        })
    }
}

impl Payload for LoginOk {
    const OPCODE: Opcode = Opcode::LoginOk;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_u32(self.entity_id.0);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            entity_id: EntityId(r.u32()?),
        })
    }
}

impl Payload for Beam {
    const OPCODE: Opcode = Opcode::Beam;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_str8(
            "planet_name",
            &self.planet_name,
            Bounds::required(MAX_PLANET_NAME_LEN),
        )?;
        if self.position.iter().any(|c| *c < 0.0) {
            return Err(EncodeError::new("position", "negative coordinate"));
        }
        put_vec3(w, "position", self.position)?;
        if self.angle >= 360 {
            return Err(EncodeError::new("angle", "not below 360"));
        }
        w.put_u16(self.angle);
        if self.planet_size.contains(&0) {
            return Err(EncodeError::new("planet_size", "zero extent"));
        }
        self.planet_size.iter().for_each(|s| w.put_u16(*s));
        if self.chunk_size.contains(&0) {
            return Err(EncodeError::new("chunk_size", "zero extent"));
        }
        self.chunk_size.iter().for_each(|s| w.put_u8(*s));
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let planet_name = r.str8("planet_name", Bounds::required(MAX_PLANET_NAME_LEN))?;
        let position = vec3(r, "position")?;
        if position.iter().any(|c| *c < 0.0) {
            return Err(DecodeError::malformed("position", "negative coordinate"));
        }
        let angle = r.u16()?;
        if angle >= 360 {
            return Err(DecodeError::malformed("angle", "not below 360"));
        }
        let planet_size = [r.u16()?, r.u16()?, r.u16()?];
        if planet_size.contains(&0) {
            return Err(DecodeError::malformed("planet_size", "zero extent"));
        }
        let chunk_size = [r.u8()?, r.u8()?, r.u8()?];
        if chunk_size.contains(&0) {
            return Err(DecodeError::malformed("chunk_size", "zero extent"));
        }
        Ok(Self {
            planet_name,
            position,
            angle,
            planet_size,
            chunk_size,
        })
    }
}

impl Payload for Ready {
    const OPCODE: Opcode = Opcode::Ready;

    fn write(&self, _w: &mut Writer<'_>) -> Result<(), EncodeError> {
        Ok(())
    }

    fn read(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Ready)
    }
}

impl Payload for RequestChunk {
    const OPCODE: Opcode = Opcode::RequestChunk;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        put_chunk_pos(w, self.position);
        w.put_u32(self.timestamp);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: chunk_pos(r)?,
            timestamp: r.u32()?,
        })
    }
}

impl Payload for Chunk {
    const OPCODE: Opcode = Opcode::Chunk;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let classes = self.class_ids.len();
        if classes == 0 {
            return Err(EncodeError::new("class_ids", "empty"));
        }
        if classes > MAX_CHUNK_CLASS_IDS {
            return Err(EncodeError::new("class_ids", "too many"));
        }
        if self.blocks.is_empty() {
            return Err(EncodeError::new("blocks", "empty"));
        }
        if self.blocks.len() > usize::from(u16::MAX) {
            return Err(EncodeError::new("blocks", "too many"));
        }
        if self
            .blocks
            .iter()
            .any(|b| usize::from(b & BLOCK_CLASS_MASK) >= classes)
        {
            return Err(EncodeError::new("blocks", "class index out of range"));
        }

        put_chunk_pos(w, self.position);
        w.put_u32(self.timestamp);
        w.put_u16(classes as u16);
        for id in &self.class_ids {
            w.put_str8("class_id", id, Bounds::REQUIRED)?;
        }
        w.put_u16(self.blocks.len() as u16);
        self.blocks.iter().for_each(|b| w.put_u16(*b));
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let position = chunk_pos(r)?;
        let timestamp = r.u32()?;

        let classes = usize::from(r.u16()?);
        if classes == 0 {
            return Err(DecodeError::malformed("class_ids", "empty"));
        }
        if classes > MAX_CHUNK_CLASS_IDS {
            return Err(DecodeError::malformed("class_ids", "too many"));
        }
        let mut class_ids = Vec::with_capacity(classes.min(r.remaining()));
        for _ in 0..classes {
            class_ids.push(r.str8("class_id", Bounds::REQUIRED)?);
        }

        let count = usize::from(r.u16()?);
        if count == 0 {
            return Err(DecodeError::malformed("blocks", "empty"));
        }
        let mut blocks = Vec::with_capacity(count.min(r.remaining() / 2));
        for _ in 0..count {
            let entry = r.u16()?;
            if usize::from(entry & BLOCK_CLASS_MASK) >= classes {
                return Err(DecodeError::malformed("blocks", "class index out of range"));
            }
            blocks.push(entry);
        }

        Ok(Self {
            position,
            timestamp,
            class_ids,
            blocks,
        })
    }
}

impl Payload for ChunkUnchanged {
    const OPCODE: Opcode = Opcode::ChunkUnchanged;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        put_chunk_pos(w, self.position);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: chunk_pos(r)?,
        })
    }
}

impl Payload for CreateEntity {
    const OPCODE: Opcode = Opcode::CreateEntity;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_u32(self.id.0);
        put_chunk_pos(w, self.chunk);
        put_vec3(w, "offset", self.offset)?;
        w.put_u8(self.heading);
        w.put_str8("class_id", &self.class_id, Bounds::REQUIRED)?;
        match &self.parent {
            Some(attachment) => {
                w.put_str8("hook", &attachment.hook, Bounds::REQUIRED)?;
                w.put_u32(attachment.parent.0);
            }
            None => w.put_u8(0),
        }
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let id = EntityId(r.u32()?);
        let chunk = chunk_pos(r)?;
        let offset = vec3(r, "offset")?;
        let heading = r.u8()?;
        let class_id = r.str8("class_id", Bounds::REQUIRED)?;
        let hook = r.str8("hook", Bounds::OPTIONAL)?;
        let parent = if hook.is_empty() {
            None
        } else {
            Some(Attachment {
                hook,
                parent: EntityId(r.u32()?),
            })
        };
        Ok(Self {
            id,
            chunk,
            offset,
            heading,
            class_id,
            parent,
        })
    }
}

impl Payload for Chat {
    const OPCODE: Opcode = Opcode::Chat;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_str8("channel", &self.channel, Bounds::OPTIONAL)?;
        w.put_str8("sender", &self.sender, Bounds::OPTIONAL)?;
        w.put_str16("message", &self.message, Bounds::REQUIRED_LONG)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            channel: r.str8("channel", Bounds::OPTIONAL)?,
            sender: r.str8("sender", Bounds::OPTIONAL)?,
            message: r.str16("message", Bounds::REQUIRED_LONG)?,
        })
    }
}

impl Payload for DestroyBlock {
    const OPCODE: Opcode = Opcode::DestroyBlock;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        put_block_pos(w, self.position);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: block_pos(r)?,
        })
    }
}

impl Payload for SetBlock {
    const OPCODE: Opcode = Opcode::SetBlock;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        put_block_pos(w, self.position);
        w.put_str8("class_id", &self.class_id, Bounds::REQUIRED)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: block_pos(r)?,
            class_id: r.str8("class_id", Bounds::REQUIRED)?,
        })
    }
}

impl Payload for BlockAction {
    const OPCODE: Opcode = Opcode::BlockAction;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        put_block_pos(w, self.position);
        w.put_u8((u8::from(self.primary) << 4) | self.facing as u8);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let position = block_pos(r)?;
        let packed = r.u8()?;
        if packed & 0xe0 != 0 {
            return Err(DecodeError::malformed("action", "reserved bits set"));
        }
        let facing = Facing::from_u8(packed & 0x0f)
            .ok_or_else(|| DecodeError::malformed("facing", "unknown face"))?;
        Ok(Self {
            position,
            facing,
            primary: packed & 0x10 != 0,
        })
    }
}

impl Payload for AttachEntity {
    const OPCODE: Opcode = Opcode::AttachEntity;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_u32(self.source.0);
        w.put_u32(self.target.0);
        w.put_str8("hook_id", &self.hook_id, Bounds::REQUIRED)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            source: EntityId(r.u32()?),
            target: EntityId(r.u32()?),
            hook_id: r.str8("hook_id", Bounds::REQUIRED)?,
        })
    }
}

impl Payload for Use {
    const OPCODE: Opcode = Opcode::Use;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_u32(self.entity_id.0);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            entity_id: EntityId(r.u32()?),
        })
    }
}

impl Payload for OpenContainer {
    const OPCODE: Opcode = Opcode::OpenContainer;

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.put_u32(self.container_id);
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            container_id: r.u32()?,
        })
    }
}
