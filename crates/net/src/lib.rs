#![warn(missing_docs)]
//! Wire protocol and transport for the block host.
//!
//! Layers, bottom up: [`wire`] cursors, [`WireBuffer`] byte queues, the
//! message [`codec`], opcode [`dispatch`], then the [`Socket`], [`Selector`]
//! and [`Connection`] transport types.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod selector;
pub mod socket;
pub mod wire;

pub use buffer::{Ingress, WireBuffer};
pub use client::Client;
pub use codec::{decode_payload, deserialize, serialize, Decoded, Payload};
pub use connection::{Connection, ConnectionId, ConnectionState, Parts};
pub use dispatch::{dispatch, drain, drain_while, route, MessageHandler};
pub use error::{DecodeError, EncodeError, ProtocolError};
pub use protocol::*;
pub use selector::{Mode, Selector, Timeout};
pub use socket::{Socket, SocketId, SocketState};
