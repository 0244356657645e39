#![warn(missing_docs)]
//! Authoritative session host for the block world.
//!
//! [`SessionHost`] accepts connections, authenticates them against the
//! [`AccountStore`], and keeps every logged-in client synchronized with the
//! [`WorldGate`] behind the shared [`LockFacility`](blockhost_core::LockFacility).

pub mod accounts;
pub mod chunks;
pub mod config;
pub mod hooks;
pub mod session;
pub mod world;

pub use accounts::{Account, AccountError, AccountStore, LoadReport, LoadStrategy};
pub use chunks::{ChunkJob, ChunkWorker};
pub use config::HostConfig;
pub use hooks::{HookContext, SessionHooks};
pub use session::{HostError, SessionHandle, SessionHost, SharedFacility, Target};
pub use world::{EntityRecord, MemoryWorld, PlanetSpec, WorldError, WorldGate};
