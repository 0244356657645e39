#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod facility;
pub mod lock;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use facility::{FacilityGuard, LockFacility, Resource};
pub use lock::{LockError, ReentrantGuard, ReentrantLock};

/// Entity identifier assigned by the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Absolute block coordinate on a planet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockPos {
    /// X coordinate.
    pub x: u32,
    /// Y coordinate.
    pub y: u32,
    /// Z coordinate.
    pub z: u32,
}

impl BlockPos {
    /// Construct a block position.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// Chunk coordinate in chunk space.
/// Implements Ord for deterministic iteration in BTreeMap/BTreeSet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ChunkPos {
    /// X coordinate.
    pub x: u16,
    /// Y coordinate.
    pub y: u16,
    /// Z coordinate.
    pub z: u16,
}

impl ChunkPos {
    /// Construct a chunk position.
    pub const fn new(x: u16, y: u16, z: u16) -> Self {
        Self { x, y, z }
    }
}

/// Face of a block an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Facing {
    /// North.
    North = 0,
    /// East.
    East = 1,
    /// South.
    South = 2,
    /// West.
    West = 3,
    /// Up.
    Up = 4,
    /// Down.
    Down = 5,
}

impl Facing {
    /// All facings in wire order.
    pub const ALL: [Facing; 6] = [
        Facing::North,
        Facing::East,
        Facing::South,
        Facing::West,
        Facing::Up,
        Facing::Down,
    ];

    /// Map a wire value back to a facing.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facing_round_trips_through_wire_value() {
        for facing in Facing::ALL {
            assert_eq!(Facing::from_u8(facing as u8), Some(facing));
        }
        assert_eq!(Facing::from_u8(6), None);
    }

    #[test]
    fn chunk_positions_order_by_x_first() {
        assert!(ChunkPos::new(0, 9, 9) < ChunkPos::new(1, 0, 0));
    }
}
