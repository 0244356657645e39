//! World collaborator seen by the session host.
//!
//! The host never owns game state. Everything it needs from the simulation
//! goes through [`WorldGate`], always while the world lock is held.

use blockhost_core::{BlockPos, ChunkPos, EntityId};
use blockhost_net::{Attachment, Beam, Chunk, CreateEntity};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Class id of an empty block.
pub const AIR: &str = "base/air";

/// Why the world refused a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorldError {
    /// Position outside the planet.
    #[error("block {0:?} is outside the planet")]
    OutOfBounds(BlockPos),
    /// Chunk position outside the planet.
    #[error("chunk {0:?} is outside the planet")]
    ChunkOutOfBounds(ChunkPos),
    /// No entity with this id.
    #[error("no entity {0}")]
    NoEntity(EntityId),
    /// Entity cannot be attached to itself or along a cycle.
    #[error("cannot attach {entity} to {owner}")]
    InvalidAttachment {
        /// Entity being attached.
        entity: EntityId,
        /// Hook owner.
        owner: EntityId,
    },
    /// A chunk holds too many distinct block classes.
    #[error("chunk {0:?} has no room for another block class")]
    PaletteFull(ChunkPos),
}

/// Stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Class id.
    pub class_id: String,
    /// Containing chunk.
    pub chunk: ChunkPos,
    /// Offset inside the chunk.
    pub offset: [f32; 3],
    /// Heading in 1/256 turns.
    pub heading: u8,
    /// Hook attachment, if any.
    pub parent: Option<Attachment>,
}

impl EntityRecord {
    /// Spawn announcement for this entity.
    pub fn to_message(&self, id: EntityId) -> CreateEntity {
        CreateEntity {
            id,
            chunk: self.chunk,
            offset: self.offset,
            heading: self.heading,
            class_id: self.class_id.clone(),
            parent: self.parent.clone(),
        }
    }
}

/// Operations the session host performs on the simulation.
pub trait WorldGate: Send + 'static {
    /// Place a block.
    fn set_block(&mut self, pos: BlockPos, class_id: &str) -> Result<(), WorldError>;

    /// Remove a block.
    fn destroy_block(&mut self, pos: BlockPos) -> Result<(), WorldError>;

    /// Spawn an entity and return its id.
    fn create_entity(
        &mut self,
        class_id: &str,
        chunk: ChunkPos,
        offset: [f32; 3],
        heading: u8,
    ) -> Result<EntityId, WorldError>;

    /// Spawn a player entity at the planet's spawn point.
    fn spawn_player(&mut self, class_id: &str) -> Result<EntityId, WorldError>;

    /// Look up an entity.
    fn find_entity(&self, id: EntityId) -> Option<&EntityRecord>;

    /// Hang `source` on `target`'s hook.
    fn attach_entity(
        &mut self,
        source: EntityId,
        target: EntityId,
        hook: &str,
    ) -> Result<(), WorldError>;

    /// Despawn an entity.
    fn remove_entity(&mut self, id: EntityId) -> Result<EntityRecord, WorldError>;

    /// Chunk contents if present; `timestamp` is the last modification.
    fn chunk(&self, pos: ChunkPos) -> Option<&Chunk>;

    /// Generate (or return) the chunk at `pos`. May be slow.
    fn generate_chunk(&mut self, pos: ChunkPos) -> Result<Chunk, WorldError>;

    /// Placement message for a player entity.
    fn beam(&self, entity: EntityId) -> Result<Beam, WorldError>;

    /// Advance the world clock.
    fn tick(&mut self);
}

/// Dimensions of a [`MemoryWorld`] planet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanetSpec {
    /// Planet name sent in Beam.
    pub name: String,
    /// Size in chunks.
    pub size: [u16; 3],
    /// Chunk size in blocks.
    pub chunk_size: [u8; 3],
}

impl PlanetSpec {
    fn dims(&self) -> [u32; 3] {
        let [cx, cy, cz] = self.chunk_size.map(u32::from);
        let [px, py, pz] = self.size.map(u32::from);
        [px * cx, py * cy, pz * cz]
    }

    fn ground_level(&self) -> u32 {
        self.dims()[1] / 2
    }

    // Stone below ground, one grass layer, air above.
    fn build_chunk(&self, pos: ChunkPos, clock: u32) -> Chunk {
        let [cx, cy, cz] = self.chunk_size.map(u32::from);
        let ground = self.ground_level();
        let mut chunk = Chunk::new(pos, clock);
        for _ in 0..cz {
            for ly in 0..cy {
                let y = u32::from(pos.y) * cy + ly;
                let class = if y + 1 < ground {
                    "base/stone"
                } else if y + 1 == ground {
                    "base/grass"
                } else {
                    AIR
                };
                for _ in 0..cx {
                    chunk.push_block(class, 0);
                }
            }
        }
        debug!(?pos, "generated chunk");
        chunk
    }
}

impl Default for PlanetSpec {
    fn default() -> Self {
        Self {
            name: "terra".to_owned(),
            size: [8, 4, 8],
            chunk_size: [16, 16, 16],
        }
    }
}

/// In-process world: flat layered terrain, entities in a map, chunks
/// generated lazily.
#[derive(Debug)]
pub struct MemoryWorld {
    planet: PlanetSpec,
    clock: u32,
    chunks: HashMap<ChunkPos, Chunk>,
    entities: HashMap<EntityId, EntityRecord>,
    next_entity: u32,
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new(PlanetSpec::default())
    }
}

impl MemoryWorld {
    /// Empty world on `planet`.
    pub fn new(planet: PlanetSpec) -> Self {
        Self {
            planet,
            clock: 1,
            chunks: HashMap::new(),
            entities: HashMap::new(),
            next_entity: 1,
        }
    }

    /// Planet dimensions.
    pub fn planet(&self) -> &PlanetSpec {
        &self.planet
    }

    /// Current world time.
    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Class of the block at `pos`, if its chunk exists.
    pub fn block(&self, pos: BlockPos) -> Option<&str> {
        let (chunk, index) = self.locate(pos).ok()?;
        self.chunks.get(&chunk)?.block_class(index)
    }

    fn dims(&self) -> [u32; 3] {
        self.planet.dims()
    }

    fn ground_level(&self) -> u32 {
        self.planet.ground_level()
    }

    fn contains_chunk(&self, pos: ChunkPos) -> bool {
        let [px, py, pz] = self.planet.size;
        pos.x < px && pos.y < py && pos.z < pz
    }

    fn locate(&self, pos: BlockPos) -> Result<(ChunkPos, usize), WorldError> {
        let [dx, dy, dz] = self.dims();
        if pos.x >= dx || pos.y >= dy || pos.z >= dz {
            return Err(WorldError::OutOfBounds(pos));
        }
        let [cx, cy, cz] = self.planet.chunk_size.map(u32::from);
        let chunk = ChunkPos::new((pos.x / cx) as u16, (pos.y / cy) as u16, (pos.z / cz) as u16);
        let (lx, ly, lz) = (pos.x % cx, pos.y % cy, pos.z % cz);
        Ok((chunk, (lx + cx * (ly + cy * lz)) as usize))
    }

    fn chunk_mut(&mut self, pos: ChunkPos) -> &mut Chunk {
        let (planet, clock) = (&self.planet, self.clock);
        self.chunks
            .entry(pos)
            .or_insert_with(|| planet.build_chunk(pos, clock))
    }

    fn write_block(&mut self, pos: BlockPos, class_id: &str) -> Result<(), WorldError> {
        let (chunk_pos, index) = self.locate(pos)?;
        let clock = self.clock;
        let chunk = self.chunk_mut(chunk_pos);
        if !chunk.set_block(index, class_id) {
            return Err(WorldError::PaletteFull(chunk_pos));
        }
        chunk.timestamp = clock;
        Ok(())
    }

    fn insert_entity(&mut self, record: EntityRecord) -> EntityId {
        let id = EntityId(self.next_entity);
        self.next_entity = self.next_entity.wrapping_add(1).max(1);
        self.entities.insert(id, record);
        id
    }
}

impl WorldGate for MemoryWorld {
    fn set_block(&mut self, pos: BlockPos, class_id: &str) -> Result<(), WorldError> {
        self.write_block(pos, class_id)
    }

    fn destroy_block(&mut self, pos: BlockPos) -> Result<(), WorldError> {
        self.write_block(pos, AIR)
    }

    fn create_entity(
        &mut self,
        class_id: &str,
        chunk: ChunkPos,
        offset: [f32; 3],
        heading: u8,
    ) -> Result<EntityId, WorldError> {
        if !self.contains_chunk(chunk) {
            return Err(WorldError::ChunkOutOfBounds(chunk));
        }
        Ok(self.insert_entity(EntityRecord {
            class_id: class_id.to_owned(),
            chunk,
            offset,
            heading,
            parent: None,
        }))
    }

    fn spawn_player(&mut self, class_id: &str) -> Result<EntityId, WorldError> {
        let [px, _, pz] = self.planet.size;
        let [cx, cy, cz] = self.planet.chunk_size;
        let ground = self.ground_level();
        let chunk = ChunkPos::new(px / 2, (ground / u32::from(cy)) as u16, pz / 2);
        let offset = [
            f32::from(cx) / 2.0,
            (ground % u32::from(cy)) as f32,
            f32::from(cz) / 2.0,
        ];
        self.create_entity(class_id, chunk, offset, 0)
    }

    fn find_entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    fn attach_entity(
        &mut self,
        source: EntityId,
        target: EntityId,
        hook: &str,
    ) -> Result<(), WorldError> {
        if !self.entities.contains_key(&target) {
            return Err(WorldError::NoEntity(target));
        }
        if !self.entities.contains_key(&source) {
            return Err(WorldError::NoEntity(source));
        }
        // Walk up from the target; meeting the source would close a loop.
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            if id == source {
                return Err(WorldError::InvalidAttachment {
                    entity: source,
                    owner: target,
                });
            }
            cursor = self
                .entities
                .get(&id)
                .and_then(|e| e.parent.as_ref().map(|a| a.parent));
        }
        if let Some(record) = self.entities.get_mut(&source) {
            record.parent = Some(Attachment {
                hook: hook.to_owned(),
                parent: target,
            });
        }
        Ok(())
    }

    fn remove_entity(&mut self, id: EntityId) -> Result<EntityRecord, WorldError> {
        let removed = self.entities.remove(&id).ok_or(WorldError::NoEntity(id))?;
        for record in self.entities.values_mut() {
            if record.parent.as_ref().is_some_and(|a| a.parent == id) {
                record.parent = None;
            }
        }
        Ok(removed)
    }

    fn chunk(&self, pos: ChunkPos) -> Option<&Chunk> {
        self.chunks.get(&pos)
    }

    fn generate_chunk(&mut self, pos: ChunkPos) -> Result<Chunk, WorldError> {
        if !self.contains_chunk(pos) {
            return Err(WorldError::ChunkOutOfBounds(pos));
        }
        Ok(self.chunk_mut(pos).clone())
    }

    fn beam(&self, entity: EntityId) -> Result<Beam, WorldError> {
        let record = self
            .entities
            .get(&entity)
            .ok_or(WorldError::NoEntity(entity))?;
        let size = self.planet.chunk_size.map(f32::from);
        let chunk = [record.chunk.x, record.chunk.y, record.chunk.z].map(f32::from);
        let position = [
            chunk[0] * size[0] + record.offset[0],
            chunk[1] * size[1] + record.offset[1],
            chunk[2] * size[2] + record.offset[2],
        ]
        .map(|c| c.max(0.0));
        Ok(Beam {
            planet_name: self.planet.name.clone(),
            position,
            angle: (u32::from(record.heading) * 360 / 256) as u16,
            planet_size: self.planet.size,
            chunk_size: self.planet.chunk_size,
        })
    }

    fn tick(&mut self) {
        self.clock = self.clock.wrapping_add(1).max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> MemoryWorld {
        MemoryWorld::new(PlanetSpec {
            name: "moon".into(),
            size: [2, 2, 2],
            chunk_size: [4, 4, 4],
        })
    }

    #[test]
    fn entity_ids_start_at_one() {
        let mut world = small();
        let first = world.spawn_player("base/human").unwrap();
        let second = world
            .create_entity("base/cart", ChunkPos::new(0, 0, 0), [0.0; 3], 0)
            .unwrap();
        assert_eq!(first, EntityId(1));
        assert_eq!(second, EntityId(2));
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn terrain_is_layered_around_ground_level() {
        let mut world = small();
        world.generate_chunk(ChunkPos::new(0, 0, 0)).unwrap();
        world.generate_chunk(ChunkPos::new(0, 1, 0)).unwrap();
        assert_eq!(world.block(BlockPos::new(1, 0, 1)), Some("base/stone"));
        assert_eq!(world.block(BlockPos::new(1, 3, 1)), Some("base/grass"));
        assert_eq!(world.block(BlockPos::new(1, 4, 1)), Some(AIR));
    }

    #[test]
    fn block_writes_bump_chunk_timestamp() {
        let mut world = small();
        let pos = BlockPos::new(5, 5, 5);
        world.tick();
        world.tick();
        world.set_block(pos, "base/glass").unwrap();
        assert_eq!(world.block(pos), Some("base/glass"));
        let chunk = world.chunk(ChunkPos::new(1, 1, 1)).unwrap();
        assert_eq!(chunk.timestamp, 3);

        world.destroy_block(pos).unwrap();
        assert_eq!(world.block(pos), Some(AIR));
    }

    #[test]
    fn out_of_bounds_writes_are_refused() {
        let mut world = small();
        let pos = BlockPos::new(8, 0, 0);
        assert_eq!(
            world.set_block(pos, "base/stone"),
            Err(WorldError::OutOfBounds(pos))
        );
        assert!(world.generate_chunk(ChunkPos::new(0, 2, 0)).is_err());
    }

    #[test]
    fn attachment_rejects_cycles() {
        let mut world = small();
        let a = world.spawn_player("a").unwrap();
        let b = world.spawn_player("b").unwrap();
        world.attach_entity(a, b, "seat").unwrap();
        assert_eq!(
            world.attach_entity(b, a, "seat"),
            Err(WorldError::InvalidAttachment {
                entity: b,
                owner: a
            })
        );
        assert_eq!(
            world.find_entity(a).unwrap().parent,
            Some(Attachment {
                hook: "seat".into(),
                parent: b
            })
        );
        world.remove_entity(b).unwrap();
        assert_eq!(world.find_entity(a).unwrap().parent, None);
    }

    #[test]
    fn beam_describes_the_planet() {
        let mut world = small();
        let player = world.spawn_player("base/human").unwrap();
        let beam = world.beam(player).unwrap();
        assert_eq!(beam.planet_name, "moon");
        assert_eq!(beam.planet_size, [2, 2, 2]);
        assert_eq!(beam.chunk_size, [4, 4, 4]);
        assert!(beam.angle < 360);
        assert!(beam.position.iter().all(|c| c.is_finite() && *c >= 0.0));
    }
}
