pub mod geometry;
pub mod memory_arena;
pub mod point_bvh;
mod util;

pub use memory_arena::{ArenaError, MemoryArena};
pub use point_bvh::{BvhError, BvhSettings, PointBvh, SplitMethod, TraversalStack};
pub use util::SampleSummary;
