pub mod codec;
pub mod palette;
pub mod scaling;
pub mod storage;

pub use palette::{IndexedTile, Palette};
pub use scaling::{GridSize, ScalingPolicy};
pub use storage::{StagedTile, TileStorage};
