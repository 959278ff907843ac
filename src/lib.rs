//! Tiled image maps bound to numbered host display surfaces
//!
//! Images are fetched, scaled onto a grid of fixed-size tiles, mapped to the
//! host palette and painted onto surfaces allocated from the host. Every map
//! is recorded in a per-owner catalogue that survives restarts.

pub mod error;
pub mod executor;
pub mod fetch;
pub mod host;
pub mod images;
pub mod items;
pub mod maps;
pub mod panic_handler;
pub mod renderer;
pub mod service;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{MapError, QuotaScope, Result};
pub use executor::TransformHandle;
pub use fetch::ImageSource;
pub use images::{GridSize, ScalingPolicy};
pub use items::MapItem;
pub use maps::{ImageMap, MapKind, OwnerId, SurfaceId};
pub use service::{MapRequest, MapService};
pub use settings::Settings;
