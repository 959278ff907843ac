pub mod image_map;
pub mod registry;
pub mod store;

pub use image_map::{ImageMap, MapKind, OwnerId, SurfaceId};
pub use registry::CatalogueRegistry;
pub use store::{ImageRecordStore, Quota};
