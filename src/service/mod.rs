//! Map service: the entry point used by command handlers and host events
//!
//! Creating and updating maps run on the image workers and return a
//! [`TransformHandle`]. Catalogue queries answer straight from the record
//! stores.

mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use self::pipeline::Pipeline;
use crate::error::{MapError, Result};
use crate::executor::{TransformExecutor, TransformHandle};
use crate::fetch::{HttpFetcher, ImageSource, SourceFetcher};
use crate::host::{Inventory, MainThread, SurfaceHost};
use crate::images::{GridSize, Palette, ScalingPolicy, TileStorage};
use crate::items::{self, ItemOverflow};
use crate::maps::{CatalogueRegistry, ImageMap, OwnerId, Quota, SurfaceId};
use crate::renderer::Renderer;
use crate::settings::Settings;

pub const MAPS_DIR: &str = "maps";
pub const IMAGES_DIR: &str = "images";

/// What to render and how
#[derive(Clone, Debug)]
pub struct MapRequest {
    pub source: ImageSource,
    /// Wanted map id; a free variant of it is used when taken
    pub name: Option<String>,
    /// Explicit tile counts, 0 meaning "derive it"
    pub grid: Option<GridSize>,
    pub policy: ScalingPolicy,
}

impl MapRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            name: None,
            grid: None,
            policy: ScalingPolicy::None,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_grid(mut self, columns: u32, rows: u32) -> Self {
        self.grid = Some(GridSize::new(columns, rows));
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ScalingPolicy) -> Self {
        self.policy = policy;
        self
    }
}

pub struct MapService {
    pipeline: Arc<Pipeline>,
    executor: TransformExecutor,
    overflow: ItemOverflow,
    data_dir: PathBuf,
}

impl MapService {
    /// Open the catalogue under `data_dir` with the default HTTP fetcher
    pub fn new(
        data_dir: impl Into<PathBuf>,
        settings: Settings,
        host: Arc<dyn SurfaceHost>,
        main: Arc<dyn MainThread>,
    ) -> Result<Self> {
        Self::with_fetcher(data_dir, settings, host, main, Arc::new(HttpFetcher))
    }

    pub fn with_fetcher(
        data_dir: impl Into<PathBuf>,
        settings: Settings,
        host: Arc<dyn SurfaceHost>,
        main: Arc<dyn MainThread>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let tiles = TileStorage::new(data_dir.join(IMAGES_DIR))?;
        let registry = Arc::new(CatalogueRegistry::new(
            data_dir.join(MAPS_DIR),
            tiles,
            Quota::from_settings(&settings),
        )?);
        registry.load()?;

        let palette = Arc::new(Palette::minecraft());
        let renderer = Arc::new(Renderer::new(host.clone(), palette.clone()));
        let executor = TransformExecutor::from_settings(&settings)?;
        info!(
            "Map service ready in {data_dir:?} with {} image workers",
            executor.worker_count()
        );

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                settings,
                registry,
                host,
                main,
                renderer,
                palette,
                fetcher,
            }),
            executor,
            overflow: ItemOverflow::default(),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.pipeline.settings
    }

    pub fn registry(&self) -> &Arc<CatalogueRegistry> {
        &self.pipeline.registry
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.pipeline.renderer
    }

    pub fn tiles(&self) -> &TileStorage {
        self.pipeline.registry.tiles()
    }

    /// Render `request` into a new map of `owner`
    pub fn create_map(&self, owner: OwnerId, request: MapRequest) -> TransformHandle<ImageMap> {
        let pipeline = self.pipeline.clone();
        self.executor
            .submit(move || pipeline.create(owner, request))
    }

    /// Render `request` onto the surfaces `map` already uses
    pub fn update_map(&self, map: &ImageMap, request: MapRequest) -> TransformHandle<ImageMap> {
        let pipeline = self.pipeline.clone();
        let map = map.clone();
        self.executor
            .submit(move || pipeline.update(&map, request))
    }

    /// Remove `map` from the catalogue and delete its tile files. Its
    /// renderers are detached on the next main thread turn.
    pub fn delete_map(&self, map: &ImageMap) -> Result<()> {
        self.pipeline.registry.delete_map(map)?;

        let renderer = self.pipeline.renderer.clone();
        let surfaces = map.surfaces().to_vec();
        self.pipeline.main.run_on_main_thread(Box::new(move || {
            for surface in surfaces {
                renderer.uninstall(surface);
            }
        }));
        Ok(())
    }

    pub fn rename_map(&self, owner: OwnerId, old_id: &str, new_id: &str) -> Result<ImageMap> {
        let new_id = new_id.trim();
        if new_id.is_empty() {
            return Err(MapError::transform("a map name cannot be empty"));
        }
        self.pipeline.registry.rename_map(owner, old_id, new_id)
    }

    pub fn get_map(&self, owner: OwnerId, name: &str) -> Option<ImageMap> {
        self.pipeline.registry.get_map(owner, name)
    }

    pub fn get_maps(&self, owner: OwnerId) -> Vec<ImageMap> {
        self.pipeline.registry.store_for(owner).maps()
    }

    pub fn get_matching_names(&self, owner: OwnerId, prefix: &str) -> Vec<String> {
        self.pipeline.registry.store_for(owner).matching_names(prefix)
    }

    pub fn next_available_id(&self, owner: OwnerId, base: &str) -> String {
        self.pipeline.registry.store_for(owner).next_available_id(base)
    }

    pub fn find_by_surface_id(&self, surface: SurfaceId) -> Option<ImageMap> {
        self.pipeline.registry.find_by_surface_id(surface)
    }

    /// Whether `owner` may add `tiles` more surfaces right now
    pub fn check_quota(&self, owner: OwnerId, tiles: usize) -> Result<()> {
        self.pipeline.registry.check_quota(owner, tiles)
    }

    /// Surfaces held by `owner`
    pub fn surface_count(&self, owner: OwnerId) -> usize {
        self.pipeline.registry.store_for(owner).surface_count()
    }

    /// Give the items of `map` to `inventory`. Whatever does not fit waits in
    /// the owner's overflow queue. Returns true when everything fit.
    pub fn give_map(&self, owner: OwnerId, inventory: &mut dyn Inventory, map: &ImageMap) -> bool {
        items::give_map(inventory, map, &self.overflow, owner)
    }

    /// Hand out items still waiting for `owner`. Returns how many were given.
    pub fn give_remaining(&self, owner: OwnerId, inventory: &mut dyn Inventory) -> usize {
        items::give_remaining(inventory, &self.overflow, owner)
    }

    pub fn pending_items(&self, owner: OwnerId) -> usize {
        self.overflow.pending(owner)
    }

    /// Empty every slot holding one of the surfaces of `map`
    pub fn clear_surfaces_from_inventory(&self, inventory: &mut dyn Inventory, map: &ImageMap) -> usize {
        items::clear_surfaces_from_inventory(inventory, map)
    }

    /// The host has (re)initialised `surface`: attach a renderer and paint
    /// the saved tile if there is one. Completes with whether it was painted.
    pub fn init_surface(&self, surface: SurfaceId) -> TransformHandle<bool> {
        if self.pipeline.renderer.is_handled(surface) {
            return TransformHandle::ready(Ok(false));
        }
        let pipeline = self.pipeline.clone();
        self.executor
            .submit(move || Ok(pipeline.restore_surfaces(&[surface])? > 0))
    }

    /// [`MapService::init_surface`] for a batch, completing with the number
    /// of surfaces painted
    pub fn init_surfaces(&self, surfaces: Vec<SurfaceId>) -> TransformHandle<usize> {
        let pipeline = self.pipeline.clone();
        self.executor
            .submit(move || pipeline.restore_surfaces(&surfaces))
    }

    /// Stop the workers once their queued jobs are done, then flush and
    /// forget every store
    pub fn shutdown(&mut self) {
        debug!("Shutting down map service");
        self.executor.shutdown();
        self.pipeline.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_fields() {
        let request = MapRequest::new(ImageSource::from_bytes(vec![1u8, 2, 3]))
            .named("wall")
            .with_grid(3, 0)
            .with_policy(ScalingPolicy::Covered);
        assert_eq!(request.name.as_deref(), Some("wall"));
        assert_eq!(request.grid, Some(GridSize::new(3, 0)));
        assert_eq!(request.policy, ScalingPolicy::Covered);
    }
}
