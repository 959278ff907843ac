//! Worker side of map creation and update
//!
//! Everything here runs on an image worker. Surface allocation, installation
//! and painting are handed to the main thread and awaited, bounded by the
//! main thread timeout. Cleanup tasks are posted without waiting; the main
//! thread runs tasks in order, so they land after any late paint.

use std::sync::Arc;

use image::RgbaImage;
use log::{debug, info, warn};

use super::MapRequest;
use crate::error::{MapError, Result};
use crate::fetch::{self, FetchLimits, SourceFetcher};
use crate::host::{MainThread, SurfaceHost, call_on_main, call_on_main_or_undo};
use crate::images::codec::{self, DecodeLimits};
use crate::images::{GridSize, IndexedTile, Palette, StagedTile, TileStorage, scaling};
use crate::maps::{CatalogueRegistry, ImageMap, MapKind, OwnerId, SurfaceId};
use crate::renderer::Renderer;
use crate::settings::Settings;

/// Fallback map id when neither the request nor the source suggests one
const DEFAULT_MAP_ID: &str = "map";

/// Attempts at registering under a fresh id when a concurrent create took it
const NAME_RETRIES: usize = 8;

pub(crate) struct Pipeline {
    pub(crate) settings: Settings,
    pub(crate) registry: Arc<CatalogueRegistry>,
    pub(crate) host: Arc<dyn SurfaceHost>,
    pub(crate) main: Arc<dyn MainThread>,
    pub(crate) renderer: Arc<Renderer>,
    pub(crate) palette: Arc<Palette>,
    pub(crate) fetcher: Arc<dyn SourceFetcher>,
}

impl Pipeline {
    fn tiles(&self) -> &TileStorage {
        self.registry.tiles()
    }

    fn on_main<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        call_on_main(self.main.as_ref(), self.settings.main_thread_timeout(), f)
    }

    fn load_source(&self, request: &MapRequest) -> Result<RgbaImage> {
        let bytes = fetch::fetch(
            &request.source,
            self.fetcher.as_ref(),
            FetchLimits::from_settings(&self.settings),
        )?;
        codec::decode(
            &bytes,
            DecodeLimits {
                max_pixels: self.settings.max_source_pixels,
            },
        )
    }

    fn render_tiles(
        &self,
        raster: &RgbaImage,
        grid: GridSize,
        request: &MapRequest,
    ) -> Result<(Vec<RgbaImage>, Vec<IndexedTile>)> {
        let tiles = scaling::slice(raster, grid, self.settings.tile_resolution, request.policy)?;
        let indexed = self.palette.map_tiles(&tiles);
        Ok((tiles, indexed))
    }

    pub(crate) fn create(&self, owner: OwnerId, request: MapRequest) -> Result<ImageMap> {
        let raster = self.load_source(&request)?;
        let grid = GridSize::resolve(
            raster.dimensions(),
            request.grid,
            self.settings.tile_resolution,
            request.policy,
        );
        debug!(
            "Creating {grid} map for {owner} from {} ({})",
            request.source, request.policy
        );
        self.registry.check_quota(owner, grid.tile_count())?;

        let surfaces = self.allocate_surfaces(grid.tile_count())?;
        match self.build_new_map(owner, &request, &raster, grid, &surfaces) {
            Ok(map) => {
                info!("Created map '{}' of {owner} ({})", map.id, map.describe());
                Ok(map)
            }
            Err(e) => {
                warn!("Map creation for {owner} failed, rolling back: {e}");
                self.rollback(&surfaces);
                Err(e)
            }
        }
    }

    fn build_new_map(
        &self,
        owner: OwnerId,
        request: &MapRequest,
        raster: &RgbaImage,
        grid: GridSize,
        surfaces: &[SurfaceId],
    ) -> Result<ImageMap> {
        let (tiles, indexed) = self.render_tiles(raster, grid, request)?;
        for tile in self.stage_and_paint(surfaces, &tiles, indexed)? {
            tile.commit()?;
        }

        let base = request
            .name
            .clone()
            .or_else(|| request.source.suggested_name())
            .unwrap_or_else(|| DEFAULT_MAP_ID.to_string());
        let store = self.registry.store_for(owner);

        let mut last_error = None;
        for _ in 0..NAME_RETRIES {
            let id = store.next_available_id(&base);
            let map = ImageMap::from_tiles(owner, id, surfaces.to_vec(), grid)?;
            match self.registry.add_map(map.clone()) {
                Ok(()) => return Ok(map),
                Err(MapError::NameTaken { name }) => {
                    debug!("Map id '{name}' was taken meanwhile, picking another");
                    last_error = Some(MapError::NameTaken { name });
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| MapError::NameTaken { name: base }))
    }

    pub(crate) fn update(&self, map: &ImageMap, request: MapRequest) -> Result<ImageMap> {
        let current = self
            .registry
            .get_map(map.owner, &map.id)
            .ok_or_else(|| MapError::not_found(&map.id))?;

        let (grid, gains_geometry) = match &current.kind {
            MapKind::Single { .. } => (GridSize::SINGLE, false),
            MapKind::Poster {
                grid: Some(grid), ..
            } => (*grid, false),
            MapKind::Poster {
                surfaces,
                grid: None,
            } => match request.grid {
                Some(grid) if grid.tile_count() == surfaces.len() => (grid, true),
                _ => {
                    return Err(MapError::transform(format!(
                        "map '{}' has no stored layout: give columns and rows covering its {} parts",
                        current.id,
                        surfaces.len()
                    )));
                }
            },
        };

        let raster = self.load_source(&request)?;
        debug!(
            "Updating map '{}' of {} on its {grid} grid from {}",
            current.id, current.owner, request.source
        );
        let (tiles, indexed) = self.render_tiles(&raster, grid, &request)?;
        let staged = self.stage_and_paint(current.surfaces(), &tiles, indexed)?;

        let replacement = if gains_geometry {
            Some(
                ImageMap::poster(
                    current.owner,
                    current.id.clone(),
                    current.surfaces().to_vec(),
                    Some(grid),
                )?
                .with_display_name(current.display_name.clone()),
            )
        } else {
            None
        };
        let updated = match self.registry.commit_update(&current, staged, replacement) {
            Ok(updated) => updated,
            Err(e @ MapError::MapNotFound { .. }) => {
                warn!("Map '{}' of {} went away during its update", current.id, current.owner);
                self.uninstall_orphans(current.surfaces());
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        info!("Updated map '{}' of {}", updated.id, updated.owner);
        Ok(updated)
    }

    /// Stage every tile file, then repaint on the main thread. The caller
    /// commits the returned files; dropping them leaves the old files in place.
    fn stage_and_paint(
        &self,
        surfaces: &[SurfaceId],
        tiles: &[RgbaImage],
        indexed: Vec<IndexedTile>,
    ) -> Result<Vec<StagedTile>> {
        if surfaces.len() != tiles.len() {
            return Err(MapError::transform(format!(
                "{} tiles rendered for {} surfaces",
                tiles.len(),
                surfaces.len()
            )));
        }

        let staged = surfaces
            .iter()
            .zip(tiles)
            .map(|(surface, tile)| self.tiles().stage(*surface, tile))
            .collect::<Result<Vec<_>>>()?;

        let renderer = self.renderer.clone();
        let paint: Vec<(SurfaceId, IndexedTile)> = surfaces.iter().copied().zip(indexed).collect();
        self.on_main(move || -> Result<()> {
            for (surface, tile) in paint {
                renderer.install(surface)?.set_prepared(tile)?;
            }
            Ok(())
        })??;

        Ok(staged)
    }

    /// Uninstall renderers of `surfaces` that no map manages any more
    fn uninstall_orphans(&self, surfaces: &[SurfaceId]) {
        let renderer = self.renderer.clone();
        let registry = self.registry.clone();
        let ids = surfaces.to_vec();
        self.main.run_on_main_thread(Box::new(move || {
            for id in ids {
                if !registry.manages_surface(id) {
                    renderer.uninstall(id);
                }
            }
        }));
    }

    /// Allocate `count` surfaces on the main thread. Surfaces allocated after
    /// the wait timed out are released again right there.
    fn allocate_surfaces(&self, count: usize) -> Result<Vec<SurfaceId>> {
        let host = self.host.clone();
        let releaser = self.host.clone();
        call_on_main_or_undo(
            self.main.as_ref(),
            self.settings.main_thread_timeout(),
            move || -> Result<Vec<SurfaceId>> {
                let mut allocated = Vec::with_capacity(count);
                for _ in 0..count {
                    match host.allocate_surface_id() {
                        Ok(id) => allocated.push(id),
                        Err(e) => {
                            for id in allocated {
                                host.release_surface(id);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(allocated)
            },
            move |late| {
                if let Ok(ids) = late {
                    warn!("Releasing {} surfaces allocated after the worker gave up", ids.len());
                    for id in ids {
                        releaser.release_surface(id);
                    }
                }
            },
        )?
    }

    /// Undo a failed create: drop tile files, then queue the uninstall and
    /// release of the surfaces on the main thread
    fn rollback(&self, surfaces: &[SurfaceId]) {
        self.tiles().delete_all(surfaces);

        let renderer = self.renderer.clone();
        let host = self.host.clone();
        let ids = surfaces.to_vec();
        self.main.run_on_main_thread(Box::new(move || {
            for id in ids {
                renderer.uninstall(id);
                host.release_surface(id);
            }
        }));
    }

    /// Load saved tiles for `surfaces` not handled yet and paint them.
    /// Returns how many surfaces were restored.
    pub(crate) fn restore_surfaces(&self, surfaces: &[SurfaceId]) -> Result<usize> {
        let mut restored = Vec::new();
        for &surface in surfaces {
            if self.renderer.is_handled(surface) || !self.tiles().exists(surface) {
                continue;
            }
            match self.tiles().load(surface) {
                Ok(tile) => restored.push((surface, self.palette.map_tile(&tile))),
                Err(e) => warn!("Cannot restore surface {surface}: {e}"),
            }
        }
        if restored.is_empty() {
            return Ok(0);
        }

        let renderer = self.renderer.clone();
        self.on_main(move || -> Result<usize> {
            let mut painted = 0;
            for (surface, tile) in restored {
                // Another restore may have won the race since the check above.
                if renderer.is_handled(surface) {
                    continue;
                }
                renderer.install(surface)?.set_prepared(tile)?;
                painted += 1;
            }
            Ok(painted)
        })?
    }
}
