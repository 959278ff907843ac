//! Surface colour mapper
//!
//! Keeps one [`RenderHandle`] per installed surface together with the last
//! tile drawn on it, so a surface the host reinitialises can be redrawn
//! without going back to disk. All methods that touch a live surface must run
//! on the host main thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::RgbaImage;
use log::{debug, trace};

use crate::error::Result;
use crate::host::{LiveSurface, SurfaceHost};
use crate::images::{IndexedTile, Palette};
use crate::maps::SurfaceId;

pub struct RenderHandle {
    surface: SurfaceId,
    palette: Arc<Palette>,
    live: Mutex<Box<dyn LiveSurface>>,
    last_tile: Mutex<Option<IndexedTile>>,
}

impl RenderHandle {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Reduce `raster` to the palette and paint it
    pub fn set_image(&self, raster: &RgbaImage) -> Result<()> {
        self.set_prepared(self.palette.map_tile(raster))
    }

    /// Paint a tile already reduced to the palette
    pub fn set_prepared(&self, tile: IndexedTile) -> Result<()> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .paint(&tile)?;
        *self.last_tile.lock().unwrap_or_else(PoisonError::into_inner) = Some(tile);
        trace!("Painted surface {}", self.surface);
        Ok(())
    }

    /// Paint the cached tile again. Returns false when nothing was drawn yet.
    pub fn redraw(&self) -> Result<bool> {
        let tile = self
            .last_tile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tile {
            Some(tile) => {
                self.live
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .paint(&tile)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn last_tile(&self) -> Option<IndexedTile> {
        self.last_tile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Renderer {
    host: Arc<dyn SurfaceHost>,
    palette: Arc<Palette>,
    handles: Mutex<HashMap<SurfaceId, Arc<RenderHandle>>>,
}

impl Renderer {
    pub fn new(host: Arc<dyn SurfaceHost>, palette: Arc<Palette>) -> Self {
        Self {
            host,
            palette,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<SurfaceId, Arc<RenderHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn palette(&self) -> &Arc<Palette> {
        &self.palette
    }

    /// Attach a renderer to `surface`, or return the one already attached
    pub fn install(&self, surface: SurfaceId) -> Result<Arc<RenderHandle>> {
        if let Some(handle) = self.handles().get(&surface) {
            return Ok(handle.clone());
        }

        let live = self.host.install_live_surface(surface)?;
        let handle = Arc::new(RenderHandle {
            surface,
            palette: self.palette.clone(),
            live: Mutex::new(live),
            last_tile: Mutex::new(None),
        });
        debug!("Installed renderer on surface {surface}");
        Ok(self.handles().entry(surface).or_insert(handle).clone())
    }

    pub fn is_handled(&self, surface: SurfaceId) -> bool {
        self.handles().contains_key(&surface)
    }

    pub fn handle(&self, surface: SurfaceId) -> Option<Arc<RenderHandle>> {
        self.handles().get(&surface).cloned()
    }

    /// Reapply the cached tile after the host reset the surface
    pub fn redraw(&self, surface: SurfaceId) -> Result<bool> {
        match self.handle(surface) {
            Some(handle) => handle.redraw(),
            None => Ok(false),
        }
    }

    pub fn uninstall(&self, surface: SurfaceId) -> bool {
        let removed = self.handles().remove(&surface).is_some();
        if removed {
            debug!("Uninstalled renderer from surface {surface}");
        }
        removed
    }

    pub fn installed_count(&self) -> usize {
        self.handles().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HeadlessHost;
    use image::Rgba;

    fn renderer() -> (Arc<HeadlessHost>, Renderer) {
        let host = Arc::new(HeadlessHost::new());
        let renderer = Renderer::new(host.clone(), Arc::new(Palette::minecraft()));
        (host, renderer)
    }

    #[test]
    fn install_is_idempotent() {
        let (host, renderer) = renderer();
        let id = host.allocate_surface_id().unwrap();
        let first = renderer.install(id).unwrap();
        let second = renderer.install(id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(renderer.is_handled(id));
        assert_eq!(renderer.installed_count(), 1);
    }

    #[test]
    fn set_image_paints_palette_colours() {
        let (host, renderer) = renderer();
        let id = host.allocate_surface_id().unwrap();
        let handle = renderer.install(id).unwrap();

        handle
            .set_image(&RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255])))
            .unwrap();
        let painted = host.painted(id).unwrap();
        assert!(painted.indices().iter().all(|&i| i == 34));
    }

    #[test]
    fn redraw_reuses_cached_tile() {
        let (host, renderer) = renderer();
        let id = host.allocate_surface_id().unwrap();
        assert!(!renderer.redraw(id).unwrap());

        let handle = renderer.install(id).unwrap();
        assert!(!renderer.redraw(id).unwrap());
        handle
            .set_image(&RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255])))
            .unwrap();
        assert!(renderer.redraw(id).unwrap());
        assert_eq!(host.paint_count(id), 2);
    }

    #[test]
    fn install_fails_for_unknown_surface() {
        let (_host, renderer) = renderer();
        assert!(renderer.install(SurfaceId::new(1234)).is_err());
        assert!(!renderer.uninstall(SurfaceId::new(1234)));
    }
}
