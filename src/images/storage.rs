//! Tile files on disk, one PNG per surface
//!
//! Writes go through a temporary file in the same directory and are renamed
//! into place on commit, so a tile file is always either the old or the new
//! picture.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::error::{MapError, Result};
use crate::images::codec;
use crate::maps::SurfaceId;

#[derive(Clone, Debug)]
pub struct TileStorage {
    base_dir: PathBuf,
}

/// A tile written to a temporary file, not yet visible under its final name.
/// Dropping it without [`StagedTile::commit`] removes the temporary file.
#[derive(Debug)]
pub struct StagedTile {
    surface: SurfaceId,
    target: PathBuf,
    file: NamedTempFile,
}

impl StagedTile {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn commit(self) -> Result<PathBuf> {
        let target = self.target;
        self.file
            .persist(&target)
            .map_err(|e| MapError::persistence(&target, e.error))?;
        debug!("Committed tile {target:?}");
        Ok(target)
    }
}

impl TileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| MapError::persistence(&base_dir, e))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn path_for(&self, surface: SurfaceId) -> PathBuf {
        self.base_dir.join(format!("map{surface}.png"))
    }

    pub fn exists(&self, surface: SurfaceId) -> bool {
        self.path_for(surface).is_file()
    }

    pub fn stage(&self, surface: SurfaceId, tile: &RgbaImage) -> Result<StagedTile> {
        let bytes = codec::encode_png(tile)?;
        let mut file = NamedTempFile::new_in(&self.base_dir)
            .map_err(|e| MapError::persistence(&self.base_dir, e))?;
        file.write_all(&bytes)
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| MapError::persistence(file.path(), e))?;

        Ok(StagedTile {
            surface,
            target: self.path_for(surface),
            file,
        })
    }

    /// Stage and commit in one step
    pub fn write(&self, surface: SurfaceId, tile: &RgbaImage) -> Result<PathBuf> {
        self.stage(surface, tile)?.commit()
    }

    pub fn load(&self, surface: SurfaceId) -> Result<RgbaImage> {
        codec::read_file(&self.path_for(surface))
    }

    /// Remove the tile file of `surface`; a missing file is not an error
    pub fn delete(&self, surface: SurfaceId) -> Result<()> {
        let path = self.path_for(surface);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted tile {path:?}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MapError::persistence(path, e)),
        }
    }

    /// Delete every tile of `surfaces`, logging failures instead of stopping
    pub fn delete_all(&self, surfaces: &[SurfaceId]) {
        for &surface in surfaces {
            if let Err(e) = self.delete(surface) {
                warn!("Failed to delete tile for surface {surface}: {e}");
            }
        }
    }
}
