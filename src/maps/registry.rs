//! Process-wide collection of per-owner stores
//!
//! Lock order is commit lock, then the store list, then a single store. The
//! commit lock guards registration, deletion and the tile commit of an update,
//! so two concurrent creates cannot both pass the global quota check and an
//! update cannot write tiles for a map deleted under it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{MapError, Result};
use crate::images::{StagedTile, TileStorage};
use crate::maps::image_map::{ImageMap, OwnerId, SurfaceId};
use crate::maps::store::{ImageRecordStore, Quota, RECORD_EXTENSION};

pub struct CatalogueRegistry {
    maps_dir: PathBuf,
    tiles: TileStorage,
    quota: Quota,
    stores: Mutex<Vec<Arc<ImageRecordStore>>>,
    commit: Mutex<()>,
}

impl CatalogueRegistry {
    /// Create the registry over `maps_dir`, creating the directory if needed.
    /// Nothing is read until [`CatalogueRegistry::load`] or the first lookup.
    pub fn new(maps_dir: impl Into<PathBuf>, tiles: TileStorage, quota: Quota) -> Result<Self> {
        let maps_dir = maps_dir.into();
        fs::create_dir_all(&maps_dir).map_err(|e| MapError::persistence(&maps_dir, e))?;
        Ok(Self {
            maps_dir,
            tiles,
            quota,
            stores: Mutex::new(Vec::new()),
            commit: Mutex::new(()),
        })
    }

    fn stores(&self) -> MutexGuard<'_, Vec<Arc<ImageRecordStore>>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn maps_dir(&self) -> &Path {
        &self.maps_dir
    }

    pub fn tiles(&self) -> &TileStorage {
        &self.tiles
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Scan the maps directory and load every owner file not loaded yet.
    /// Returns the number of stores loaded by this call.
    pub fn load(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in WalkDir::new(&self.maps_dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Cannot read entry in {:?}: {e}", self.maps_dir);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION)
            {
                continue;
            }
            let Some(owner) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<OwnerId>().ok())
            else {
                debug!("Ignoring {path:?}: file name is not an owner id");
                continue;
            };
            if self.loaded_store(owner).is_some() {
                continue;
            }

            match ImageRecordStore::load(owner, path) {
                Ok(store) => {
                    if self.insert_store(Arc::new(store)).is_none() {
                        loaded += 1;
                    }
                }
                Err(e) => error!("Failed to load record file {path:?}: {e}"),
            }
        }

        info!("Loaded {loaded} map stores from {:?}", self.maps_dir);
        Ok(loaded)
    }

    fn loaded_store(&self, owner: OwnerId) -> Option<Arc<ImageRecordStore>> {
        self.stores().iter().find(|s| s.owner() == owner).cloned()
    }

    /// Insert `store` unless one for the same owner got in first, in which
    /// case that one is returned
    fn insert_store(&self, store: Arc<ImageRecordStore>) -> Option<Arc<ImageRecordStore>> {
        let mut stores = self.stores();
        if let Some(existing) = stores.iter().find(|s| s.owner() == store.owner()) {
            return Some(existing.clone());
        }
        stores.push(store);
        None
    }

    /// Store of `owner`, loaded from disk or created empty on first use.
    ///
    /// When the record file exists but cannot be read, the returned store is
    /// empty, refuses every write and is not kept, so the next call reads the
    /// file again.
    pub fn store_for(&self, owner: OwnerId) -> Arc<ImageRecordStore> {
        if let Some(store) = self.loaded_store(owner) {
            return store;
        }

        let path = ImageRecordStore::path_in(&self.maps_dir, owner);
        match ImageRecordStore::load(owner, &path) {
            Ok(store) => {
                let store = Arc::new(store);
                self.insert_store(store.clone()).unwrap_or(store)
            }
            Err(e) => {
                error!("Failed to load maps of {owner}: {e}");
                Arc::new(ImageRecordStore::unreadable(owner, path, e.to_string()))
            }
        }
    }

    /// Snapshot of the loaded stores
    pub fn loaded_stores(&self) -> Vec<Arc<ImageRecordStore>> {
        self.stores().clone()
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        self.stores().iter().map(|s| s.owner()).collect()
    }

    pub fn total_surface_count(&self) -> usize {
        self.loaded_stores()
            .iter()
            .map(|s| s.surface_count())
            .sum()
    }

    pub fn max_surface_id(&self) -> Option<SurfaceId> {
        self.loaded_stores()
            .iter()
            .filter_map(|s| s.max_surface_id())
            .max()
    }

    pub fn find_by_surface_id(&self, surface: SurfaceId) -> Option<ImageMap> {
        self.loaded_stores()
            .iter()
            .find_map(|s| s.find_by_surface(surface))
    }

    pub fn manages_surface(&self, surface: SurfaceId) -> bool {
        self.loaded_stores()
            .iter()
            .any(|s| s.manages_surface(surface))
    }

    /// Advisory check that `owner` may add `tiles` more surfaces.
    /// [`CatalogueRegistry::add_map`] checks again under the commit lock.
    pub fn check_quota(&self, owner: OwnerId, tiles: usize) -> Result<()> {
        let owner_used = self.store_for(owner).surface_count();
        self.quota
            .check(self.total_surface_count(), owner_used, tiles)
    }

    fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_map(&self, map: ImageMap) -> Result<()> {
        let _commit = self.commit_lock();
        let store = self.store_for(map.owner);
        let global_used = self.total_surface_count();
        store.add_map(map, self.quota, global_used)
    }

    pub fn replace_map(&self, map: ImageMap) -> Result<ImageMap> {
        let _commit = self.commit_lock();
        self.store_for(map.owner).replace_map(map)
    }

    /// Commit the staged tiles of an update to `current`, and record
    /// `replacement` when given.
    ///
    /// Fails with [`MapError::MapNotFound`] when `current` was deleted,
    /// renamed or given other surfaces since it was read. The staged files
    /// are then dropped and the tiles on disk stay as they are.
    pub fn commit_update(
        &self,
        current: &ImageMap,
        staged: Vec<StagedTile>,
        replacement: Option<ImageMap>,
    ) -> Result<ImageMap> {
        let _commit = self.commit_lock();
        let store = self.store_for(current.owner);
        let still_there = store
            .get_map(&current.id)
            .is_some_and(|live| live.surfaces() == current.surfaces());
        if !still_there {
            debug!(
                "Map '{}' of {} changed during its update, dropping {} staged tiles",
                current.id,
                current.owner,
                staged.len()
            );
            return Err(MapError::not_found(&current.id));
        }

        for tile in staged {
            tile.commit()?;
        }
        match replacement {
            Some(map) => {
                store.replace_map(map.clone())?;
                Ok(map)
            }
            None => Ok(current.clone()),
        }
    }

    /// Remove `map` from its owner's store and delete its tile files
    pub fn delete_map(&self, map: &ImageMap) -> Result<()> {
        let _commit = self.commit_lock();
        let removed = self.store_for(map.owner).delete_map(&map.id)?;
        self.tiles.delete_all(removed.surfaces());
        info!("Deleted map '{}' of {}", removed.id, removed.owner);
        Ok(())
    }

    pub fn rename_map(&self, owner: OwnerId, old_id: &str, new_id: &str) -> Result<ImageMap> {
        self.store_for(owner).rename_map(old_id, new_id)
    }

    pub fn get_map(&self, owner: OwnerId, id: &str) -> Option<ImageMap> {
        self.store_for(owner).get_map(id)
    }

    /// Save every store, continuing past failures. Returns the first error.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for store in self.loaded_stores() {
            if let Err(e) = store.save() {
                error!("Failed to save maps of {}: {e}", store.owner());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Final flush, then forget every store
    pub fn shutdown(&self) {
        if let Err(e) = self.flush_all() {
            warn!("Some map stores could not be saved at shutdown: {e}");
        }
        self.stores().clear();
        debug!("Catalogue registry cleared");
    }
}
