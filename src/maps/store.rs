//! Per-owner catalogue of image maps
//!
//! Each owner has one YAML file under `maps/`, named after the owner UUID.
//! The file is rewritten after every structural change through a temporary
//! file, so a crash never leaves a half-written catalogue behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{MapError, QuotaScope, Result};
use crate::images::GridSize;
use crate::maps::image_map::{ImageMap, MapKind, OwnerId, SurfaceId};
use crate::settings::Settings;

pub const RECORD_VERSION: u32 = 1;
pub const RECORD_EXTENSION: &str = "yml";
const CORRUPT_SUFFIX: &str = "corrupt";

/// Surface limits, 0 means unlimited
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Quota {
    pub global_limit: usize,
    pub per_owner_limit: usize,
}

impl Quota {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            global_limit: settings.global_limit,
            per_owner_limit: settings.per_owner_limit,
        }
    }

    /// Fail when `requested` more surfaces would break a limit. The global
    /// limit is checked first.
    pub fn check(&self, global_used: usize, owner_used: usize, requested: usize) -> Result<()> {
        if self.global_limit > 0 && global_used + requested > self.global_limit {
            return Err(MapError::QuotaExceeded {
                scope: QuotaScope::Global,
            });
        }
        if self.per_owner_limit > 0 && owner_used + requested > self.per_owner_limit {
            return Err(MapError::QuotaExceeded {
                scope: QuotaScope::Owner,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default = "default_record_version")]
    version: u32,
    #[serde(default)]
    maps: Vec<serde_yaml::Value>,
}

fn default_record_version() -> u32 {
    RECORD_VERSION
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum MapRecord {
    Single {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        surface: SurfaceId,
    },
    Poster {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        surfaces: Vec<SurfaceId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u32>,
    },
}

impl MapRecord {
    fn from_map(map: &ImageMap) -> Self {
        let name = Some(map.display_name.clone());
        match &map.kind {
            MapKind::Single { surface } => MapRecord::Single {
                id: map.id.clone(),
                name,
                surface: *surface,
            },
            MapKind::Poster { surfaces, grid } => MapRecord::Poster {
                id: map.id.clone(),
                name,
                surfaces: surfaces.clone(),
                columns: grid.map(|g| g.columns),
                rows: grid.map(|g| g.rows),
            },
        }
    }

    fn into_map(self, owner: OwnerId) -> Option<ImageMap> {
        match self {
            MapRecord::Single { id, name, surface } => {
                let display_name = name.unwrap_or_else(|| id.clone());
                Some(ImageMap::single(owner, id, surface).with_display_name(display_name))
            }
            MapRecord::Poster {
                id,
                name,
                surfaces,
                columns,
                rows,
            } => {
                if surfaces.is_empty() {
                    warn!("Dropping poster '{id}' of {owner}: it has no surfaces");
                    return None;
                }
                let grid = match (columns, rows) {
                    (Some(columns), Some(rows))
                        if GridSize::new(columns, rows).tile_count() == surfaces.len() =>
                    {
                        Some(GridSize::new(columns, rows))
                    }
                    (None, None) => {
                        warn!("Poster '{id}' of {owner} has no geometry, loading without it");
                        None
                    }
                    (columns, rows) => {
                        warn!(
                            "Poster '{id}' of {owner} has geometry {columns:?}x{rows:?} \
                             that does not match {} surfaces, loading without it",
                            surfaces.len()
                        );
                        None
                    }
                };
                let display_name = name.unwrap_or_else(|| id.clone());
                ImageMap::poster(owner, id, surfaces, grid)
                    .ok()
                    .map(|map| map.with_display_name(display_name))
            }
        }
    }
}

pub struct ImageRecordStore {
    owner: OwnerId,
    file_path: Option<PathBuf>,
    /// Set when the file exists but could not be read; every write fails
    unreadable: Option<String>,
    maps: Mutex<Vec<ImageMap>>,
}

impl ImageRecordStore {
    /// Store that never touches the disk
    pub fn ephemeral(owner: OwnerId) -> Self {
        Self {
            owner,
            file_path: None,
            unreadable: None,
            maps: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file(owner: OwnerId, file_path: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            file_path: Some(file_path.into()),
            unreadable: None,
            maps: Mutex::new(Vec::new()),
        }
    }

    /// Empty store over a file that exists but could not be read. It never
    /// writes, so the file keeps its content until someone looks at it.
    pub fn unreadable(
        owner: OwnerId,
        file_path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            unreadable: Some(reason.into()),
            ..Self::with_file(owner, file_path)
        }
    }

    /// Record file of `owner` inside `maps_dir`
    #[must_use]
    pub fn path_in(maps_dir: &Path, owner: OwnerId) -> PathBuf {
        maps_dir.join(format!("{owner}.{RECORD_EXTENSION}"))
    }

    /// Open the store backed by `file_path`, reading it when it exists.
    ///
    /// A file that is not UTF-8 or cannot be parsed is renamed to `<name>.corrupt` and the
    /// store starts empty, so the next save does not destroy it.
    pub fn load(owner: OwnerId, file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let store = Self::with_file(owner, &file_path);
        if !file_path.exists() {
            debug!("No record file for {owner} at {file_path:?}");
            return Ok(store);
        }

        let bytes = fs::read(&file_path).map_err(|e| MapError::persistence(&file_path, e))?;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(e) => {
                move_aside(&file_path, &e)?;
                return Ok(store);
            }
        };
        let record_file: RecordFile = match serde_yaml::from_str(&content) {
            Ok(record_file) => record_file,
            Err(e) => {
                move_aside(&file_path, &e)?;
                return Ok(store);
            }
        };

        if record_file.version > RECORD_VERSION {
            warn!(
                "Record file {file_path:?} has version {}, newer than {RECORD_VERSION}",
                record_file.version
            );
        }

        let mut maps: Vec<ImageMap> = Vec::with_capacity(record_file.maps.len());
        for value in record_file.maps {
            let record: MapRecord = match serde_yaml::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping malformed record in {file_path:?}: {e}");
                    continue;
                }
            };
            let Some(map) = record.into_map(owner) else {
                continue;
            };
            if maps.iter().any(|m| m.id == map.id) {
                warn!("Skipping duplicate map id '{}' in {file_path:?}", map.id);
                continue;
            }
            maps.push(map);
        }

        info!("Loaded {} maps for {owner}", maps.len());
        *store.lock() = maps;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ImageMap>> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Append `map` after checking both quotas, then persist.
    ///
    /// `global_used` is the number of surfaces held by every owner together;
    /// the caller is responsible for keeping it current.
    pub fn add_map(&self, map: ImageMap, quota: Quota, global_used: usize) -> Result<()> {
        if map.owner != self.owner {
            return Err(MapError::OwnerMismatch {
                id: map.id,
                owner: map.owner.to_string(),
                store_owner: self.owner.to_string(),
            });
        }

        let mut maps = self.lock();
        if maps.iter().any(|m| m.id == map.id) {
            return Err(MapError::NameTaken { name: map.id });
        }
        let owner_used = count_surfaces(&maps);
        quota.check(global_used, owner_used, map.surface_count())?;

        debug!("Adding map '{}' ({}) for {}", map.id, map.describe(), self.owner);
        maps.push(map);
        if let Err(e) = self.write(&maps) {
            maps.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Swap the entry with the same id for `map`, then persist
    pub fn replace_map(&self, map: ImageMap) -> Result<ImageMap> {
        let mut maps = self.lock();
        let slot = maps
            .iter_mut()
            .find(|m| m.id == map.id)
            .ok_or_else(|| MapError::not_found(&map.id))?;
        let previous = std::mem::replace(slot, map);
        self.write(&maps)?;
        Ok(previous)
    }

    pub fn delete_map(&self, id: &str) -> Result<ImageMap> {
        let mut maps = self.lock();
        let index = maps
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MapError::not_found(id))?;
        let removed = maps.remove(index);
        if let Err(e) = self.write(&maps) {
            maps.insert(index, removed);
            return Err(e);
        }
        debug!("Deleted map '{id}' of {}", self.owner);
        Ok(removed)
    }

    /// Give map `old_id` the id `new_id`. A display name that still equals
    /// the old id follows the rename.
    pub fn rename_map(&self, old_id: &str, new_id: &str) -> Result<ImageMap> {
        let mut maps = self.lock();
        if old_id != new_id && maps.iter().any(|m| m.id == new_id) {
            return Err(MapError::NameTaken {
                name: new_id.to_string(),
            });
        }
        let map = maps
            .iter_mut()
            .find(|m| m.id == old_id)
            .ok_or_else(|| MapError::not_found(old_id))?;
        map.id = new_id.to_string();
        if map.display_name == old_id {
            map.display_name = new_id.to_string();
        }
        let renamed = map.clone();
        self.write(&maps)?;
        Ok(renamed)
    }

    pub fn get_map(&self, id: &str) -> Option<ImageMap> {
        self.lock().iter().find(|m| m.id == id).cloned()
    }

    pub fn maps(&self) -> Vec<ImageMap> {
        self.lock().clone()
    }

    pub fn map_count(&self) -> usize {
        self.lock().len()
    }

    pub fn surface_count(&self) -> usize {
        count_surfaces(&self.lock())
    }

    pub fn matching_names(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|m| m.id.starts_with(prefix))
            .map(|m| m.id.clone())
            .collect()
    }

    /// `base` when free, otherwise the first free `base-2`, `base-3`, ...
    pub fn next_available_id(&self, base: &str) -> String {
        let maps = self.lock();
        let taken = |candidate: &str| maps.iter().any(|m| m.id == candidate);
        if !taken(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn manages_surface(&self, surface: SurfaceId) -> bool {
        self.lock().iter().any(|m| m.manages_surface(surface))
    }

    pub fn find_by_surface(&self, surface: SurfaceId) -> Option<ImageMap> {
        self.lock()
            .iter()
            .find(|m| m.manages_surface(surface))
            .cloned()
    }

    pub fn max_surface_id(&self) -> Option<SurfaceId> {
        self.lock()
            .iter()
            .flat_map(|m| m.surfaces().iter().copied())
            .max()
    }

    pub fn save(&self) -> Result<()> {
        let maps = self.lock();
        self.write(&maps)
    }

    fn write(&self, maps: &[ImageMap]) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        if let Some(reason) = &self.unreadable {
            return Err(MapError::persistence(
                path,
                io::Error::other(format!("record file could not be read earlier: {reason}")),
            ));
        }

        let records = maps
            .iter()
            .map(|map| serde_yaml::to_value(MapRecord::from_map(map)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| serialization_error(path, e))?;
        let content = serde_yaml::to_string(&RecordFile {
            version: RECORD_VERSION,
            maps: records,
        })
        .map_err(|e| serialization_error(path, e))?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| MapError::persistence(dir, e))?;

        let mut file = NamedTempFile::new_in(dir).map_err(|e| MapError::persistence(dir, e))?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| MapError::persistence(path, e))?;
        file.persist(path)
            .map_err(|e| MapError::persistence(path, e.error))?;

        debug!("Saved {} maps of {} to {path:?}", maps.len(), self.owner);
        Ok(())
    }
}

fn count_surfaces(maps: &[ImageMap]) -> usize {
    maps.iter().map(ImageMap::surface_count).sum()
}

fn move_aside(file_path: &Path, reason: &dyn std::fmt::Display) -> Result<()> {
    let aside = corrupt_path(file_path);
    warn!("Unreadable record file {file_path:?} ({reason}), moving it to {aside:?}");
    fs::rename(file_path, &aside).map_err(|e| MapError::persistence(file_path, e))
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(CORRUPT_SUFFIX);
    path.with_file_name(name)
}

fn serialization_error(path: &Path, e: serde_yaml::Error) -> MapError {
    MapError::Serialization {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn surfaces(ids: &[u32]) -> Vec<SurfaceId> {
        ids.iter().copied().map(SurfaceId::new).collect()
    }

    fn unlimited() -> Quota {
        Quota::default()
    }

    #[test]
    fn next_available_id_appends_counter() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        assert_eq!(store.next_available_id("sunset"), "sunset");

        store
            .add_map(ImageMap::single(owner, "sunset", SurfaceId::new(1)), unlimited(), 0)
            .unwrap();
        assert_eq!(store.next_available_id("sunset"), "sunset-2");

        store
            .add_map(ImageMap::single(owner, "sunset-2", SurfaceId::new(2)), unlimited(), 0)
            .unwrap();
        assert_eq!(store.next_available_id("sunset"), "sunset-3");
    }

    #[test]
    fn owner_quota_counts_surfaces() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        let quota = Quota {
            global_limit: 0,
            per_owner_limit: 5,
        };

        let poster = ImageMap::poster(owner, "wall", surfaces(&[1, 2, 3, 4]), Some(GridSize::new(2, 2)))
            .unwrap();
        store.add_map(poster, quota, 0).unwrap();

        let err = store
            .add_map(
                ImageMap::poster(owner, "wide", surfaces(&[5, 6]), Some(GridSize::new(2, 1))).unwrap(),
                quota,
                4,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::QuotaExceeded {
                scope: QuotaScope::Owner
            }
        ));

        store
            .add_map(ImageMap::single(owner, "one", SurfaceId::new(5)), quota, 4)
            .unwrap();
        assert_eq!(store.surface_count(), 5);
    }

    #[test]
    fn global_quota_is_checked_first() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        let quota = Quota {
            global_limit: 3,
            per_owner_limit: 1,
        };
        let err = store
            .add_map(
                ImageMap::poster(owner, "big", surfaces(&[1, 2]), Some(GridSize::new(2, 1))).unwrap(),
                quota,
                2,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MapError::QuotaExceeded {
                scope: QuotaScope::Global
            }
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        store
            .add_map(ImageMap::single(owner, "a", SurfaceId::new(1)), unlimited(), 0)
            .unwrap();
        let err = store
            .add_map(ImageMap::single(owner, "a", SurfaceId::new(2)), unlimited(), 0)
            .unwrap_err();
        assert!(matches!(err, MapError::NameTaken { .. }));
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        store
            .add_map(ImageMap::single(owner, "gone", SurfaceId::new(1)), unlimited(), 0)
            .unwrap();
        store.delete_map("gone").unwrap();
        assert!(store.get_map("gone").is_none());
        assert!(matches!(store.delete_map("gone"), Err(MapError::MapNotFound { .. })));
    }

    #[test]
    fn rename_moves_id_and_default_display_name() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        store
            .add_map(ImageMap::single(owner, "a", SurfaceId::new(1)), unlimited(), 0)
            .unwrap();
        store
            .add_map(ImageMap::single(owner, "b", SurfaceId::new(2)), unlimited(), 0)
            .unwrap();

        assert!(matches!(store.rename_map("a", "b"), Err(MapError::NameTaken { .. })));
        assert!(matches!(store.rename_map("zzz", "c"), Err(MapError::MapNotFound { .. })));

        let renamed = store.rename_map("a", "c").unwrap();
        assert_eq!(renamed.id, "c");
        assert_eq!(renamed.display_name, "c");
        assert!(store.get_map("a").is_none());
    }

    #[test]
    fn matching_names_filters_by_prefix() {
        let owner = OwnerId::random();
        let store = ImageRecordStore::ephemeral(owner);
        for (i, id) in ["sunset", "sunrise", "moon"].iter().enumerate() {
            store
                .add_map(ImageMap::single(owner, *id, SurfaceId::new(i as u32 + 1)), unlimited(), 0)
                .unwrap();
        }
        let mut names = store.matching_names("sun");
        names.sort();
        assert_eq!(names, vec!["sunrise", "sunset"]);
    }

    #[test]
    fn persisted_file_reloads_exactly() {
        let temp_dir = TempDir::new().unwrap();
        let owner = OwnerId::random();
        let path = ImageRecordStore::path_in(temp_dir.path(), owner);

        let store = ImageRecordStore::with_file(owner, &path);
        let single = ImageMap::single(owner, "sunset", SurfaceId::new(12)).with_display_name("Sunset");
        let poster =
            ImageMap::poster(owner, "wall", surfaces(&[13, 14, 15, 16]), Some(GridSize::new(2, 2)))
                .unwrap();
        store.add_map(single.clone(), unlimited(), 0).unwrap();
        store.add_map(poster.clone(), unlimited(), 0).unwrap();

        let reloaded = ImageRecordStore::load(owner, &path).unwrap();
        assert_eq!(reloaded.maps(), vec![single, poster]);
    }

    #[test]
    fn poster_without_geometry_loads_degraded() {
        let temp_dir = TempDir::new().unwrap();
        let owner = OwnerId::random();
        let path = ImageRecordStore::path_in(temp_dir.path(), owner);
        fs::write(
            &path,
            "maps:\n\
             - type: poster\n  id: old\n  surfaces: [1, 2, 3]\n\
             - type: poster\n  id: odd\n  surfaces: [4, 5, 6]\n  columns: 2\n  rows: 2\n\
             - type: poster\n  id: empty\n  surfaces: []\n",
        )
        .unwrap();

        let store = ImageRecordStore::load(owner, &path).unwrap();
        let maps = store.maps();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].grid(), None);
        assert_eq!(maps[0].display_name, "old");
        assert_eq!(maps[1].grid(), None);
        assert_eq!(maps[1].surface_count(), 3);
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let owner = OwnerId::random();
        let path = ImageRecordStore::path_in(temp_dir.path(), owner);
        fs::write(&path, "maps: [this is: not: valid").unwrap();

        let store = ImageRecordStore::load(owner, &path).unwrap();
        assert_eq!(store.map_count(), 0);
        assert!(!path.exists());
        assert!(corrupt_path(&path).exists());
    }

    #[test]
    fn non_utf8_file_is_moved_aside_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let owner = OwnerId::random();
        let path = ImageRecordStore::path_in(temp_dir.path(), owner);
        let original = b"version: 1\nmaps:\n  - type: single\n    id: caf\xe9\n    surface: 3\n".to_vec();
        fs::write(&path, &original).unwrap();

        let store = ImageRecordStore::load(owner, &path).unwrap();
        assert_eq!(store.map_count(), 0);
        assert_eq!(fs::read(corrupt_path(&path)).unwrap(), original);

        store
            .add_map(ImageMap::single(owner, "fresh", SurfaceId::new(9)), unlimited(), 0)
            .unwrap();
        assert!(path.exists());
        assert_eq!(fs::read(corrupt_path(&path)).unwrap(), original);
    }

    #[test]
    fn unreadable_store_refuses_to_write() {
        let temp_dir = TempDir::new().unwrap();
        let owner = OwnerId::random();
        let path = ImageRecordStore::path_in(temp_dir.path(), owner);
        fs::write(&path, "keep me").unwrap();

        let store = ImageRecordStore::unreadable(owner, &path, "permission denied");
        let err = store
            .add_map(ImageMap::single(owner, "a", SurfaceId::new(1)), unlimited(), 0)
            .unwrap_err();
        assert!(matches!(err, MapError::PersistenceFailed { .. }));
        assert_eq!(store.map_count(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn maps_of_another_owner_are_refused() {
        let store = ImageRecordStore::ephemeral(OwnerId::random());
        let stranger = OwnerId::random();
        let err = store
            .add_map(ImageMap::single(stranger, "a", SurfaceId::new(1)), unlimited(), 0)
            .unwrap_err();
        assert!(matches!(err, MapError::OwnerMismatch { ref id, .. } if id == "a"));
        assert_eq!(store.map_count(), 0);
    }
}
