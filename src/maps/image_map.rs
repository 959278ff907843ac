//! Catalogue entries: single-surface maps and tiled posters

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MapError, Result};
use crate::images::GridSize;

/// Numeric identifier of a host display surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(u32);

impl SurfaceId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for SurfaceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SurfaceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Owner of a catalogue, normally a player UUID
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for OwnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapKind {
    Single {
        surface: SurfaceId,
    },
    /// Row-major tiles. `grid` is `None` for records saved without geometry.
    Poster {
        surfaces: Vec<SurfaceId>,
        grid: Option<GridSize>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageMap {
    pub id: String,
    pub owner: OwnerId,
    pub display_name: String,
    pub kind: MapKind,
}

impl ImageMap {
    pub fn single(owner: OwnerId, id: impl Into<String>, surface: SurfaceId) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            owner,
            kind: MapKind::Single { surface },
        }
    }

    /// A poster laid out on `grid`; the surface count must match the grid area
    pub fn poster(
        owner: OwnerId,
        id: impl Into<String>,
        surfaces: Vec<SurfaceId>,
        grid: Option<GridSize>,
    ) -> Result<Self> {
        if surfaces.is_empty() {
            return Err(MapError::transform("a poster needs at least one surface"));
        }
        if let Some(grid) = grid {
            if grid.tile_count() != surfaces.len() {
                return Err(MapError::transform(format!(
                    "poster grid {grid} does not match {} surfaces",
                    surfaces.len()
                )));
            }
        }
        let id = id.into();
        Ok(Self {
            display_name: id.clone(),
            id,
            owner,
            kind: MapKind::Poster { surfaces, grid },
        })
    }

    /// Build the right variant for freshly rendered tiles: one tile gives a
    /// single map, more give a poster.
    pub fn from_tiles(
        owner: OwnerId,
        id: impl Into<String>,
        surfaces: Vec<SurfaceId>,
        grid: GridSize,
    ) -> Result<Self> {
        match surfaces.as_slice() {
            [surface] if grid.is_single() => Ok(Self::single(owner, id, *surface)),
            _ => Self::poster(owner, id, surfaces, Some(grid)),
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn surfaces(&self) -> &[SurfaceId] {
        match &self.kind {
            MapKind::Single { surface } => std::slice::from_ref(surface),
            MapKind::Poster { surfaces, .. } => surfaces,
        }
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces().len()
    }

    pub fn manages_surface(&self, surface: SurfaceId) -> bool {
        self.surfaces().contains(&surface)
    }

    pub fn is_single(&self) -> bool {
        matches!(self.kind, MapKind::Single { .. })
    }

    /// Tile layout, `None` for a poster without geometry
    pub fn grid(&self) -> Option<GridSize> {
        match &self.kind {
            MapKind::Single { .. } => Some(GridSize::SINGLE),
            MapKind::Poster { grid, .. } => *grid,
        }
    }

    pub fn surface_at(&self, column: u32, row: u32) -> Option<SurfaceId> {
        let index = self.grid()?.index_of(column, row)?;
        self.surfaces().get(index).copied()
    }

    /// `(column, row)` of `surface` inside this map
    pub fn position_of(&self, surface: SurfaceId) -> Option<(u32, u32)> {
        let grid = self.grid()?;
        let index = self.surfaces().iter().position(|s| *s == surface)?;
        Some((grid.column_at(index), grid.row_at(index)))
    }

    /// Short description used in listings, e.g. `single map` or `poster (3x2)`
    pub fn describe(&self) -> String {
        match &self.kind {
            MapKind::Single { .. } => "single map".to_string(),
            MapKind::Poster {
                grid: Some(grid), ..
            } => format!("poster ({grid})"),
            MapKind::Poster { surfaces, grid: None } => {
                format!("poster ({} parts)", surfaces.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<u32>) -> Vec<SurfaceId> {
        range.map(SurfaceId::new).collect()
    }

    #[test]
    fn one_tile_makes_a_single_map() {
        let owner = OwnerId::random();
        let map = ImageMap::from_tiles(owner, "sunset", ids(7..8), GridSize::SINGLE).unwrap();
        assert!(map.is_single());
        assert_eq!(map.surfaces(), &[SurfaceId::new(7)]);
        assert_eq!(map.display_name, "sunset");
    }

    #[test]
    fn poster_positions_are_row_major() {
        let owner = OwnerId::random();
        let map = ImageMap::from_tiles(owner, "wall", ids(10..16), GridSize::new(3, 2)).unwrap();
        assert!(!map.is_single());
        assert_eq!(map.surface_at(0, 0), Some(SurfaceId::new(10)));
        assert_eq!(map.surface_at(2, 0), Some(SurfaceId::new(12)));
        assert_eq!(map.surface_at(0, 1), Some(SurfaceId::new(13)));
        assert_eq!(map.position_of(SurfaceId::new(14)), Some((1, 1)));
        assert_eq!(map.describe(), "poster (3x2)");
    }

    #[test]
    fn poster_rejects_mismatched_grid() {
        let owner = OwnerId::random();
        assert!(ImageMap::poster(owner, "bad", ids(1..4), Some(GridSize::new(2, 2))).is_err());
        assert!(ImageMap::poster(owner, "empty", Vec::new(), None).is_err());
    }

    #[test]
    fn poster_without_geometry_has_no_positions() {
        let owner = OwnerId::random();
        let map = ImageMap::poster(owner, "old", ids(1..5), None).unwrap();
        assert_eq!(map.grid(), None);
        assert_eq!(map.position_of(SurfaceId::new(2)), None);
        assert!(map.manages_surface(SurfaceId::new(4)));
        assert_eq!(map.describe(), "poster (4 parts)");
    }

    #[test]
    fn owner_id_round_trips_through_text() {
        let owner = OwnerId::random();
        let parsed: OwnerId = owner.to_string().parse().unwrap();
        assert_eq!(parsed, owner);
        assert!("not-a-uuid".parse::<OwnerId>().is_err());
    }
}
