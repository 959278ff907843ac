//! In-process host without a game server behind it
//!
//! Surfaces are plain counters and painted tiles are kept in memory. The
//! admin binary uses it to render maps offline and the tests use it to watch
//! what the pipeline draws.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use super::{Inventory, LiveSurface, SurfaceHost};
use crate::error::{MapError, Result};
use crate::images::IndexedTile;
use crate::items::MapItem;
use crate::maps::SurfaceId;

#[derive(Default)]
struct Surfaces {
    allocated: HashSet<SurfaceId>,
    painted: HashMap<SurfaceId, IndexedTile>,
    paint_counts: HashMap<SurfaceId, usize>,
}

pub struct HeadlessHost {
    next_id: AtomicU32,
    surfaces: Arc<Mutex<Surfaces>>,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessHost {
    /// Host whose first allocated surface is 1
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    #[must_use]
    pub fn starting_at(first_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(first_id.max(1)),
            surfaces: Arc::new(Mutex::new(Surfaces::default())),
        }
    }

    fn surfaces(&self) -> MutexGuard<'_, Surfaces> {
        self.surfaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark surfaces created in an earlier session as existing, and make sure
    /// new ids are allocated past them
    pub fn adopt_surfaces(&self, ids: impl IntoIterator<Item = SurfaceId>) {
        let mut surfaces = self.surfaces();
        for id in ids {
            surfaces.allocated.insert(id);
            self.next_id
                .fetch_max(id.get().saturating_add(1), Ordering::SeqCst);
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.surfaces().allocated.len()
    }

    /// Last tile painted onto `id`
    pub fn painted(&self, id: SurfaceId) -> Option<IndexedTile> {
        self.surfaces().painted.get(&id).cloned()
    }

    pub fn paint_count(&self, id: SurfaceId) -> usize {
        self.surfaces().paint_counts.get(&id).copied().unwrap_or(0)
    }
}

impl SurfaceHost for HeadlessHost {
    fn allocate_surface_id(&self) -> Result<SurfaceId> {
        let raw = self.next_id.fetch_add(1, Ordering::SeqCst);
        if raw == u32::MAX {
            return Err(MapError::SurfaceUnavailable(
                "no surface ids left".to_string(),
            ));
        }
        let id = SurfaceId::new(raw);
        self.surfaces().allocated.insert(id);
        debug!("Allocated surface {id}");
        Ok(id)
    }

    fn surface_exists(&self, id: SurfaceId) -> bool {
        self.surfaces().allocated.contains(&id)
    }

    fn install_live_surface(&self, id: SurfaceId) -> Result<Box<dyn LiveSurface>> {
        if !self.surface_exists(id) {
            return Err(MapError::SurfaceUnavailable(format!(
                "surface {id} does not exist"
            )));
        }
        Ok(Box::new(HeadlessSurface {
            id,
            surfaces: self.surfaces.clone(),
        }))
    }

    fn release_surface(&self, id: SurfaceId) {
        let mut surfaces = self.surfaces();
        surfaces.allocated.remove(&id);
        surfaces.painted.remove(&id);
        debug!("Released surface {id}");
    }
}

struct HeadlessSurface {
    id: SurfaceId,
    surfaces: Arc<Mutex<Surfaces>>,
}

impl LiveSurface for HeadlessSurface {
    fn id(&self) -> SurfaceId {
        self.id
    }

    fn paint(&mut self, tile: &IndexedTile) -> Result<()> {
        let mut surfaces = self.surfaces.lock().unwrap_or_else(PoisonError::into_inner);
        if !surfaces.allocated.contains(&self.id) {
            return Err(MapError::SurfaceUnavailable(format!(
                "surface {} was released",
                self.id
            )));
        }
        surfaces.painted.insert(self.id, tile.clone());
        *surfaces.paint_counts.entry(self.id).or_default() += 1;
        Ok(())
    }
}

/// Fixed number of item slots
#[derive(Clone, Debug, Default)]
pub struct SlotInventory {
    slots: Vec<Option<MapItem>>,
}

impl SlotInventory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &MapItem> {
        self.slots.iter().flatten()
    }
}

impl Inventory for SlotInventory {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Option<&MapItem> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn take_slot(&mut self, index: usize) -> Option<MapItem> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    fn give(&mut self, item: MapItem) -> std::result::Result<(), MapItem> {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(item);
                Ok(())
            }
            None => Err(item),
        }
    }
}
