//! Items handed to an inventory for placing maps in the world

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::Serialize;

use crate::host::Inventory;
use crate::images::GridSize;
use crate::maps::{ImageMap, MapKind, OwnerId, SurfaceId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MapItem {
    Single {
        surface: SurfaceId,
        title: String,
    },
    /// One item that places a whole poster at once
    Poster {
        map_id: String,
        surfaces: Vec<SurfaceId>,
        grid: GridSize,
        title: String,
    },
    /// One tile of a poster
    Part {
        surface: SurfaceId,
        index: usize,
        title: String,
    },
}

impl MapItem {
    pub fn title(&self) -> &str {
        match self {
            MapItem::Single { title, .. }
            | MapItem::Poster { title, .. }
            | MapItem::Part { title, .. } => title,
        }
    }

    pub fn surfaces(&self) -> &[SurfaceId] {
        match self {
            MapItem::Single { surface, .. } | MapItem::Part { surface, .. } => {
                std::slice::from_ref(surface)
            }
            MapItem::Poster { surfaces, .. } => surfaces,
        }
    }

    pub fn holds_any(&self, surfaces: &[SurfaceId]) -> bool {
        self.surfaces().iter().any(|s| surfaces.contains(s))
    }
}

#[must_use]
pub fn part_title(name: &str, row: u32, column: u32) -> String {
    format!("{name} (row {}, column {})", row + 1, column + 1)
}

/// One item per tile. Posters with a layout get row and column titles,
/// the others are numbered.
pub fn poster_parts(map: &ImageMap) -> Vec<MapItem> {
    let grid = map.grid();
    map.surfaces()
        .iter()
        .enumerate()
        .map(|(index, surface)| MapItem::Part {
            surface: *surface,
            index,
            title: match grid {
                Some(grid) => part_title(&map.display_name, grid.row_at(index), grid.column_at(index)),
                None => format!("{} (part {})", map.display_name, index + 1),
            },
        })
        .collect()
}

/// Items a holder receives for `map`
pub fn items_for(map: &ImageMap) -> Vec<MapItem> {
    match &map.kind {
        MapKind::Single { surface } => vec![MapItem::Single {
            surface: *surface,
            title: map.display_name.clone(),
        }],
        MapKind::Poster {
            surfaces,
            grid: Some(grid),
        } => vec![MapItem::Poster {
            map_id: map.id.clone(),
            surfaces: surfaces.clone(),
            grid: *grid,
            title: map.display_name.clone(),
        }],
        MapKind::Poster { grid: None, .. } => poster_parts(map),
    }
}

/// Items waiting for room in their owner's inventory
#[derive(Debug, Default)]
pub struct ItemOverflow {
    queues: Mutex<HashMap<OwnerId, VecDeque<MapItem>>>,
}

impl ItemOverflow {
    fn queues(&self) -> MutexGuard<'_, HashMap<OwnerId, VecDeque<MapItem>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, owner: OwnerId, item: MapItem) {
        self.queues().entry(owner).or_default().push_back(item);
    }

    fn push_front(&self, owner: OwnerId, item: MapItem) {
        self.queues().entry(owner).or_default().push_front(item);
    }

    pub fn pop(&self, owner: OwnerId) -> Option<MapItem> {
        let mut queues = self.queues();
        let queue = queues.get_mut(&owner)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&owner);
        }
        item
    }

    pub fn pending(&self, owner: OwnerId) -> usize {
        self.queues().get(&owner).map_or(0, VecDeque::len)
    }

    pub fn clear(&self) {
        self.queues().clear();
    }
}

/// Give the items of `map`; the ones that do not fit are queued. Returns
/// true when every item went into the inventory.
pub fn give_map(
    inventory: &mut dyn Inventory,
    map: &ImageMap,
    overflow: &ItemOverflow,
    owner: OwnerId,
) -> bool {
    let mut all_given = true;
    for item in items_for(map) {
        if let Err(item) = inventory.give(item) {
            debug!("Inventory of {owner} is full, queueing '{}'", item.title());
            overflow.push(owner, item);
            all_given = false;
        }
    }
    all_given
}

/// Move queued items into the inventory while it has room
pub fn give_remaining(inventory: &mut dyn Inventory, overflow: &ItemOverflow, owner: OwnerId) -> usize {
    let mut given = 0;
    while inventory.has_space() {
        let Some(item) = overflow.pop(owner) else {
            break;
        };
        if let Err(item) = inventory.give(item) {
            overflow.push_front(owner, item);
            break;
        }
        given += 1;
    }
    given
}

/// Empty every slot holding a surface of `map`. Returns the number of
/// slots cleared.
pub fn clear_surfaces_from_inventory(inventory: &mut dyn Inventory, map: &ImageMap) -> usize {
    let surfaces = map.surfaces();
    let mut cleared = 0;
    for index in 0..inventory.capacity() {
        if inventory.slot(index).is_some_and(|item| item.holds_any(surfaces)) {
            inventory.take_slot(index);
            cleared += 1;
        }
    }
    cleared
}
