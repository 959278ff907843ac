//! Seams to the host platform
//!
//! The host owns the numbered display surfaces and a single main thread.
//! Surfaces are only allocated, installed, painted and released from that
//! thread; everything else reaches it through [`MainThread`].

pub mod headless;
pub mod main_thread;

use crate::error::Result;
use crate::images::IndexedTile;
use crate::items::MapItem;
use crate::maps::SurfaceId;

pub use headless::{HeadlessHost, SlotInventory};
pub use main_thread::{MainThreadHandle, TickQueue, call_on_main, call_on_main_or_undo};

/// Unit of work scheduled on the host main thread
pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

pub trait SurfaceHost: Send + Sync {
    /// Reserve a fresh surface id. Main thread only.
    fn allocate_surface_id(&self) -> Result<SurfaceId>;

    fn surface_exists(&self, id: SurfaceId) -> bool;

    /// Attach a drawable to surface `id`. Main thread only.
    fn install_live_surface(&self, id: SurfaceId) -> Result<Box<dyn LiveSurface>>;

    /// Give `id` back to the host. Main thread only.
    fn release_surface(&self, id: SurfaceId);
}

/// Drawable attached to one surface
pub trait LiveSurface: Send {
    fn id(&self) -> SurfaceId;

    /// Replace the whole surface with `tile` and schedule a repaint
    fn paint(&mut self, tile: &IndexedTile) -> Result<()>;
}

pub trait MainThread: Send + Sync {
    fn run_on_main_thread(&self, task: MainTask);

    fn run_on_main_thread_after(&self, ticks: u32, task: MainTask);
}

/// Slots of a holder that can receive map items
pub trait Inventory {
    fn capacity(&self) -> usize;

    fn slot(&self, index: usize) -> Option<&MapItem>;

    fn take_slot(&mut self, index: usize) -> Option<MapItem>;

    /// Put `item` into the first free slot, or hand it back when full
    fn give(&mut self, item: MapItem) -> std::result::Result<(), MapItem>;

    fn has_space(&self) -> bool {
        (0..self.capacity()).any(|i| self.slot(i).is_none())
    }
}
