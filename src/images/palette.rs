//! Indexed colour palette of host surfaces
//!
//! Surfaces only show a fixed set of colours: 62 base colours, each in four
//! shades. The first base colour is "none", so indices 0 to 3 are transparent.

use std::num::NonZeroUsize;

use image::{Rgba, RgbaImage};
use lru::LruCache;
use rayon::prelude::*;

/// Palette index drawn as a transparent pixel
pub const TRANSPARENT: u8 = 0;

/// Pixels with less alpha than this are drawn transparent
const ALPHA_THRESHOLD: u8 = 128;

/// Brightness multipliers (out of 255) for the four shades of a base colour
const SHADES: [u32; 4] = [180, 220, 255, 135];

const MATCH_CACHE_CAPACITY: usize = 4096;

#[rustfmt::skip]
const BASE_COLOURS: [[u8; 3]; 62] = [
    [0, 0, 0],       // none
    [127, 178, 56],  [247, 233, 163], [199, 199, 199], [255, 0, 0],
    [160, 160, 255], [167, 167, 167], [0, 124, 0],     [255, 255, 255],
    [164, 168, 184], [151, 109, 77],  [112, 112, 112], [64, 64, 255],
    [143, 119, 72],  [255, 252, 245], [216, 127, 51],  [178, 76, 216],
    [102, 153, 216], [229, 229, 51],  [127, 204, 25],  [242, 127, 165],
    [76, 76, 76],    [153, 153, 153], [76, 127, 153],  [127, 63, 178],
    [51, 76, 178],   [102, 76, 51],   [102, 127, 51],  [153, 51, 51],
    [25, 25, 25],    [250, 238, 77],  [92, 219, 213],  [74, 128, 255],
    [0, 217, 58],    [129, 86, 49],   [112, 2, 0],     [209, 177, 161],
    [159, 82, 36],   [149, 87, 108],  [112, 108, 138], [186, 133, 36],
    [103, 117, 53],  [160, 77, 78],   [57, 41, 35],    [135, 107, 98],
    [87, 92, 92],    [122, 73, 88],   [76, 62, 92],    [76, 50, 35],
    [76, 82, 42],    [142, 60, 46],   [37, 22, 16],    [189, 48, 49],
    [148, 63, 97],   [92, 25, 29],    [22, 126, 134],  [58, 142, 140],
    [86, 44, 62],    [20, 180, 133],  [100, 100, 100], [216, 175, 147],
    [127, 167, 150],
];

/// A tile reduced to palette indices, row-major
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedTile {
    width: u32,
    height: u32,
    indices: Vec<u8>,
}

impl IndexedTile {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn indices(&self) -> &[u8] {
        &self.indices
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.indices
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

#[derive(Clone, Debug)]
pub struct Palette {
    colours: Vec<[u8; 3]>,
}

impl Default for Palette {
    fn default() -> Self {
        Self::minecraft()
    }
}

impl Palette {
    #[must_use]
    pub fn minecraft() -> Self {
        let colours = BASE_COLOURS
            .iter()
            .flat_map(|base| {
                SHADES.iter().map(move |&shade| {
                    [
                        (u32::from(base[0]) * shade / 255) as u8,
                        (u32::from(base[1]) * shade / 255) as u8,
                        (u32::from(base[2]) * shade / 255) as u8,
                    ]
                })
            })
            .collect();
        Self { colours }
    }

    pub fn len(&self) -> usize {
        self.colours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colours.is_empty()
    }

    /// Colour shown for `index`; transparent indices give a clear pixel
    #[must_use]
    pub fn colour(&self, index: u8) -> Option<Rgba<u8>> {
        if is_transparent(index) {
            return Some(Rgba([0, 0, 0, 0]));
        }
        self.colours
            .get(index as usize)
            .map(|[r, g, b]| Rgba([*r, *g, *b, 255]))
    }

    /// Nearest palette index for a single pixel
    #[must_use]
    pub fn match_pixel(&self, pixel: Rgba<u8>) -> u8 {
        if pixel[3] < ALPHA_THRESHOLD {
            return TRANSPARENT;
        }
        self.nearest([pixel[0], pixel[1], pixel[2]])
    }

    fn nearest(&self, rgb: [u8; 3]) -> u8 {
        let mut best = (usize::MAX, u64::MAX);
        // Skip the transparent shades of "none".
        for (index, colour) in self.colours.iter().enumerate().skip(SHADES.len()) {
            let distance = redmean_distance(rgb, *colour);
            if distance < best.1 {
                best = (index, distance);
                if distance == 0 {
                    break;
                }
            }
        }
        best.0 as u8
    }

    pub fn map_tile(&self, tile: &RgbaImage) -> IndexedTile {
        let mut cache: LruCache<u32, u8> = LruCache::new(
            NonZeroUsize::new(MATCH_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        );

        let indices = tile
            .pixels()
            .map(|pixel| {
                if pixel[3] < ALPHA_THRESHOLD {
                    return TRANSPARENT;
                }
                let key = u32::from_be_bytes([0, pixel[0], pixel[1], pixel[2]]);
                if let Some(index) = cache.get(&key) {
                    return *index;
                }
                let index = self.nearest([pixel[0], pixel[1], pixel[2]]);
                cache.put(key, index);
                index
            })
            .collect();

        IndexedTile {
            width: tile.width(),
            height: tile.height(),
            indices,
        }
    }

    /// Map a batch of tiles in parallel, keeping their order
    pub fn map_tiles(&self, tiles: &[RgbaImage]) -> Vec<IndexedTile> {
        tiles.par_iter().map(|tile| self.map_tile(tile)).collect()
    }

    /// Expand an indexed tile back to RGBA
    pub fn to_rgba(&self, tile: &IndexedTile) -> RgbaImage {
        RgbaImage::from_fn(tile.width, tile.height, |x, y| {
            tile.get(x, y)
                .and_then(|index| self.colour(index))
                .unwrap_or(Rgba([0, 0, 0, 0]))
        })
    }
}

#[must_use]
pub fn is_transparent(index: u8) -> bool {
    (index as usize) < SHADES.len()
}

fn redmean_distance(a: [u8; 3], b: [u8; 3]) -> u64 {
    let mean_red = (i64::from(a[0]) + i64::from(b[0])) / 2;
    let dr = i64::from(a[0]) - i64::from(b[0]);
    let dg = i64::from(a[1]) - i64::from(b[1]);
    let db = i64::from(a[2]) - i64::from(b[2]);
    let distance = (((512 + mean_red) * dr * dr) >> 8) + 4 * dg * dg + (((767 - mean_red) * db * db) >> 8);
    distance as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_has_four_shades_per_base_colour() {
        let palette = Palette::minecraft();
        assert_eq!(palette.len(), 62 * 4);
        // Grass at full brightness
        assert_eq!(palette.colour(6), Some(Rgba([127, 178, 56, 255])));
        // Grass darkest shade
        assert_eq!(palette.colour(7), Some(Rgba([67, 94, 29, 255])));
    }

    #[test]
    fn low_alpha_is_transparent() {
        let palette = Palette::minecraft();
        assert_eq!(palette.match_pixel(Rgba([255, 0, 0, 0])), TRANSPARENT);
        assert_eq!(palette.match_pixel(Rgba([255, 0, 0, 127])), TRANSPARENT);
        assert_ne!(palette.match_pixel(Rgba([255, 0, 0, 128])), TRANSPARENT);
    }

    #[test]
    fn exact_colours_match_themselves() {
        let palette = Palette::minecraft();
        assert_eq!(palette.match_pixel(Rgba([127, 178, 56, 255])), 6);
        assert_eq!(palette.match_pixel(Rgba([255, 255, 255, 255])), 34);
        assert_eq!(palette.match_pixel(Rgba([255, 0, 0, 255])), 18);
    }

    #[test]
    fn near_colours_snap_to_nearest() {
        let palette = Palette::minecraft();
        assert_eq!(palette.match_pixel(Rgba([252, 253, 254, 255])), 34);
        let index = palette.match_pixel(Rgba([0, 0, 0, 255]));
        assert!(!is_transparent(index));
    }

    #[test]
    fn map_tile_keeps_layout() {
        let palette = Palette::minecraft();
        let tile = RgbaImage::from_fn(4, 2, |x, _| {
            if x < 2 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let indexed = palette.map_tile(&tile);
        assert_eq!(indexed.indices(), &[34, 34, 0, 0, 34, 34, 0, 0]);

        let back = palette.to_rgba(&indexed);
        assert_eq!(*back.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        assert_eq!(back.get_pixel(3, 1)[3], 0);
    }

    #[test]
    fn parallel_mapping_preserves_order() {
        let palette = Palette::minecraft();
        let tiles: Vec<RgbaImage> = [[255, 0, 0], [255, 255, 255], [127, 178, 56]]
            .iter()
            .map(|&[r, g, b]| RgbaImage::from_pixel(2, 2, Rgba([r, g, b, 255])))
            .collect();
        let mapped = palette.map_tiles(&tiles);
        assert_eq!(mapped[0].get(0, 0), Some(18));
        assert_eq!(mapped[1].get(1, 1), Some(34));
        assert_eq!(mapped[2].get(1, 0), Some(6));
    }
}
