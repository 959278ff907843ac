//! Scaling and slicing of a source raster into a grid of surface tiles

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use fast_image_resize as fr;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};

/// How the source is fitted onto the tile canvas
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ScalingPolicy {
    /// Keep the native size; the source is centred on the canvas
    #[default]
    None,
    /// Fit entirely inside the canvas, keeping the aspect ratio
    Contained,
    /// Fill the canvas exactly, ignoring the aspect ratio
    Stretched,
    /// Cover the whole canvas, keeping the aspect ratio and cropping overflow
    Covered,
}

impl ScalingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingPolicy::None => "none",
            ScalingPolicy::Contained => "contained",
            ScalingPolicy::Stretched => "stretched",
            ScalingPolicy::Covered => "covered",
        }
    }

    #[must_use]
    pub fn resamples(&self) -> bool {
        !matches!(self, ScalingPolicy::None)
    }
}

impl fmt::Display for ScalingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalingPolicy {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ScalingPolicy::None),
            "resize" | "contain" | "contained" => Ok(ScalingPolicy::Contained),
            "stretch" | "stretched" | "resize-stretched" => Ok(ScalingPolicy::Stretched),
            "cover" | "covered" | "resize-covered" => Ok(ScalingPolicy::Covered),
            other => Err(MapError::InvalidSource(format!(
                "invalid stretching mode: {other}"
            ))),
        }
    }
}

/// Tile grid of a poster, in surfaces
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    pub columns: u32,
    pub rows: u32,
}

impl GridSize {
    pub const SINGLE: GridSize = GridSize {
        columns: 1,
        rows: 1,
    };

    #[must_use]
    pub const fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    #[must_use]
    pub fn is_single(&self) -> bool {
        self.columns == 1 && self.rows == 1
    }

    #[must_use]
    pub fn column_at(&self, index: usize) -> u32 {
        (index % self.columns.max(1) as usize) as u32
    }

    #[must_use]
    pub fn row_at(&self, index: usize) -> u32 {
        (index / self.columns.max(1) as usize) as u32
    }

    /// Row-major index of the tile at `(column, row)`
    #[must_use]
    pub fn index_of(&self, column: u32, row: u32) -> Option<usize> {
        if column >= self.columns || row >= self.rows {
            return None;
        }
        Some(row as usize * self.columns as usize + column as usize)
    }

    /// Pick the grid for a source of `source` pixels.
    ///
    /// Explicit counts win. When only one count is given the other follows the
    /// source aspect ratio. With no counts, an unscaled source is split at its
    /// native size and a scaled one goes onto a single tile.
    #[must_use]
    pub fn resolve(
        source: (u32, u32),
        explicit: Option<GridSize>,
        tile_resolution: u32,
        policy: ScalingPolicy,
    ) -> GridSize {
        let (width, height) = (source.0.max(1) as f64, source.1.max(1) as f64);
        let explicit = explicit.unwrap_or(GridSize::new(0, 0));

        match (explicit.columns, explicit.rows) {
            (0, 0) if policy.resamples() => GridSize::SINGLE,
            (0, 0) => {
                let res = tile_resolution.max(1);
                GridSize::new(source.0.div_ceil(res).max(1), source.1.div_ceil(res).max(1))
            }
            (columns, 0) => {
                let rows = (columns as f64 * height / width).round() as u32;
                GridSize::new(columns, rows.max(1))
            }
            (0, rows) => {
                let columns = (rows as f64 * width / height).round() as u32;
                GridSize::new(columns.max(1), rows)
            }
            (columns, rows) => GridSize::new(columns, rows),
        }
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.columns, self.rows)
    }
}

/// Size and offset of the scaled source on the canvas. For
/// [`ScalingPolicy::Covered`] only the visible part is placed, so the
/// placement is the canvas itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub width: u32,
    pub height: u32,
    pub x: i64,
    pub y: i64,
}

#[must_use]
pub fn placement(source: (u32, u32), canvas: (u32, u32), policy: ScalingPolicy) -> Placement {
    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let (canvas_w, canvas_h) = canvas;
    let scale_x = canvas_w as f64 / src_w as f64;
    let scale_y = canvas_h as f64 / src_h as f64;

    let (width, height) = match policy {
        ScalingPolicy::None => (src_w, src_h),
        ScalingPolicy::Stretched | ScalingPolicy::Covered => (canvas_w, canvas_h),
        ScalingPolicy::Contained => {
            let scale = scale_x.min(scale_y);
            (
                ((src_w as f64 * scale).round() as u32).clamp(1, canvas_w),
                ((src_h as f64 * scale).round() as u32).clamp(1, canvas_h),
            )
        }
    };

    Placement {
        width,
        height,
        x: (i64::from(canvas_w) - i64::from(width)) / 2,
        y: (i64::from(canvas_h) - i64::from(height)) / 2,
    }
}

/// Rectangle of the source, in source pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Centred part of `source` that stays visible when it covers `canvas`.
/// Scaling just this region to the canvas gives the covered result without
/// ever holding the overflow in memory.
#[must_use]
pub fn cover_region(source: (u32, u32), canvas: (u32, u32)) -> SourceRegion {
    let (src_w, src_h) = (source.0.max(1), source.1.max(1));
    let (canvas_w, canvas_h) = (canvas.0.max(1), canvas.1.max(1));
    let scale = (canvas_w as f64 / src_w as f64).max(canvas_h as f64 / src_h as f64);

    let width = ((canvas_w as f64 / scale).round() as u32).clamp(1, src_w);
    let height = ((canvas_h as f64 / scale).round() as u32).clamp(1, src_h);
    SourceRegion {
        x: (src_w - width) / 2,
        y: (src_h - height) / 2,
        width,
        height,
    }
}

/// Scale `source` onto a `grid` canvas and cut it into row-major tiles of
/// `tile_resolution` pixels square.
pub fn slice(
    source: &RgbaImage,
    grid: GridSize,
    tile_resolution: u32,
    policy: ScalingPolicy,
) -> Result<Vec<RgbaImage>> {
    if grid.columns == 0 || grid.rows == 0 || tile_resolution == 0 {
        return Err(MapError::transform(format!(
            "invalid tile grid {grid} at {tile_resolution}px"
        )));
    }
    let canvas = render_canvas(source, grid, tile_resolution, policy)?;

    let mut tiles = Vec::with_capacity(grid.tile_count());
    for row in 0..grid.rows {
        for column in 0..grid.columns {
            tiles.push(
                imageops::crop_imm(
                    &canvas,
                    column * tile_resolution,
                    row * tile_resolution,
                    tile_resolution,
                    tile_resolution,
                )
                .to_image(),
            );
        }
    }

    Ok(tiles)
}

/// Full-size canvas for `grid`, before it is cut into tiles
pub fn render_canvas(
    source: &RgbaImage,
    grid: GridSize,
    tile_resolution: u32,
    policy: ScalingPolicy,
) -> Result<RgbaImage> {
    let canvas_w = grid
        .columns
        .checked_mul(tile_resolution)
        .ok_or_else(|| MapError::transform(format!("tile grid {grid} is too large")))?;
    let canvas_h = grid
        .rows
        .checked_mul(tile_resolution)
        .ok_or_else(|| MapError::transform(format!("tile grid {grid} is too large")))?;

    let place = placement(source.dimensions(), (canvas_w, canvas_h), policy);
    debug!(
        "Placing {}x{} source as {}x{} at ({}, {}) on {canvas_w}x{canvas_h} canvas ({policy})",
        source.width(),
        source.height(),
        place.width,
        place.height,
        place.x,
        place.y
    );

    let mut canvas = RgbaImage::new(canvas_w, canvas_h);
    if policy == ScalingPolicy::Covered {
        let region = cover_region(source.dimensions(), (canvas_w, canvas_h));
        let visible =
            imageops::crop_imm(source, region.x, region.y, region.width, region.height).to_image();
        let scaled = resize(&visible, canvas_w, canvas_h);
        imageops::replace(&mut canvas, &scaled, 0, 0);
    } else if place.width == source.width() && place.height == source.height() {
        imageops::replace(&mut canvas, source, place.x, place.y);
    } else {
        let scaled = resize(source, place.width, place.height);
        imageops::replace(&mut canvas, &scaled, place.x, place.y);
    }

    Ok(canvas)
}

fn resize(source: &RgbaImage, new_width: u32, new_height: u32) -> RgbaImage {
    match resample(source, new_width, new_height) {
        Ok(resized) => resized,
        Err(e) => {
            warn!("Fast resize failed: {e}, falling back to slow resize");
            imageops::resize(source, new_width, new_height, FilterType::Lanczos3)
        }
    }
}

/// Lanczos3 resample in premultiplied alpha, so transparent pixels do not
/// bleed their colour into the opaque ones next to them
fn resample(
    source: &RgbaImage,
    new_width: u32,
    new_height: u32,
) -> std::result::Result<RgbaImage, Box<dyn std::error::Error>> {
    let size = |value: u32| NonZeroU32::new(value).ok_or("zero-sized image");
    let (width, height) = (size(source.width())?, size(source.height())?);

    let borrowed: fr::DynamicImageView =
        fr::ImageView::<fr::pixels::U8x4>::from_buffer(width, height, source.as_raw())?.into();
    let mul_div = fr::MulDiv::default();
    let mut premultiplied = fr::Image::new(width, height, fr::PixelType::U8x4);
    mul_div.multiply_alpha(&borrowed, &mut premultiplied.view_mut())?;

    let mut scaled = fr::Image::new(size(new_width)?, size(new_height)?, fr::PixelType::U8x4);
    fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3))
        .resize(&premultiplied.view(), &mut scaled.view_mut())?;
    mul_div.divide_alpha_inplace(&mut scaled.view_mut())?;

    let resized = RgbaImage::from_raw(new_width, new_height, scaled.into_vec())
        .ok_or("resampled buffer has the wrong size")?;
    Ok(resized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn solid(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, RED)
    }

    fn quadrants(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            match (x < width / 2, y < height / 2) {
                (true, true) => Rgba([255, 0, 0, 255]),
                (false, true) => Rgba([0, 255, 0, 255]),
                (true, false) => Rgba([0, 0, 255, 255]),
                (false, false) => Rgba([255, 255, 0, 255]),
            }
        })
    }

    #[test]
    fn parses_policy_aliases() {
        assert_eq!("resize".parse::<ScalingPolicy>().unwrap(), ScalingPolicy::Contained);
        assert_eq!("stretch".parse::<ScalingPolicy>().unwrap(), ScalingPolicy::Stretched);
        assert_eq!(
            "resize-stretched".parse::<ScalingPolicy>().unwrap(),
            ScalingPolicy::Stretched
        );
        assert_eq!("Covered".parse::<ScalingPolicy>().unwrap(), ScalingPolicy::Covered);
        assert_eq!("none".parse::<ScalingPolicy>().unwrap(), ScalingPolicy::None);
        assert!("sideways".parse::<ScalingPolicy>().is_err());
    }

    #[test]
    fn slice_produces_row_major_tiles_of_exact_size() {
        for (columns, rows, res) in [(1, 1, 16), (3, 2, 8), (2, 5, 4), (4, 4, 1)] {
            let grid = GridSize::new(columns, rows);
            for policy in [
                ScalingPolicy::None,
                ScalingPolicy::Contained,
                ScalingPolicy::Stretched,
                ScalingPolicy::Covered,
            ] {
                let tiles = slice(&quadrants(30, 20), grid, res, policy).unwrap();
                assert_eq!(tiles.len(), grid.tile_count());
                for tile in &tiles {
                    assert_eq!(tile.dimensions(), (res, res));
                }
            }
        }
    }

    #[test]
    fn tiles_follow_canvas_origin() {
        // Stretched 2x2 quadrant image onto a 2x2 grid: every tile is one colour.
        let tiles = slice(&quadrants(64, 64), GridSize::new(2, 2), 32, ScalingPolicy::Stretched)
            .unwrap();
        assert_eq!(*tiles[0].get_pixel(16, 16), Rgba([255, 0, 0, 255]));
        assert_eq!(*tiles[1].get_pixel(16, 16), Rgba([0, 255, 0, 255]));
        assert_eq!(*tiles[2].get_pixel(16, 16), Rgba([0, 0, 255, 255]));
        assert_eq!(*tiles[3].get_pixel(16, 16), Rgba([255, 255, 0, 255]));
    }

    #[test]
    fn contained_never_crops() {
        let place = placement((200, 100), (128, 128), ScalingPolicy::Contained);
        assert_eq!((place.width, place.height), (128, 64));
        assert_eq!((place.x, place.y), (0, 32));

        let canvas = render_canvas(&solid(200, 100), GridSize::SINGLE, 128, ScalingPolicy::Contained)
            .unwrap();
        // Padding above and below stays transparent, the band in the middle is filled.
        assert_eq!(canvas.get_pixel(64, 5)[3], 0);
        assert_eq!(canvas.get_pixel(64, 122)[3], 0);
        assert_eq!(*canvas.get_pixel(0, 64), RED);
        assert_eq!(*canvas.get_pixel(127, 64), RED);
    }

    #[test]
    fn contained_keeps_whole_source_for_any_aspect() {
        for source in [(10, 300), (300, 10), (50, 50), (1, 1), (1000, 999)] {
            let canvas = (3 * 16, 2 * 16);
            let place = placement(source, canvas, ScalingPolicy::Contained);
            assert!(place.x >= 0 && place.y >= 0);
            assert!(place.x + i64::from(place.width) <= i64::from(canvas.0));
            assert!(place.y + i64::from(place.height) <= i64::from(canvas.1));
        }
    }

    #[test]
    fn covered_leaves_no_background() {
        for source in [(10, 300), (300, 10), (50, 50), (7, 3)] {
            let canvas = render_canvas(&solid(source.0, source.1), GridSize::new(2, 3), 16, ScalingPolicy::Covered)
                .unwrap();
            assert!(
                canvas.pixels().all(|p| p[3] == 255),
                "background visible for source {source:?}"
            );
        }
    }

    #[test]
    fn stretched_fills_canvas_exactly() {
        for source in [(10, 300), (300, 10), (3, 3)] {
            let place = placement(source, (64, 32), ScalingPolicy::Stretched);
            assert_eq!(place, Placement { width: 64, height: 32, x: 0, y: 0 });

            let canvas =
                render_canvas(&solid(source.0, source.1), GridSize::new(2, 1), 32, ScalingPolicy::Stretched)
                    .unwrap();
            assert!(canvas.pixels().all(|p| p[3] == 255));
        }
    }

    #[test]
    fn none_policy_keeps_pixels_untouched() {
        let source = quadrants(128, 128);
        let tiles = slice(&source, GridSize::SINGLE, 128, ScalingPolicy::None).unwrap();
        assert_eq!(tiles[0], source);
    }

    #[test]
    fn resolve_prefers_explicit_grid() {
        let grid = GridSize::resolve((1000, 10), Some(GridSize::new(2, 3)), 128, ScalingPolicy::Covered);
        assert_eq!(grid, GridSize::new(2, 3));
    }

    #[test]
    fn resolve_zero_counts_fall_back_to_single_tile() {
        let grid = GridSize::resolve((1000, 700), Some(GridSize::new(0, 0)), 128, ScalingPolicy::Contained);
        assert_eq!(grid, GridSize::SINGLE);
        let grid = GridSize::resolve((1000, 700), None, 128, ScalingPolicy::Stretched);
        assert_eq!(grid, GridSize::SINGLE);
    }

    #[test]
    fn resolve_native_grid_without_scaling() {
        assert_eq!(
            GridSize::resolve((300, 129), None, 128, ScalingPolicy::None),
            GridSize::new(3, 2)
        );
        assert_eq!(
            GridSize::resolve((100, 100), None, 128, ScalingPolicy::None),
            GridSize::SINGLE
        );
    }

    #[test]
    fn resolve_derives_missing_count_from_aspect() {
        assert_eq!(
            GridSize::resolve((400, 200), Some(GridSize::new(4, 0)), 128, ScalingPolicy::Contained),
            GridSize::new(4, 2)
        );
        assert_eq!(
            GridSize::resolve((400, 200), Some(GridSize::new(0, 3)), 128, ScalingPolicy::Contained),
            GridSize::new(6, 3)
        );
        assert_eq!(
            GridSize::resolve((1000, 10), Some(GridSize::new(2, 0)), 128, ScalingPolicy::Contained),
            GridSize::new(2, 1)
        );
    }

    #[test]
    fn grid_coordinates_are_row_major() {
        let grid = GridSize::new(3, 2);
        assert_eq!((grid.column_at(0), grid.row_at(0)), (0, 0));
        assert_eq!((grid.column_at(2), grid.row_at(2)), (2, 0));
        assert_eq!((grid.column_at(4), grid.row_at(4)), (1, 1));
        assert_eq!(grid.index_of(1, 1), Some(4));
        assert_eq!(grid.index_of(3, 0), None);
    }

    #[test]
    fn slice_rejects_empty_grid() {
        assert!(slice(&solid(4, 4), GridSize::new(0, 2), 16, ScalingPolicy::Contained).is_err());
    }

    #[test]
    fn covered_thin_source_only_scales_the_visible_part() {
        let region = cover_region((1, 100_000), (128, 128));
        assert_eq!(region, SourceRegion { x: 0, y: 49_999, width: 1, height: 1 });
        assert_eq!(
            placement((1, 100_000), (128, 128), ScalingPolicy::Covered),
            Placement { width: 128, height: 128, x: 0, y: 0 }
        );

        let thin = RgbaImage::from_fn(1, 100_000, |_, y| {
            if y < 50_000 { RED } else { Rgba([0, 0, 255, 255]) }
        });
        let tiles = slice(&thin, GridSize::SINGLE, 128, ScalingPolicy::Covered).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].dimensions(), (128, 128));
        assert!(tiles[0].pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn cover_region_stays_inside_the_source() {
        for (source, canvas) in [
            ((300, 10), (32, 48)),
            ((10, 300), (64, 16)),
            ((50, 50), (128, 128)),
            ((100_000, 3), (256, 128)),
        ] {
            let region = cover_region(source, canvas);
            assert!(region.width >= 1 && region.height >= 1);
            assert!(region.x + region.width <= source.0);
            assert!(region.y + region.height <= source.1);
        }
        // Wide source on a square canvas keeps its middle.
        assert_eq!(
            cover_region((200, 100), (64, 64)),
            SourceRegion { x: 50, y: 0, width: 100, height: 100 }
        );
    }

    #[test]
    fn transparent_edges_do_not_darken_opaque_pixels() {
        let half = RgbaImage::from_fn(64, 64, |x, _| if x < 32 { RED } else { Rgba([0, 0, 0, 0]) });
        let canvas = render_canvas(&half, GridSize::SINGLE, 7, ScalingPolicy::Stretched).unwrap();
        for pixel in canvas.pixels().filter(|p| p[3] >= 32) {
            assert!(pixel[0] >= 200, "darkened edge pixel {pixel:?}");
            assert!(pixel[1] <= 40 && pixel[2] <= 40, "tinted edge pixel {pixel:?}");
        }
    }
}
