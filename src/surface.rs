//! Sparse tiled pixel surface backing scene-graph nodes.
//!
//! Pixels are stored in 64×64 tiles inside a flat `Vec<Option<Arc<RgbaImage>>>`
//! indexed by `ty * tiles_per_row + tx`, giving O(1) access with zero hashing
//! overhead.  Tiles are wrapped in `Arc` for copy-on-write semantics: cloning
//! a surface only bumps reference counts, and mutations COW-clone just the
//! touched tile via `Arc::make_mut`.  Fully transparent tiles are simply not
//! stored.

use std::sync::Arc;

use image::{Rgba, RgbaImage};

pub const TILE_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing tiles.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Clone)]
pub struct TileSurface {
    width: u32,
    height: u32,
    tiles_per_row: u32,
    tiles: Vec<Option<Arc<RgbaImage>>>,
}

impl TileSurface {
    /// Create an empty (fully transparent) surface.
    pub fn new(width: u32, height: u32) -> Self {
        // Sanity: clamp dimensions to prevent overflow (max ~256 megapixels)
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > 256_000_000 {
                crate::log_warn!(
                    "TileSurface::new: dimensions {}x{} exceed 256M pixels, clamped to 1x1",
                    width,
                    height
                );
                (1, 1)
            } else {
                (width.max(1), height.max(1))
            }
        };
        let tiles_per_row = width.div_ceil(TILE_SIZE);
        let tiles_per_col = height.div_ceil(TILE_SIZE);
        Self {
            width,
            height,
            tiles_per_row,
            tiles: vec![None; (tiles_per_row * tiles_per_col) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of tiles that currently hold pixel data.
    pub fn occupied_tiles(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_some()).count()
    }

    pub fn is_blank(&self) -> bool {
        self.occupied_tiles() == 0
    }

    /// Drop all pixel data, returning the surface to fully transparent.
    pub fn clear(&mut self) {
        for slot in &mut self.tiles {
            *slot = None;
        }
    }

    /// Resize the surface, discarding all content.
    pub fn reset_size(&mut self, width: u32, height: u32) {
        *self = Self::new(width, height);
    }

    #[inline]
    fn tile_index(&self, x: u32, y: u32) -> usize {
        ((y / TILE_SIZE) * self.tiles_per_row + x / TILE_SIZE) as usize
    }

    /// Read a pixel.  Out-of-bounds and unstored tiles read as transparent.
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height {
            return &TRANSPARENT_PIXEL;
        }
        match &self.tiles[self.tile_index(x, y)] {
            Some(tile) => tile.get_pixel(x % TILE_SIZE, y % TILE_SIZE),
            None => &TRANSPARENT_PIXEL,
        }
    }

    /// Write a pixel.  Out-of-bounds writes are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, px: Rgba<u8>) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = self.tile_index(x, y);
        let tile = self.tiles[idx].get_or_insert_with(blank_tile);
        Arc::make_mut(tile).put_pixel(x % TILE_SIZE, y % TILE_SIZE, px);
    }

    /// Fill the entire surface with `color`.  A transparent fill is just a
    /// clear and costs nothing.
    pub fn fill(&mut self, color: Rgba<u8>) {
        if color[3] == 0 {
            self.clear();
            return;
        }
        self.fill_rect(0, 0, self.width, self.height, color);
    }

    /// Fill an axis-aligned rectangle, clipped to the surface bounds.
    pub fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, color: Rgba<u8>) {
        let x0 = x.max(0) as u32;
        let y0 = y.max(0) as u32;
        let x1 = (x.saturating_add(w as i32)).clamp(0, self.width as i32) as u32;
        let y1 = (y.saturating_add(h as i32)).clamp(0, self.height as i32) as u32;
        for py in y0..y1 {
            for px in x0..x1 {
                self.put_pixel(px, py, color);
            }
        }
    }

    /// Copy `src` onto the surface with its top-left corner at (ox, oy),
    /// replacing destination pixels.  Regions falling outside the surface
    /// are clipped.
    pub fn blit_image(&mut self, src: &RgbaImage, ox: i32, oy: i32) {
        for (sx, sy, px) in src.enumerate_pixels() {
            let dx = ox + sx as i32;
            let dy = oy + sy as i32;
            if dx >= 0 && dy >= 0 {
                self.put_pixel(dx as u32, dy as u32, *px);
            }
        }
    }

    /// Like [`blit_image`](Self::blit_image) but recoloring every pixel to
    /// `rgb` while keeping the source coverage (alpha).  Used for mask-shaped
    /// entities whose pixel data is coverage and whose color is configuration.
    pub fn blit_tinted(&mut self, src: &RgbaImage, ox: i32, oy: i32, rgb: [u8; 3]) {
        for (sx, sy, px) in src.enumerate_pixels() {
            let a = px[3];
            if a == 0 {
                continue;
            }
            let dx = ox + sx as i32;
            let dy = oy + sy as i32;
            if dx >= 0 && dy >= 0 {
                self.put_pixel(dx as u32, dy as u32, Rgba([rgb[0], rgb[1], rgb[2], a]));
            }
        }
    }

    /// Flatten to a contiguous `RgbaImage`.  Unstored tiles come out
    /// transparent.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        for (idx, slot) in self.tiles.iter().enumerate() {
            let Some(tile) = slot else { continue };
            let tx = (idx as u32 % self.tiles_per_row) * TILE_SIZE;
            let ty = (idx as u32 / self.tiles_per_row) * TILE_SIZE;
            let copy_w = TILE_SIZE.min(self.width - tx);
            let copy_h = TILE_SIZE.min(self.height - ty);
            for y in 0..copy_h {
                for x in 0..copy_w {
                    out.put_pixel(tx + x, ty + y, *tile.get_pixel(x, y));
                }
            }
        }
        out
    }
}

fn blank_tile() -> Arc<RgbaImage> {
    Arc::new(RgbaImage::new(TILE_SIZE, TILE_SIZE))
}
