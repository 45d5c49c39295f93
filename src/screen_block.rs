use std::iter::FusedIterator;

use assert2::assert;
use itertools::iproduct;

use crate::geometry::{ScreenBlock, ScreenPoint, ScreenSize};
use crate::util::divide_round_up;

/// Order in which tiles of a frame are handed out to devices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TileOrder {
    /// Tiles closest to the center of the frame first.
    #[default]
    Center,
    LeftToRight,
    RightToLeft,
    TopToBottom,
    BottomToTop,
}

pub trait ScreenBlockExt {
    fn internal_points(&self) -> InternalPoints;
    fn tile_grid(&self, tile_size: u32) -> TileGrid;
}

impl ScreenBlockExt for ScreenBlock {
    /// Create an iterator over coordinates (x, y) pairs inside the block,
    /// in C order (x changes first, then y)
    fn internal_points(&self) -> InternalPoints {
        if self.is_empty() {
            InternalPoints::empty()
        } else {
            InternalPoints {
                min_x: self.min.x,
                max: self.max,

                cursor: self.min,
            }
        }
    }

    /// Split the block into a grid of tile_size * tile_size tiles. Tiles on the bottom and
    /// right side of the block are clipped if tile size doesn't evenly divide block size.
    /// Tile size must be non zero.
    fn tile_grid(&self, tile_size: u32) -> TileGrid {
        assert!(tile_size > 0);

        let size = if self.is_empty() {
            ScreenSize::zeros()
        } else {
            self.size().map(|x| divide_round_up(x, tile_size))
        };

        TileGrid {
            block: *self,
            tile_size,
            size,
        }
    }
}

/// Regular grid of tiles covering a block.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TileGrid {
    block: ScreenBlock,
    tile_size: u32,
    /// Number of tiles in each direction.
    size: ScreenSize,
}

impl TileGrid {
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Number of tiles in each direction.
    pub fn size(&self) -> ScreenSize {
        self.size
    }

    pub fn len(&self) -> usize {
        (self.size.x * self.size.y) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row major index of the tile at grid coordinates.
    pub fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.size.x && y < self.size.y).then(|| (y * self.size.x + x) as usize)
    }

    /// Grid coordinates of the tile with given row major index.
    pub fn coords(&self, index: usize) -> ScreenPoint {
        debug_assert!(index < self.len());
        let index = index as u32;
        ScreenPoint::new(index % self.size.x, index / self.size.x)
    }

    /// Index of the tile offset by (dx, dy) from the tile at `index`, if it exists.
    pub fn neighbor(&self, index: usize, dx: i32, dy: i32) -> Option<usize> {
        let coords = self.coords(index);
        let x = coords.x.checked_add_signed(dx)?;
        let y = coords.y.checked_add_signed(dy)?;
        self.index(x, y)
    }

    /// Pixel block of the tile at grid coordinates.
    pub fn tile_block(&self, x: u32, y: u32) -> ScreenBlock {
        let min = self.block.min + ScreenSize::new(x, y) * self.tile_size;
        let max = ScreenPoint::new(
            (min.x + self.tile_size).min(self.block.max.x),
            (min.y + self.tile_size).min(self.block.max.y),
        );
        let ret = ScreenBlock::new(min, max);
        debug_assert!(self.block.contains_block(&ret));
        debug_assert!(!ret.is_empty());
        ret
    }

    /// Row major iterator over all tile blocks.
    pub fn blocks(&self) -> impl Iterator<Item = ScreenBlock> + '_ {
        iproduct!(0..self.size.y, 0..self.size.x).map(|(y, x)| self.tile_block(x, y))
    }

    /// Row major indices of all tiles, sorted in the requested order.
    pub fn ordering(&self, order: TileOrder) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        match order {
            TileOrder::Center => {
                // Grid coordinates are doubled so that the center is an integer point.
                let center = (self.size.x as i64 - 1, self.size.y as i64 - 1);
                indices.sort_by_key(|&i| {
                    let c = self.coords(i);
                    let dx = 2 * c.x as i64 - center.0;
                    let dy = 2 * c.y as i64 - center.1;
                    dx * dx + dy * dy
                });
            }
            TileOrder::LeftToRight => indices.sort_by_key(|&i| {
                let c = self.coords(i);
                (c.x, c.y)
            }),
            TileOrder::RightToLeft => indices.sort_by_key(|&i| {
                let c = self.coords(i);
                (std::cmp::Reverse(c.x), c.y)
            }),
            TileOrder::TopToBottom => {}
            TileOrder::BottomToTop => indices.sort_by_key(|&i| {
                let c = self.coords(i);
                (std::cmp::Reverse(c.y), c.x)
            }),
        }
        indices
    }
}

#[derive(Copy, Clone, Debug)]
pub struct InternalPoints {
    min_x: u32,
    max: ScreenPoint,

    cursor: ScreenPoint,
}

impl InternalPoints {
    // Construct an iterator over internal points that returns no points
    fn empty() -> Self {
        InternalPoints {
            min_x: 1,
            max: ScreenPoint::origin(),

            cursor: ScreenPoint::origin(),
        }
    }
}

impl Iterator for InternalPoints {
    type Item = ScreenPoint;

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.y >= self.max.y {
            return None;
        }

        let ret = self.cursor;

        debug_assert!(self.cursor.x < self.max.x);
        self.cursor.x += 1;
        if self.cursor.x >= self.max.x {
            self.cursor.x = self.min_x;
            self.cursor.y += 1;
        }

        Some(ret)
    }
}

impl ExactSizeIterator for InternalPoints {
    fn len(&self) -> usize {
        if self.cursor.y >= self.max.y {
            0
        } else {
            let whole_rows =
                ScreenBlock::new(ScreenPoint::new(self.min_x, self.cursor.y + 1), self.max);
            let current_row =
                ScreenBlock::new(self.cursor, ScreenPoint::new(self.max.x, self.cursor.y + 1));
            (whole_rows.area() + current_row.area()) as usize
        }
    }
}

impl FusedIterator for InternalPoints {}
