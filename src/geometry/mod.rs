mod aabb;

pub use aabb::AABB;

use nalgebra::{Point2, Vector2};

/// Pixel coordinates within the full frame.
pub type ScreenPoint = Point2<u32>;
pub type ScreenSize = Vector2<u32>;
/// Half-open pixel rectangle, `min` inclusive, `max` exclusive.
pub type ScreenBlock = AABB<ScreenPoint>;

impl ScreenBlock {
    pub fn from_size(size: ScreenSize) -> ScreenBlock {
        ScreenBlock::with_size(ScreenPoint::origin(), &size)
    }

    pub fn is_empty(&self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y
    }

    /// Number of pixels in the block, zero for empty or inverted blocks.
    pub fn area(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.width() * self.height()
        }
    }

    pub fn contains(&self, point: ScreenPoint) -> bool {
        point.x >= self.min.x
            && point.x < self.max.x
            && point.y >= self.min.y
            && point.y < self.max.y
    }

    pub fn contains_block(&self, other: &ScreenBlock) -> bool {
        other.is_empty()
            || (other.min.x >= self.min.x
                && other.min.y >= self.min.y
                && other.max.x <= self.max.x
                && other.max.y <= self.max.y)
    }

    /// Zero sized block at the given point.
    pub fn empty_at(point: ScreenPoint) -> ScreenBlock {
        ScreenBlock::new(point, point)
    }

    /// Scales a block of a frame downsampled by `divider` back to full resolution.
    /// Edges lying on the border of the downsampled frame stretch to the border of the
    /// full frame.
    pub fn upscaled(&self, divider: u32, scaled: &ScreenBlock, full: &ScreenBlock) -> ScreenBlock {
        let scale = |v: u32, scaled_max: u32, full_max: u32| {
            if v >= scaled_max {
                full_max
            } else {
                v * divider
            }
        };
        ScreenBlock::new(
            ScreenPoint::new(
                scale(self.min.x, scaled.max.x, full.max.x),
                scale(self.min.y, scaled.max.y, full.max.y),
            ),
            ScreenPoint::new(
                scale(self.max.x, scaled.max.x, full.max.x),
                scale(self.max.y, scaled.max.y, full.max.y),
            ),
        )
    }
}

/// Size of a frame after applying resolution divider, never smaller than a single pixel.
pub fn scaled_size(size: ScreenSize, divider: u32) -> ScreenSize {
    debug_assert!(divider > 0);
    size.map(|x| (x / divider).max(1))
}
