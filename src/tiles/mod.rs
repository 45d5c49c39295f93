//! Splitting of the frame into tiles and handing them out to devices.

mod coordinator;
mod manager;

pub use coordinator::TileCoordinator;
pub use manager::{Tile, TileManager};

use crate::buffers::RenderBuffers;
use crate::geometry::{ScreenBlock, ScreenPoint};
use crate::scheduler::SampleRange;
use crate::util::Rgba;

index_vec::define_index_type! {
    pub struct TileIdx = u32;
}

/// Lifecycle of a tile within a single work unit.
///
/// The order of the variants matters, a tile never moves back to an earlier state
/// until the next work unit starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TileState {
    /// Waiting for a device to render it.
    Render,
    /// Rendered, waiting for its neighbors before it can be denoised.
    Rendered,
    /// Queued for denoising.
    Denoise,
    /// Denoised, waiting for its neighbors to stop reading it.
    Denoised,
    Done,
}

/// What a device is asked to do with an acquired tile.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileTask {
    PathTrace,
    Denoise,
    Bake,
}

/// Kinds of tiles a device is willing to accept from `acquire_tile`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileKinds {
    pub render: bool,
    pub denoise: bool,
}

impl TileKinds {
    pub const RENDER: TileKinds = TileKinds {
        render: true,
        denoise: false,
    };
    pub const DENOISE: TileKinds = TileKinds {
        render: false,
        denoise: true,
    };
    pub const ALL: TileKinds = TileKinds {
        render: true,
        denoise: true,
    };
}

/// A tile checked out by a device.
///
/// For render and bake tasks the tile owns the tile's buffers until it is released.
/// Denoise tasks get a copy of the rendered buffers, only the denoised pass is taken
/// back on release.
#[derive(Clone, Debug)]
pub struct RenderTile {
    pub index: TileIdx,
    /// Pixel rectangle in the frame downscaled by `resolution_divider`.
    pub block: ScreenBlock,
    pub task: TileTask,
    pub sample_range: SampleRange,
    /// Number of samples accumulated in the buffers so far.
    pub sample: u32,
    pub resolution_divider: u32,
    pub buffers: RenderBuffers,
    /// The buffers of an already written tile were freed, the samples accumulated so far
    /// have to be restored from the frame before rendering more.
    pub restore_from_frame: bool,
}

/// Index of the tile itself in [`NeighborTiles::tiles`].
pub const CENTER: usize = 4;

#[derive(Clone, Debug)]
pub struct NeighborTile {
    pub block: ScreenBlock,
    /// Snapshot of the neighbor's buffers, `None` for placeholders outside of the frame
    /// or neighbors that were never rendered.
    pub buffers: Option<RenderBuffers>,
}

/// 3x3 neighborhood of a tile in row major order, the tile itself is in the middle.
#[derive(Clone, Debug)]
pub struct NeighborTiles {
    pub tiles: [NeighborTile; 9],
}

impl NeighborTiles {
    /// Neighborhood of a block that has no neighbors, such as a whole frame.
    pub fn from_center(block: ScreenBlock, buffers: RenderBuffers) -> Self {
        let mut center = Some(NeighborTile {
            block,
            buffers: Some(buffers),
        });
        NeighborTiles {
            tiles: std::array::from_fn(|i| {
                if i == CENTER {
                    center.take().unwrap_or_else(|| placeholder(block.min))
                } else {
                    placeholder(block.min)
                }
            }),
        }
    }

    pub fn center(&self) -> &NeighborTile {
        &self.tiles[CENTER]
    }

    /// Noisy value of a pixel from whichever tile of the neighborhood rendered it.
    pub fn pixel(&self, point: ScreenPoint) -> Option<Rgba> {
        self.tiles.iter().find_map(|tile| {
            let buffers = tile.buffers.as_ref()?;
            (tile.block.contains(point) && buffers.sample_count(point) > 0)
                .then(|| buffers.pixel(point))
        })
    }
}

pub(crate) fn placeholder(point: ScreenPoint) -> NeighborTile {
    NeighborTile {
        block: ScreenBlock::empty_at(point),
        buffers: None,
    }
}
