use crate::tiles::RenderTile;

/// Host hooks invoked while tiles move through the session.
///
/// All hooks run on device threads with the tile lock held. They must return quickly
/// and must not call back into the session.
pub trait TileCallbacks: Send + Sync {
    /// Tiles are rendered as bake tasks.
    fn bake(&self) -> bool {
        false
    }

    /// A tile was acquired (`is_new`) or released with more samples still to come.
    fn on_tile_updated(&self, _tile: &RenderTile, _is_new: bool) {}

    /// A tile received all its samples (and denoising, if scheduled).
    fn on_tile_written(&self, _tile: &RenderTile) {}

    /// Fills bake input into a freshly acquired tile before its first sample.
    fn on_bake_tile_read(&self, _tile: &mut RenderTile) {}
}

/// Callbacks that ignore everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoTileCallbacks;

impl TileCallbacks for NoTileCallbacks {}
