use bon::bon;
use thiserror::Error;

use crate::device::DenoiseParams;
use crate::scheduler::SchedulerConfig;
use crate::screen_block::TileOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("Pixel size must be at least 1")]
    ZeroPixelSize,
    #[error("Tile size must be at least 1")]
    ZeroTileSize,
    #[error("Start resolution divider must be a power of two, got {0}")]
    StartResolutionDivider(u32),
    #[error("Work units must be allowed at least one sample")]
    ZeroSamplesPerWork,
}

/// Settings fixed for the lifetime of a session, plus the initial values of the
/// ones that can change while it runs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SessionParams {
    /// Offline render, as opposed to an interactive viewport.
    pub background: bool,
    /// Sample target, `None` renders until cancelled.
    pub samples: Option<u32>,
    /// Size of a rendered pixel in frame pixels.
    pub pixel_size: u32,
    pub tile_size: u32,
    pub tile_order: TileOrder,
    pub denoising: DenoiseParams,
    pub scheduler: SchedulerConfig,
}

#[bon]
impl SessionParams {
    #[builder]
    pub fn new(
        #[builder(default)] background: bool,
        samples: Option<u32>,
        #[builder(default = 1)] pixel_size: u32,
        #[builder(default = 64)] tile_size: u32,
        #[builder(default)] tile_order: TileOrder,
        #[builder(default)] denoising: DenoiseParams,
        #[builder(default)] scheduler: SchedulerConfig,
    ) -> Result<Self, ParamsError> {
        if pixel_size == 0 {
            return Err(ParamsError::ZeroPixelSize);
        }
        if tile_size == 0 {
            return Err(ParamsError::ZeroTileSize);
        }
        scheduler.validate()?;

        Ok(SessionParams {
            background,
            samples,
            pixel_size,
            tile_size,
            tile_order,
            denoising,
            scheduler,
        })
    }
}
