//! Compute devices that execute render work.

mod cpu;
mod denoiser;
mod worker;

pub use cpu::CpuDevice;
pub use denoiser::{BoxFilterDenoiser, DenoiseParams, Denoiser, DenoiserType};
pub use worker::{Kernel, PixelSample, RingsKernel, TileWorker};

use std::sync::Mutex;

use thiserror::Error;

use crate::buffers::{BufferParams, RenderBuffers};
use crate::progress::Progress;
use crate::scheduler::RenderWork;
use crate::tiles::{NeighborTiles, RenderTile, TileCoordinator, TileKinds};
use crate::util::lock;

/// Identifies the device owning a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    /// Several devices sharing the work.
    Multi,
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    /// Denoisers the device can run.
    pub denoisers: Vec<DenoiserType>,
    /// The device reports progress sample by sample.
    pub show_samples: bool,
}

impl DeviceInfo {
    pub fn supports_denoiser(&self, denoiser: DenoiserType) -> bool {
        self.denoisers.contains(&denoiser)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{0}")]
    Message(String),
    #[error("Failed to start device thread: {0}")]
    ThreadSpawn(String),
}

/// A compute device.
///
/// `execute` is only ever called from the session worker thread, `cancel_current_task`
/// may be called from any thread while `execute` is running.
pub trait Device: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Renders the work, acquiring and releasing tiles through the context until it
    /// hands out no more. Returns early once the context is cancelled.
    fn execute(&self, work: &RenderWork, context: &RenderContext<'_>) -> Result<(), DeviceError>;

    /// Asks the running `execute` to return as soon as possible.
    fn cancel_current_task(&self);
}

/// Everything a device needs while executing a single work unit.
pub struct RenderContext<'a> {
    tiles: &'a TileCoordinator,
    frame: Mutex<&'a mut RenderBuffers>,
    progress: &'a Progress,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        tiles: &'a TileCoordinator,
        frame: &'a mut RenderBuffers,
        progress: &'a Progress,
    ) -> Self {
        RenderContext {
            tiles,
            frame: Mutex::new(frame),
            progress,
        }
    }

    /// Rendering should stop, either because the session is cancelled or because
    /// the current work was abandoned.
    pub fn get_cancel(&self) -> bool {
        self.progress.get_cancel() || self.tiles.is_work_cancelled()
    }

    pub fn progress(&self) -> &Progress {
        self.progress
    }

    pub fn frame_params(&self) -> BufferParams {
        *lock(&self.frame).params()
    }

    /// Denoising happens tile by tile as part of the work, instead of on the whole frame
    /// after rendering.
    pub fn schedules_tile_denoising(&self) -> bool {
        self.tiles.schedules_denoising()
    }

    /// Checks out a tile, restoring samples of freed tiles from the frame.
    pub fn acquire_tile(&self, device: DeviceId, kinds: TileKinds) -> Option<RenderTile> {
        let mut tile = self.tiles.acquire_tile(device, kinds)?;
        if tile.restore_from_frame {
            tile.buffers
                .restore_from_frame(&lock(&self.frame), tile.resolution_divider);
            tile.restore_from_frame = false;
        }
        Some(tile)
    }

    /// Copies the tile into the frame and hands it back to the coordinator.
    pub fn release_tile(&self, tile: RenderTile, need_denoise: bool) {
        lock(&self.frame).copy_tile(&tile.buffers, tile.resolution_divider);
        self.tiles.release_tile(tile, need_denoise);
    }

    pub fn map_neighbor_tiles(&self, center: &RenderTile) -> NeighborTiles {
        self.tiles.map_neighbor_tiles(center)
    }

    pub fn add_samples(&self, pixel_samples: u64, sample: u32) {
        self.progress.add_samples(pixel_samples, sample);
    }

    /// Gives access to the whole frame, for passes that don't work tile by tile.
    pub fn with_frame<R>(&self, f: impl FnOnce(&mut RenderBuffers) -> R) -> R {
        let mut frame = lock(&self.frame);
        f(&mut frame)
    }
}
