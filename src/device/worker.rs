use std::sync::atomic::{AtomicBool, Ordering};

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::{DeviceError, RenderContext};
use crate::geometry::{ScreenPoint, ScreenSize};
use crate::screen_block::ScreenBlockExt;
use crate::tiles::RenderTile;
use crate::util::Rgba;

/// A single sample request for a pixel of a possibly downscaled frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PixelSample {
    pub pixel: ScreenPoint,
    /// Size of the frame the pixel belongs to.
    pub frame: ScreenSize,
    pub sample: u32,
    pub resolution_divider: u32,
}

/// Computes radiance samples. The CPU device runs one kernel on all its threads.
pub trait Kernel: Send + Sync {
    fn sample(&self, sample: &PixelSample, rng: &mut SmallRng) -> Result<Rgba, DeviceError>;
}

/// Concentric rings around the frame center, antialiased by jittering sample positions.
#[derive(Copy, Clone, Debug)]
pub struct RingsKernel {
    pub ring_count: f32,
}

impl Default for RingsKernel {
    fn default() -> Self {
        RingsKernel { ring_count: 12.0 }
    }
}

impl Kernel for RingsKernel {
    fn sample(&self, sample: &PixelSample, rng: &mut SmallRng) -> Result<Rgba, DeviceError> {
        let size = sample.frame.map(|v| v.max(1) as f32);
        let x = (sample.pixel.x as f32 + rng.random::<f32>()) / size.x - 0.5;
        let y = (sample.pixel.y as f32 + rng.random::<f32>()) / size.y - 0.5;
        let r = (x * x + y * y).sqrt() * 2.0 * self.ring_count;
        let v = if (r as u32) % 2 == 0 { 1.0 } else { 0.1 };
        Ok(Rgba::new(v, v * (1.0 - x.abs()), v * (1.0 - y.abs()), 1.0))
    }
}

/// Per thread rendering state.
pub struct TileWorker {
    rng: SmallRng,
}

impl TileWorker {
    pub fn new(_worker_id: usize) -> Self {
        Self {
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Renders the samples of the tile one sample pass at a time, stopping between passes
    /// when cancelled. `tile.sample` ends at the number of samples actually accumulated.
    pub fn render_tile<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        tile: &mut RenderTile,
        context: &RenderContext<'_>,
        cancelled: &AtomicBool,
    ) -> Result<(), DeviceError> {
        let frame = tile.buffers.params().full_size();
        for sample in tile.sample_range.iter() {
            if cancelled.load(Ordering::Acquire) || context.get_cancel() {
                break;
            }
            for pixel in tile.block.internal_points() {
                let color = kernel.sample(
                    &PixelSample {
                        pixel,
                        frame,
                        sample,
                        resolution_divider: tile.resolution_divider,
                    },
                    &mut self.rng,
                )?;
                tile.buffers.add_sample(pixel, color);
            }
            tile.sample = sample + 1;
            context.add_samples(tile.block.area() as u64, tile.sample);
        }
        Ok(())
    }
}
