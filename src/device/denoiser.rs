use super::DeviceError;
use crate::buffers::RenderBuffers;
use crate::geometry::ScreenPoint;
use crate::screen_block::ScreenBlockExt;
use crate::tiles::NeighborTiles;
use crate::util::Rgba;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DenoiserType {
    #[default]
    BoxFilter,
    OpenImageDenoise,
    Optix,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DenoiseParams {
    pub use_denoising: bool,
    pub denoiser_type: DenoiserType,
    /// First sample after which interactive renders get denoised.
    pub start_sample: u32,
}

pub trait Denoiser: Send + Sync {
    fn denoiser_type(&self) -> DenoiserType;

    /// Writes the denoised pass of `target`, reading noisy pixels from the neighborhood.
    fn denoise(&self, neighbors: &NeighborTiles, target: &mut RenderBuffers)
    -> Result<(), DeviceError>;
}

/// Averages each pixel with its rendered neighbors within a square window.
#[derive(Copy, Clone, Debug)]
pub struct BoxFilterDenoiser {
    radius: u32,
}

impl BoxFilterDenoiser {
    pub fn new(radius: u32) -> Self {
        BoxFilterDenoiser { radius }
    }
}

impl Default for BoxFilterDenoiser {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Denoiser for BoxFilterDenoiser {
    fn denoiser_type(&self) -> DenoiserType {
        DenoiserType::BoxFilter
    }

    fn denoise(
        &self,
        neighbors: &NeighborTiles,
        target: &mut RenderBuffers,
    ) -> Result<(), DeviceError> {
        let radius = self.radius as i32;
        for point in target.params().block().internal_points() {
            let mut sum = Rgba::new(0.0, 0.0, 0.0, 0.0);
            let mut count = 0;
            for (dy, dx) in itertools::iproduct!(-radius..=radius, -radius..=radius) {
                let (Some(x), Some(y)) = (
                    point.x.checked_add_signed(dx),
                    point.y.checked_add_signed(dy),
                ) else {
                    continue;
                };
                if let Some(value) = neighbors.pixel(ScreenPoint::new(x, y)) {
                    sum += value;
                    count += 1;
                }
            }
            if count > 0 {
                target.set_denoised(point, sum * (1.0 / count as f32));
            }
        }
        Ok(())
    }
}
