use image::RgbaImage;

use crate::buffers::RenderBuffers;
use crate::screen_block::ScreenBlockExt;
use crate::util::Rgba;

/// Presents render buffers to the host.
///
/// `update` runs on the session worker thread between work units, `draw` on whatever
/// thread calls [`crate::session::Session::draw`].
pub trait Display: Send {
    fn update(&mut self, buffers: &RenderBuffers);

    /// Presents the content of the last update. Returns false if there is nothing to show.
    fn draw(&mut self) -> bool;
}

type PresentCallback = Box<dyn FnMut(&RgbaImage) + Send>;

/// Converts buffers into an 8 bit image, preferring the denoised pass when there is one.
pub struct ImageDisplay {
    image: Option<RgbaImage>,
    on_present: Option<PresentCallback>,
}

impl ImageDisplay {
    pub fn new() -> Self {
        ImageDisplay {
            image: None,
            on_present: None,
        }
    }

    pub fn with_present_callback(
        mut self,
        callback: impl FnMut(&RgbaImage) + Send + 'static,
    ) -> Self {
        self.on_present = Some(Box::new(callback));
        self
    }

    pub fn image(&self) -> Option<&RgbaImage> {
        self.image.as_ref()
    }
}

impl Default for ImageDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ImageDisplay {
    fn update(&mut self, buffers: &RenderBuffers) {
        let params = buffers.params();
        let block = params.block();
        let image = self
            .image
            .get_or_insert_with(|| RgbaImage::new(params.width, params.height));
        if image.dimensions() != (params.width, params.height) {
            *image = RgbaImage::new(params.width, params.height);
        }
        for point in block.internal_points() {
            let color = buffers.denoised_pixel(point);
            image.put_pixel(point.x - block.min.x, point.y - block.min.y, color_to_image(color));
        }
    }

    fn draw(&mut self) -> bool {
        let Some(image) = &self.image else {
            return false;
        };
        if let Some(callback) = &mut self.on_present {
            callback(image);
        }
        true
    }
}

/// Maps a 0-1 f32 rgba pixel to pixel type compatible with module image.
pub fn color_to_image(color: Rgba) -> image::Rgba<u8> {
    image::Rgba([
        (color.r * 255.0).round().clamp(0.0, 255.0) as u8,
        (color.g * 255.0).round().clamp(0.0, 255.0) as u8,
        (color.b * 255.0).round().clamp(0.0, 255.0) as u8,
        (color.a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}
