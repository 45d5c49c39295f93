use crate::device::DeviceId;
use crate::geometry::{ScreenBlock, ScreenPoint, ScreenSize, scaled_size};
use crate::screen_block::ScreenBlockExt;
use crate::util::Rgba;

/// Shape of a render buffer: a rectangle positioned within the full frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferParams {
    /// Position of the buffer within the full frame.
    pub full_x: u32,
    pub full_y: u32,
    /// Size of the buffer.
    pub width: u32,
    pub height: u32,
    /// Size of the full frame.
    pub full_width: u32,
    pub full_height: u32,
}

impl BufferParams {
    /// Buffer covering the whole frame of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        BufferParams {
            full_x: 0,
            full_y: 0,
            width,
            height,
            full_width: width,
            full_height: height,
        }
    }

    /// Pixel rectangle of the buffer in full frame coordinates.
    pub fn block(&self) -> ScreenBlock {
        ScreenBlock::with_size(
            ScreenPoint::new(self.full_x, self.full_y),
            &ScreenSize::new(self.width, self.height),
        )
    }

    pub fn full_size(&self) -> ScreenSize {
        ScreenSize::new(self.full_width, self.full_height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Offset and stride such that `offset + x + y * stride` is the index of the full frame
    /// pixel (x, y) in this buffer.
    pub fn get_offset_stride(&self) -> (i64, u32) {
        let offset = -(self.full_x as i64 + self.full_y as i64 * self.width as i64);
        (offset, self.width)
    }

    /// The same buffer as seen by a render pass running with the given resolution divider.
    /// Empty buffers stay empty.
    pub fn scaled(&self, divider: u32) -> BufferParams {
        if self.pixel_count() == 0 {
            return *self;
        }
        let size = scaled_size(ScreenSize::new(self.width, self.height), divider);
        let full_size = scaled_size(self.full_size(), divider);
        BufferParams {
            full_x: self.full_x / divider,
            full_y: self.full_y / divider,
            width: size.x,
            height: size.y,
            full_width: full_size.x,
            full_height: full_size.y,
        }
    }

    /// Parameters of a sub-buffer covering the given block of this buffer's frame.
    pub fn for_block(&self, block: &ScreenBlock) -> BufferParams {
        BufferParams {
            full_x: block.min.x,
            full_y: block.min.y,
            width: block.width(),
            height: block.height(),
            full_width: self.full_width,
            full_height: self.full_height,
        }
    }
}

/// Pixel accumulation storage for a rectangular region of the frame.
#[derive(Clone, Debug)]
pub struct RenderBuffers {
    params: BufferParams,
    device: DeviceId,

    /// Sum of all samples of each pixel.
    combined: Vec<Rgba>,
    sample_count: Vec<u32>,
    /// Denoised estimate, allocated on first write.
    /// Pixels that were not denoised hold the noisy average.
    denoised: Option<Vec<Rgba>>,
}

impl RenderBuffers {
    pub fn new(device: DeviceId, params: BufferParams) -> Self {
        let pixel_count = params.pixel_count();
        RenderBuffers {
            params,
            device,
            combined: vec![Rgba::new(0.0, 0.0, 0.0, 0.0); pixel_count],
            sample_count: vec![0; pixel_count],
            denoised: None,
        }
    }

    /// Resizes the buffer and clears its content.
    pub fn reset(&mut self, params: BufferParams) {
        self.params = params;
        let pixel_count = params.pixel_count();
        self.combined.clear();
        self.combined
            .resize(pixel_count, Rgba::new(0.0, 0.0, 0.0, 0.0));
        self.sample_count.clear();
        self.sample_count.resize(pixel_count, 0);
        self.denoised = None;
    }

    pub fn params(&self) -> &BufferParams {
        &self.params
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Hands the buffer over to another device.
    pub fn move_device(&mut self, device: DeviceId) {
        if device != self.device {
            log::trace!(
                "Moving buffer {:?} from {:?} to {:?}",
                self.params.block(),
                self.device,
                device
            );
            self.device = device;
        }
    }

    fn index(&self, point: ScreenPoint) -> Option<usize> {
        if !self.params.block().contains(point) {
            return None;
        }
        let (offset, stride) = self.params.get_offset_stride();
        Some((offset + point.x as i64 + point.y as i64 * stride as i64) as usize)
    }

    /// Adds a single sample to a pixel given in full frame coordinates.
    /// Samples outside of the buffer are ignored.
    pub fn add_sample(&mut self, point: ScreenPoint, color: Rgba) {
        if let Some(i) = self.index(point) {
            self.combined[i] += color;
            self.sample_count[i] += 1;
        }
    }

    pub fn sample_count(&self, point: ScreenPoint) -> u32 {
        self.index(point).map_or(0, |i| self.sample_count[i])
    }

    /// Average of the accumulated samples of a pixel.
    pub fn pixel(&self, point: ScreenPoint) -> Rgba {
        match self.index(point) {
            Some(i) if self.sample_count[i] > 0 => {
                self.combined[i] * (1.0 / self.sample_count[i] as f32)
            }
            _ => Rgba::new(0.0, 0.0, 0.0, 0.0),
        }
    }

    pub fn has_denoised(&self) -> bool {
        self.denoised.is_some()
    }

    /// Denoised value of a pixel, falling back to the noisy average.
    pub fn denoised_pixel(&self, point: ScreenPoint) -> Rgba {
        match (&self.denoised, self.index(point)) {
            (Some(denoised), Some(i)) => denoised[i],
            _ => self.pixel(point),
        }
    }

    pub fn set_denoised(&mut self, point: ScreenPoint, color: Rgba) {
        let Some(i) = self.index(point) else {
            return;
        };
        self.denoised_pass_mut()[i] = color;
    }

    fn denoised_pass_mut(&mut self) -> &mut Vec<Rgba> {
        if self.denoised.is_none() {
            let noisy = self
                .params
                .block()
                .internal_points()
                .map(|p| self.pixel(p))
                .collect();
            self.denoised = Some(noisy);
        }
        self.denoised.get_or_insert_with(Vec::new)
    }

    /// Copies the denoised pass of `other` over the same region of this buffer.
    pub fn copy_denoised_from(&mut self, other: &RenderBuffers) {
        if !other.has_denoised() {
            return;
        }
        for p in other.params.block().internal_points() {
            self.set_denoised(p, other.denoised_pixel(p));
        }
    }

    /// Reverse of [`RenderBuffers::copy_tile`], reads back the accumulated samples of this
    /// tile from a full resolution frame.
    pub fn restore_from_frame(&mut self, frame: &RenderBuffers, divider: u32) {
        for point in self.params.block().internal_points() {
            let source = ScreenPoint::new(point.x * divider, point.y * divider);
            let (Some(src), Some(dst)) = (frame.index(source), self.index(point)) else {
                continue;
            };
            self.combined[dst] = frame.combined[src];
            self.sample_count[dst] = frame.sample_count[src];
        }
    }

    /// Writes a tile rendered with the given resolution divider into this full resolution
    /// buffer. Each tile pixel covers a `divider * divider` block, pixels of the last row and
    /// column of the downscaled frame stretch to the edge of the frame.
    pub fn copy_tile(&mut self, tile: &RenderBuffers, divider: u32) {
        let frame_block = self.params.block();
        let scaled_block = self.params.scaled(divider).block();
        let tile_block = tile.params.block();
        debug_assert!(scaled_block.contains_block(&tile_block));

        let region = tile_block.upscaled(divider, &scaled_block, &frame_block);

        if tile.has_denoised() {
            self.denoised_pass_mut();
        }

        for point in region.internal_points() {
            let source = ScreenPoint::new(
                (point.x / divider).min(scaled_block.max.x - 1),
                (point.y / divider).min(scaled_block.max.y - 1),
            );
            let (Some(src), Some(dst)) = (tile.index(source), self.index(point)) else {
                continue;
            };
            self.combined[dst] = tile.combined[src];
            self.sample_count[dst] = tile.sample_count[src];
            let value = tile.denoised_pixel(source);
            if let Some(denoised) = &mut self.denoised {
                denoised[dst] = value;
            }
        }
    }
}
