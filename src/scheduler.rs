//! Decides how much work the session renders in each iteration.
//!
//! Interactive sessions start with a few cheap low resolution preview passes after every
//! reset and then accumulate one sample per iteration at full resolution. Background sessions
//! skip the preview and batch samples so that each work unit takes roughly
//! [`SchedulerConfig::background_work_time`].

use std::ops::Range;
use std::time::Duration;

use crate::buffers::BufferParams;
use crate::device::DenoiseParams;
use crate::geometry::scaled_size;
use crate::session::ParamsError;
use crate::util::DurationStats;

/// Half open range of sample indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleRange {
    pub start: u32,
    pub count: u32,
}

impl SampleRange {
    pub fn new(start: u32, count: u32) -> Self {
        SampleRange { start, count }
    }

    pub fn end(&self) -> u32 {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> Range<u32> {
        self.start..self.end()
    }
}

/// One unit of work dispatched to a device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderWork {
    /// Downsampling factor of the frame, includes the session pixel size.
    pub resolution_divider: u32,
    pub sample_range: SampleRange,
    /// Buffers have to be cleared before rendering this work.
    pub init_buffers: bool,
    pub denoise: bool,
}

impl RenderWork {
    /// Empty work must never be dispatched to a device.
    pub fn is_empty(&self) -> bool {
        self.sample_range.is_empty() || self.resolution_divider == 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Coarsest preview resolution divider used after a reset of an interactive session.
    /// Must be a power of two, 1 disables the preview.
    pub start_resolution_divider: u32,
    /// Preview passes aim to finish within this time.
    pub preview_time_target: Duration,
    /// Background work units aim to take this long.
    pub background_work_time: Duration,
    /// Upper limit of samples in a single background work unit.
    pub max_samples_per_work: u32,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if !self.start_resolution_divider.is_power_of_two() {
            return Err(ParamsError::StartResolutionDivider(
                self.start_resolution_divider,
            ));
        }
        if self.max_samples_per_work == 0 {
            return Err(ParamsError::ZeroSamplesPerWork);
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            start_resolution_divider: 8,
            preview_time_target: Duration::from_secs(1) / 30,
            background_work_time: Duration::from_secs(1),
            max_samples_per_work: 64,
        }
    }
}

#[derive(Debug)]
pub struct RenderScheduler {
    background: bool,
    pixel_size: u32,
    config: SchedulerConfig,

    total_samples: Option<u32>,
    denoise: DenoiseParams,
    buffer_params: BufferParams,

    /// Preview resolution divider, 1 once rendering at full resolution.
    resolution_divider: u32,
    /// Samples rendered at full resolution since the last reset.
    num_rendered_samples: u32,
    /// Size of the last background batch.
    last_num_samples: u32,
    cancelled: bool,

    /// Render time of a single sample of a single pixel.
    pixel_sample_time: DurationStats,
}

impl RenderScheduler {
    pub fn new(background: bool, pixel_size: u32, config: SchedulerConfig) -> Self {
        debug_assert!(pixel_size > 0);
        RenderScheduler {
            background,
            pixel_size,
            config,

            total_samples: None,
            denoise: DenoiseParams::default(),
            buffer_params: BufferParams::new(0, 0),

            resolution_divider: 1,
            num_rendered_samples: 0,
            last_num_samples: 0,
            cancelled: false,

            pixel_sample_time: DurationStats::default(),
        }
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// `None` renders until cancelled.
    pub fn total_samples(&self) -> Option<u32> {
        self.total_samples
    }

    pub fn set_total_samples(&mut self, samples: Option<u32>) {
        self.total_samples = samples;
    }

    pub fn set_denoise_params(&mut self, params: DenoiseParams) {
        self.denoise = params;
    }

    pub fn num_rendered_samples(&self) -> u32 {
        self.num_rendered_samples
    }

    /// Current preview divider, not including pixel size.
    pub fn resolution_divider(&self) -> u32 {
        self.resolution_divider
    }

    pub fn buffer_params(&self) -> &BufferParams {
        &self.buffer_params
    }

    /// Starts over for a new buffer shape. Must precede the first `get_render_work` after
    /// any change of the buffers.
    pub fn reset(&mut self, buffer_params: BufferParams, samples: Option<u32>) {
        self.buffer_params = buffer_params;
        self.total_samples = samples;
        self.num_rendered_samples = 0;
        self.last_num_samples = 0;
        self.cancelled = false;
        self.resolution_divider = if self.background {
            1
        } else {
            self.start_resolution_divider()
        };
    }

    /// No more work is handed out until the next reset.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Returns the next unit of work, or `None` when all samples are rendered.
    pub fn get_render_work(&mut self) -> Option<RenderWork> {
        if self.cancelled || self.buffer_params.pixel_count() == 0 || self.is_finished() {
            return None;
        }

        if self.resolution_divider > 1 {
            let work = RenderWork {
                resolution_divider: self.resolution_divider * self.pixel_size,
                sample_range: SampleRange::new(0, 1),
                init_buffers: true,
                denoise: false,
            };
            self.resolution_divider /= 2;
            return Some(work);
        }

        let start = self.num_rendered_samples;
        let count = self.num_samples_for_work();
        debug_assert!(count > 0);
        self.num_rendered_samples += count;
        self.last_num_samples = count;

        Some(RenderWork {
            resolution_divider: self.pixel_size,
            sample_range: SampleRange::new(start, count),
            init_buffers: start == 0,
            denoise: self.work_need_denoise(start + count),
        })
    }

    /// Feeds back how long the work took on the device.
    pub fn report_work_time(&mut self, work: &RenderWork, elapsed: Duration) {
        let size = scaled_size(
            self.buffer_params.block().size(),
            work.resolution_divider.max(1),
        );
        let pixel_samples = size.x as f64 * size.y as f64 * work.sample_range.count as f64;
        if pixel_samples > 0.0 {
            self.pixel_sample_time
                .add_sample(Duration::from_secs_f64(elapsed.as_secs_f64() / pixel_samples));
            log::trace!("Pixel sample time: {}", self.pixel_sample_time);
        }
    }

    fn is_finished(&self) -> bool {
        self.total_samples
            .is_some_and(|total| self.num_rendered_samples >= total)
    }

    /// Estimated time of a single sample with the given preview divider.
    fn estimated_time(&self, divider: u32) -> Option<Duration> {
        let per_pixel = self.pixel_sample_time.average()?;
        let size = scaled_size(self.buffer_params.block().size(), divider * self.pixel_size);
        Some(Duration::from_secs_f64(
            per_pixel * size.x as f64 * size.y as f64,
        ))
    }

    /// Finest preview divider whose pass still fits into the preview time target.
    /// Without any measurements the coarsest configured divider is used.
    fn start_resolution_divider(&self) -> u32 {
        let mut divider = self.config.start_resolution_divider;
        if self.pixel_sample_time.average().is_none() {
            return divider;
        }
        while divider > 1 {
            match self.estimated_time(divider / 2) {
                Some(time) if time < self.config.preview_time_target => divider /= 2,
                _ => break,
            }
        }
        divider
    }

    fn num_samples_for_work(&self) -> u32 {
        let remaining = self
            .total_samples
            .map_or(u32::MAX, |total| total - self.num_rendered_samples);

        if !self.background {
            return 1.min(remaining);
        }

        let growth_limit = (2 * self.last_num_samples).max(1);
        let count = match self.estimated_time(1) {
            Some(time) if !time.is_zero() => {
                let fitting = self.config.background_work_time.as_secs_f64() / time.as_secs_f64();
                (fitting as u32).clamp(1, growth_limit)
            }
            _ => growth_limit,
        };

        count.min(self.config.max_samples_per_work).min(remaining)
    }

    fn work_need_denoise(&self, end_sample: u32) -> bool {
        if !self.denoise.use_denoising || end_sample < self.denoise.start_sample {
            return false;
        }
        let last_work = self.total_samples == Some(end_sample);
        if self.background {
            last_work
        } else {
            true
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::DenoiserType;
    use assert2::{assert, let_assert};
    use test_case::test_case;
    use test_strategy::proptest;

    fn scheduler(background: bool, pixel_size: u32, start_divider: u32) -> RenderScheduler {
        RenderScheduler::new(
            background,
            pixel_size,
            SchedulerConfig {
                start_resolution_divider: start_divider,
                ..Default::default()
            },
        )
    }

    fn drain(scheduler: &mut RenderScheduler) -> Vec<RenderWork> {
        std::iter::from_fn(|| scheduler.get_render_work()).collect()
    }

    /// Full resolution work must cover [0, total) exactly once, in order.
    fn check_coverage(works: &[RenderWork], pixel_size: u32, total: u32) {
        let mut next = 0;
        for work in works.iter().filter(|w| w.resolution_divider == pixel_size) {
            assert!(!work.is_empty());
            assert!(work.sample_range.start == next);
            next = work.sample_range.end();
        }
        assert!(next == total);
    }

    #[proptest]
    fn full_resolution_work_covers_all_samples(
        #[strategy(0u32..300)] total: u32,
        background: bool,
        #[strategy(1u32..4)] pixel_size: u32,
        #[strategy(0u32..5)] start_divider_log: u32,
        #[strategy(proptest::collection::vec(0u64..50_000, 0..40))] times_us: Vec<u64>,
    ) {
        let mut s = scheduler(background, pixel_size, 1 << start_divider_log);
        s.reset(BufferParams::new(64, 48), Some(total));

        let mut works = Vec::new();
        let mut times = times_us.into_iter();
        while let Some(work) = s.get_render_work() {
            assert!(!work.is_empty());
            if let Some(t) = times.next() {
                s.report_work_time(&work, Duration::from_micros(t));
            }
            works.push(work);
        }

        check_coverage(&works, pixel_size, total);
        assert!(s.get_render_work().is_none());
    }

    #[proptest]
    fn scheduling_is_deterministic(
        #[strategy(1u32..100)] total: u32,
        background: bool,
        #[strategy(proptest::collection::vec(1u64..50_000, 0..20))] times_us: Vec<u64>,
    ) {
        let run = || {
            let mut s = scheduler(background, 1, 8);
            s.reset(BufferParams::new(320, 240), Some(total));
            let mut works = Vec::new();
            let mut times = times_us.iter();
            while let Some(work) = s.get_render_work() {
                if let Some(&t) = times.next() {
                    s.report_work_time(&work, Duration::from_micros(t));
                }
                works.push(work);
            }
            works
        };
        assert!(run() == run());
    }

    #[test]
    fn background_batches_grow() {
        let mut s = scheduler(true, 1, 8);
        s.reset(BufferParams::new(64, 64), Some(16));
        let counts: Vec<_> = drain(&mut s)
            .iter()
            .map(|w| w.sample_range.count)
            .collect();
        assert!(counts == vec![1, 2, 4, 8, 1]);
    }

    #[test]
    fn background_batches_follow_measured_time() {
        let mut s = scheduler(true, 1, 8);
        s.reset(BufferParams::new(100, 100), Some(1000));
        let first = s.get_render_work().unwrap();
        // 10ms per sample for the whole frame
        s.report_work_time(&first, Duration::from_millis(10));
        let second = s.get_render_work().unwrap();
        assert!(second.sample_range.count == 2);
        s.report_work_time(&second, Duration::from_millis(20));
        for _ in 0..10 {
            let work = s.get_render_work().unwrap();
            s.report_work_time(&work, Duration::from_millis(10) * work.sample_range.count);
        }
        let work = s.get_render_work().unwrap();
        assert!(work.sample_range.count == 64);
    }

    #[test]
    fn interactive_preview_steps_to_full_resolution() {
        let mut s = scheduler(false, 1, 8);
        s.reset(BufferParams::new(640, 480), Some(3));
        let works = drain(&mut s);
        let dividers: Vec<_> = works.iter().map(|w| w.resolution_divider).collect();
        assert!(dividers == vec![8, 4, 2, 1, 1, 1]);
        assert!(
            works[..3]
                .iter()
                .all(|w| w.init_buffers && w.sample_range == SampleRange::new(0, 1))
        );
        assert!(works[3].init_buffers);
        assert!(!works[4].init_buffers);
        check_coverage(&works, 1, 3);
    }

    #[test]
    fn pixel_size_multiplies_divider() {
        let mut s = scheduler(false, 2, 4);
        s.reset(BufferParams::new(640, 480), Some(1));
        let dividers: Vec<_> = drain(&mut s).iter().map(|w| w.resolution_divider).collect();
        assert!(dividers == vec![8, 4, 2]);
    }

    #[test]
    fn fast_device_skips_preview() {
        let mut s = scheduler(false, 1, 8);
        s.reset(BufferParams::new(100, 100), Some(10));
        let work = s.get_render_work().unwrap();
        s.report_work_time(&work, Duration::from_micros(1));
        s.reset(BufferParams::new(100, 100), Some(10));
        assert!(s.resolution_divider() == 1);
    }

    #[test]
    fn slow_device_keeps_coarse_preview() {
        let mut s = scheduler(false, 1, 8);
        s.reset(BufferParams::new(100, 100), Some(10));
        let work = s.get_render_work().unwrap();
        s.report_work_time(&work, Duration::from_secs(1));
        s.reset(BufferParams::new(100, 100), Some(10));
        assert!(s.resolution_divider() == 8);
    }

    #[test]
    fn background_has_no_preview() {
        let mut s = scheduler(true, 1, 8);
        s.reset(BufferParams::new(640, 480), Some(4));
        assert!(drain(&mut s).iter().all(|w| w.resolution_divider == 1));
    }

    #[test]
    fn total_samples_change_mid_run() {
        let mut s = scheduler(false, 1, 1);
        s.reset(BufferParams::new(16, 16), Some(2));
        let mut works = drain(&mut s);
        assert!(works.len() == 2);

        s.set_total_samples(Some(5));
        works.extend(drain(&mut s));
        check_coverage(&works, 1, 5);

        s.set_total_samples(Some(3));
        assert!(s.get_render_work().is_none());
    }

    #[test]
    fn unbounded_keeps_producing_work() {
        let mut s = scheduler(true, 1, 1);
        s.reset(BufferParams::new(16, 16), None);
        for _ in 0..100 {
            let_assert!(Some(work) = s.get_render_work());
            assert!(!work.is_empty());
        }
    }

    #[test]
    fn cancelled_until_reset() {
        let mut s = scheduler(false, 1, 1);
        s.reset(BufferParams::new(16, 16), Some(10));
        s.cancel();
        assert!(s.get_render_work().is_none());
        s.reset(BufferParams::new(16, 16), Some(10));
        assert!(s.get_render_work().is_some());
    }

    #[test_case(16, 0 ; "zero_samples")]
    #[test_case(0, 16 ; "empty_buffer")]
    fn no_work(width: u32, samples: u32) {
        let mut s = scheduler(false, 1, 4);
        s.reset(BufferParams::new(width, 16), Some(samples));
        assert!(s.get_render_work().is_none());
    }

    #[test_case(true, 8, vec![false, false, false, true] ; "background_denoises_last_work")]
    #[test_case(false, 4, vec![false, true, true, true] ; "interactive_denoises_after_start_sample")]
    fn denoise_flags(background: bool, total: u32, expected: Vec<bool>) {
        let mut s = scheduler(background, 1, 1);
        s.set_denoise_params(DenoiseParams {
            use_denoising: true,
            denoiser_type: DenoiserType::OpenImageDenoise,
            start_sample: 2,
        });
        s.reset(BufferParams::new(16, 16), Some(total));
        let flags: Vec<_> = drain(&mut s).iter().map(|w| w.denoise).collect();
        assert!(flags == expected);
    }

    #[test]
    fn empty_work_is_falsy() {
        assert!(RenderWork::default().is_empty());
        let work = RenderWork {
            resolution_divider: 1,
            sample_range: SampleRange::new(3, 0),
            ..Default::default()
        };
        assert!(work.is_empty());
    }

    #[test]
    fn config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let config = SchedulerConfig {
            start_resolution_divider: 6,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
