use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use crate::util::lock;

type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Progress of a render session, shared between the session worker, the devices and
/// the foreground.
///
/// Cancellation is sticky: once set, it stays set until [`Progress::reset`].
pub struct Progress {
    /// Mirrors `state.cancel` so that kernels can poll it without locking.
    cancel: AtomicBool,
    state: Mutex<ProgressState>,
    update_callback: Mutex<Option<UpdateCallback>>,
}

struct ProgressState {
    cancel: bool,
    cancel_message: String,
    error: bool,
    error_message: String,

    pixel_samples: u64,
    total_pixel_samples: u64,
    current_sample: u32,
    rendered_tiles: usize,
    denoised_tiles: usize,

    start_time: Instant,
    render_start_time: Instant,
    end_time: Option<Instant>,
    /// Time spent outside of rendering (scene updates, pauses), excluded from render time.
    skip_time: Duration,

    status: String,
    substatus: String,
}

impl ProgressState {
    fn new() -> Self {
        let now = Instant::now();
        ProgressState {
            cancel: false,
            cancel_message: String::new(),
            error: false,
            error_message: String::new(),

            pixel_samples: 0,
            total_pixel_samples: 0,
            current_sample: 0,
            rendered_tiles: 0,
            denoised_tiles: 0,

            start_time: now,
            render_start_time: now,
            end_time: None,
            skip_time: Duration::ZERO,

            status: "Initializing".to_string(),
            substatus: String::new(),
        }
    }
}

impl Progress {
    pub fn new() -> Self {
        Progress {
            cancel: AtomicBool::new(false),
            state: Mutex::new(ProgressState::new()),
            update_callback: Mutex::new(None),
        }
    }

    /// Clears everything except the update callback.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        *state = ProgressState::new();
        self.cancel.store(false, Ordering::Release);
    }

    pub fn set_cancel(&self, message: &str) {
        let mut state = lock(&self.state);
        state.cancel_message = message.to_string();
        state.cancel = true;
        self.cancel.store(true, Ordering::Release);
    }

    pub fn get_cancel(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn get_cancel_message(&self) -> String {
        lock(&self.state).cancel_message.clone()
    }

    /// Records an error. Implies cancellation with the error text as the cancel message.
    pub fn set_error(&self, message: &str) {
        let mut state = lock(&self.state);
        state.error_message = message.to_string();
        state.error = true;
        state.cancel_message = message.to_string();
        state.cancel = true;
        self.cancel.store(true, Ordering::Release);
    }

    pub fn get_error(&self) -> bool {
        lock(&self.state).error
    }

    pub fn get_error_message(&self) -> String {
        lock(&self.state).error_message.clone()
    }

    pub fn set_start_time(&self) {
        let mut state = lock(&self.state);
        state.start_time = Instant::now();
        state.end_time = None;
    }

    pub fn set_render_start_time(&self) {
        let mut state = lock(&self.state);
        state.render_start_time = Instant::now();
        state.skip_time = Duration::ZERO;
    }

    /// Freezes the elapsed time, so that further `get_time` calls stay accurate.
    pub fn set_end_time(&self) {
        lock(&self.state).end_time = Some(Instant::now());
    }

    /// Accounts time spent outside of rendering. In background renders all of the time
    /// counts as render time.
    pub fn add_skip_time(&self, skipped: Duration, background: bool) {
        if !background {
            lock(&self.state).skip_time += skipped;
        }
    }

    /// Returns total elapsed time and render time.
    pub fn get_time(&self) -> (Duration, Duration) {
        let state = lock(&self.state);
        let now = state.end_time.unwrap_or_else(Instant::now);
        let total = now.saturating_duration_since(state.start_time);
        let render = now
            .saturating_duration_since(state.render_start_time)
            .saturating_sub(state.skip_time);
        (total, render)
    }

    /// Clears sample and tile counters at the start of a run or after a reset.
    pub fn reset_sample(&self) {
        let mut state = lock(&self.state);
        state.pixel_samples = 0;
        state.current_sample = 0;
        state.rendered_tiles = 0;
        state.denoised_tiles = 0;
    }

    pub fn set_total_pixel_samples(&self, total: u64) {
        lock(&self.state).total_pixel_samples = total;
    }

    /// Adds rendered pixel samples; `sample` is the sample count reached by the reporting tile.
    pub fn add_samples(&self, pixel_samples: u64, sample: u32) {
        let mut state = lock(&self.state);
        state.pixel_samples += pixel_samples;
        state.current_sample = state.current_sample.max(sample);
    }

    pub fn get_current_sample(&self) -> u32 {
        lock(&self.state).current_sample
    }

    pub fn get_pixel_samples(&self) -> u64 {
        lock(&self.state).pixel_samples
    }

    /// Fraction of the finite sample target rendered so far, zero if the target is unknown.
    pub fn get_progress(&self) -> f64 {
        let state = lock(&self.state);
        if state.total_pixel_samples > 0 {
            (state.pixel_samples as f64 / state.total_pixel_samples as f64).min(1.0)
        } else {
            0.0
        }
    }

    pub fn add_finished_tile(&self, denoised: bool) {
        let mut state = lock(&self.state);
        if denoised {
            state.denoised_tiles += 1;
        } else {
            state.rendered_tiles += 1;
        }
    }

    /// Clears the tile counters when tiles start over for new work.
    pub fn reset_tiles(&self) {
        let mut state = lock(&self.state);
        state.rendered_tiles = 0;
        state.denoised_tiles = 0;
    }

    pub fn get_rendered_tiles(&self) -> usize {
        lock(&self.state).rendered_tiles
    }

    pub fn get_denoised_tiles(&self) -> usize {
        lock(&self.state).denoised_tiles
    }

    pub fn set_status(&self, status: &str, substatus: &str) {
        {
            let mut state = lock(&self.state);
            state.status = status.to_string();
            state.substatus = substatus.to_string();
        }
        self.set_update();
    }

    /// Returns status and substatus.
    pub fn get_status(&self) -> (String, String) {
        let state = lock(&self.state);
        (state.status.clone(), state.substatus.clone())
    }

    pub fn set_update_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.update_callback) = Some(Arc::new(callback));
    }

    /// Notifies the host that progress changed. The callback runs without any progress
    /// lock held, so it may freely query the progress.
    pub fn set_update(&self) {
        let callback = lock(&self.update_callback).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::assert;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn cancel_is_sticky() {
        let progress = Progress::new();
        assert!(!progress.get_cancel());
        progress.set_cancel("Stop");
        assert!(progress.get_cancel());
        progress.reset_sample();
        progress.set_status("Something", "");
        assert!(progress.get_cancel());
        assert!(progress.get_cancel_message() == "Stop");

        progress.reset();
        assert!(!progress.get_cancel());
    }

    #[test]
    fn concurrent_cancel_never_unsets() {
        let progress = Progress::new();
        thread::scope(|scope| {
            for i in 0..8 {
                let progress = &progress;
                scope.spawn(move || {
                    for _ in 0..100 {
                        progress.set_cancel(&format!("thread {i}"));
                        assert!(progress.get_cancel());
                    }
                });
            }
        });
        assert!(progress.get_cancel());
        assert!(progress.get_cancel_message().starts_with("thread "));
    }

    #[test]
    fn error_implies_cancel() {
        let progress = Progress::new();
        progress.set_error("Out of memory");
        assert!(progress.get_cancel());
        assert!(progress.get_error());
        assert!(progress.get_error_message() == "Out of memory");
        assert!(progress.get_cancel_message() == "Out of memory");
    }

    #[test]
    fn concurrent_sample_counting() {
        let progress = Progress::new();
        thread::scope(|scope| {
            for i in 0..4 {
                let progress = &progress;
                scope.spawn(move || {
                    for sample in 1..=250 {
                        progress.add_samples(10, sample + i);
                    }
                });
            }
            scope.spawn(|| {
                let mut last = 0;
                for _ in 0..1000 {
                    let current = progress.get_current_sample();
                    assert!(current >= last);
                    last = current;
                }
            });
        });
        assert!(progress.get_pixel_samples() == 4 * 250 * 10);
        assert!(progress.get_current_sample() == 253);
    }

    #[test]
    fn reset_sample_clears_counters() {
        let progress = Progress::new();
        progress.add_samples(100, 4);
        progress.add_finished_tile(false);
        progress.add_finished_tile(true);
        assert!(progress.get_rendered_tiles() == 1);
        assert!(progress.get_denoised_tiles() == 1);

        progress.reset_sample();
        assert!(progress.get_pixel_samples() == 0);
        assert!(progress.get_current_sample() == 0);
        assert!(progress.get_rendered_tiles() == 0);
        assert!(progress.get_denoised_tiles() == 0);
    }

    #[test]
    fn reset_tiles_keeps_samples() {
        let progress = Progress::new();
        progress.add_samples(100, 4);
        progress.add_finished_tile(false);
        progress.add_finished_tile(true);

        progress.reset_tiles();
        assert!(progress.get_rendered_tiles() == 0);
        assert!(progress.get_denoised_tiles() == 0);
        assert!(progress.get_current_sample() == 4);
    }

    #[test]
    fn progress_fraction() {
        let progress = Progress::new();
        assert!(progress.get_progress() == 0.0);
        progress.set_total_pixel_samples(200);
        progress.add_samples(50, 1);
        assert!(progress.get_progress() == 0.25);
        progress.add_samples(500, 2);
        assert!(progress.get_progress() == 1.0);
    }

    #[test]
    fn end_time_freezes_elapsed_time() {
        let progress = Progress::new();
        progress.set_end_time();
        let (total, render) = progress.get_time();
        thread::sleep(Duration::from_millis(5));
        assert!(progress.get_time() == (total, render));
    }

    #[test]
    fn skip_time_is_ignored_in_background() {
        let progress = Progress::new();
        progress.set_end_time();
        progress.add_skip_time(Duration::from_secs(3600), true);
        let (total, render) = progress.get_time();
        assert!(render <= total);
        assert!(total < Duration::from_secs(60));
    }

    #[test]
    fn status_change_runs_callback() {
        let progress = Arc::new(Progress::new());
        let calls = Arc::new(AtomicUsize::new(0));
        progress.set_update_callback({
            let calls = Arc::clone(&calls);
            let progress = Arc::clone(&progress);
            move || {
                // Querying from the callback must not deadlock.
                let _ = progress.get_status();
                calls.fetch_add(1, Ordering::Relaxed);
            }
        });
        progress.set_status("Rendering", "Sample 1/4");
        assert!(calls.load(Ordering::Relaxed) == 1);
        assert!(progress.get_status() == ("Rendering".to_string(), "Sample 1/4".to_string()));
    }
}
