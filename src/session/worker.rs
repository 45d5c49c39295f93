use std::sync::atomic::Ordering;
use std::time::Instant;

use super::{SessionState, Shared};
use crate::buffers::{BufferParams, RenderBuffers};
use crate::device::{DenoiseParams, Device, RenderContext};
use crate::geometry::scaled_size;
use crate::scene::Scene;
use crate::scheduler::RenderWork;
use crate::util::lock;

impl<D: Device, S: Scene> Shared<D, S> {
    /// Body of the session worker thread.
    pub(super) fn run(&self) {
        log::debug!("Session worker started");
        self.progress.set_status("Waiting for render to start", "");

        if !self.progress.get_cancel() {
            self.progress.reset_sample();
            self.run_main_render_loop();
        }

        log::debug!(
            "Session worker exiting after waiting {} times",
            self.idle_waits.load(Ordering::Relaxed)
        );
        if self.progress.get_cancel() {
            let message = self.progress.get_cancel_message();
            self.progress.set_status(&message, "");
            self.set_state(SessionState::Cancelled);
        } else {
            self.progress.set_update();
            self.set_state(SessionState::Finished);
        }
    }

    fn run_main_render_loop(&self) {
        while !self.progress.get_cancel() {
            let wake_count = self.wake_count.load(Ordering::Acquire);
            let work = self.update_for_next_iteration();

            if work.is_none() {
                let (_, render_time) = self.progress.get_time();
                log::debug!("Rendering in main loop is done in {render_time:.2?}");

                if self.background {
                    self.progress.set_status("Finished", "");
                    break;
                }
            }

            if self.wait_for_work(work.as_ref(), wake_count) {
                continue;
            }
            if self.progress.get_cancel() {
                break;
            }
            if self.reset_pending.load(Ordering::SeqCst) {
                // Work was scheduled before a reset that arrived during a pause.
                continue;
            }

            if let Some(work) = work {
                self.render(&work);
            }
            self.progress.set_update();
        }
    }

    /// Applies a pending reset and asks the scheduler for the next work, updating the scene
    /// if the work has a different resolution than the last one.
    fn update_for_next_iteration(&self) -> Option<RenderWork> {
        let mut scene = lock(&self.scene);
        let delayed_reset = lock(&self.delayed_reset);

        if self.reset_pending.load(Ordering::SeqCst) {
            let mut buffers = lock(&self.buffers);
            self.reset_(&mut buffers, delayed_reset.params, delayed_reset.samples);
            self.reset_pending.store(false, Ordering::SeqCst);
        }

        let denoising = if self.tiles.is_baking() {
            DenoiseParams::default()
        } else {
            lock(&self.params).denoising
        };

        let (work, full_size) = {
            let mut scheduler = lock(&self.scheduler);
            scheduler.set_denoise_params(denoising);
            (scheduler.get_render_work(), scheduler.buffer_params().full_size())
        };

        if let Some(work) = &work {
            let started = Instant::now();
            let size = scaled_size(full_size, work.resolution_divider);
            let resolution = (size.x, size.y, work.resolution_divider);
            if scene.last_resolution != Some(resolution) {
                if scene.scene.update(size.x, size.y, work.resolution_divider) {
                    log::debug!(
                        "Scene updated for {}x{} (divider {})",
                        size.x,
                        size.y,
                        work.resolution_divider
                    );
                }
                scene.last_resolution = Some(resolution);
            }
            self.progress
                .add_skip_time(started.elapsed(), self.background);
        }

        work
    }

    /// Blocks an interactive session while paused or out of work.
    ///
    /// Returns true if the worker should go back to scheduling instead of rendering `work`.
    fn wait_for_work(&self, work: Option<&RenderWork>, wake_count: u64) -> bool {
        if self.background {
            return false;
        }

        let mut pause = lock(&self.pause);
        let no_work = work.is_none();

        if !*pause && !no_work {
            return false;
        }
        if self.progress.get_cancel() {
            return true;
        }
        if !*pause && self.wake_count.load(Ordering::Acquire) != wake_count {
            // Something changed while the work was being computed.
            return true;
        }

        self.update_status_time(*pause, no_work);
        self.set_state(if *pause {
            SessionState::Paused
        } else {
            SessionState::Running
        });

        loop {
            self.idle_waits.fetch_add(1, Ordering::Relaxed);
            let pause_started = Instant::now();
            pause = self.pause_cond.wait(pause).expect("Poisoned lock!");
            if *pause {
                self.progress
                    .add_skip_time(pause_started.elapsed(), self.background);
            }

            self.update_status_time(*pause, no_work);
            self.progress.set_update();

            if !*pause {
                break;
            }
        }

        self.set_state(SessionState::Running);
        no_work
    }

    /// Renders a single work unit with the buffers locked.
    ///
    /// Work is dropped if a reset arrived since it was scheduled. The check comes after the
    /// tiles start the work, so a later reset always cancels it.
    pub(super) fn render(&self, work: &RenderWork) {
        let mut buffers = lock(&self.buffers);

        self.tiles.begin_work(work);
        if self.reset_pending.load(Ordering::SeqCst) {
            log::debug!("Dropping work scheduled before a reset");
            return;
        }

        if work.init_buffers {
            // Only samples of the pass that keeps accumulating count towards progress.
            self.progress.reset_sample();
        }
        self.update_status_time(false, false);

        let started = Instant::now();
        let result = {
            let context = RenderContext::new(&self.tiles, &mut buffers, &self.progress);
            self.device.execute(work, &context)
        };
        lock(&self.scheduler).report_work_time(work, started.elapsed());

        if let Some(display) = lock(&self.display).as_mut() {
            display.update(&buffers);
        }

        self.update_status_time(false, false);

        if let Err(e) = result {
            log::error!("Device error: {e}");
            self.progress.set_error(&e.to_string());
        }
    }

    /// Applies a reset to the scheduler, the tiles and the frame buffers.
    fn reset_(&self, buffers: &mut RenderBuffers, params: BufferParams, samples: Option<u32>) {
        log::debug!(
            "Reset to {}x{} pixels, {:?} samples",
            params.width,
            params.height,
            samples
        );

        lock(&self.scheduler).reset(params, samples);
        self.tiles.reset(params, samples);
        buffers.reset(params);

        self.progress.reset_sample();
        let total = if self.background || samples.is_some() {
            params.pixel_count() as u64 * samples.unwrap_or(0) as u64
        } else {
            0
        };
        self.progress.set_total_pixel_samples(total);

        if !self.background {
            self.progress.set_start_time();
        }
        self.progress.set_render_start_time();

        if let Some(display) = lock(&self.display).as_mut() {
            display.update(buffers);
        }
    }

    pub(super) fn update_status_time(&self, show_pause: bool, show_done: bool) {
        let current = self.progress.get_current_sample();
        let total = lock(&self.scheduler).total_samples();
        let substatus = if self.background {
            let tiles = self.tiles.num_tiles();
            let rendered = self.progress.get_rendered_tiles();
            let show_sample = rendered < tiles && self.device.info().show_samples;
            let denoised = lock(&self.params)
                .denoising
                .use_denoising
                .then(|| self.progress.get_denoised_tiles());
            tiles_substatus(
                rendered,
                tiles,
                show_sample.then_some((current, total)),
                denoised,
            )
        } else {
            sample_substatus(current, total)
        };

        if show_pause {
            self.progress.set_status("Rendering Paused", &substatus);
        } else if show_done {
            self.progress.set_end_time();
            self.progress.set_status("Rendering Done", &substatus);
        } else {
            self.progress.set_status(&substatus, "");
        }
    }
}

fn sample_substatus(current: u32, total: Option<u32>) -> String {
    match total {
        Some(total) => format!("Sample {current}/{total}"),
        None => format!("Sample {current}"),
    }
}

/// Substatus of a background render, counting finished tiles.
fn tiles_substatus(
    rendered: usize,
    tiles: usize,
    sample: Option<(u32, Option<u32>)>,
    denoised: Option<usize>,
) -> String {
    let mut substatus = format!("Rendered {rendered}/{tiles} Tiles");
    if let Some((current, total)) = sample {
        substatus.push_str(", ");
        substatus.push_str(&sample_substatus(current, total));
    }
    if let Some(denoised) = denoised {
        substatus.push_str(&format!(", Denoised {denoised} tiles"));
    }
    substatus
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(3, 8, None, None => "Rendered 3/8 Tiles")]
    #[test_case(3, 8, Some((5, Some(16))), None => "Rendered 3/8 Tiles, Sample 5/16")]
    #[test_case(0, 2, Some((1, None)), None => "Rendered 0/2 Tiles, Sample 1" ; "unbounded")]
    #[test_case(8, 8, None, Some(6) => "Rendered 8/8 Tiles, Denoised 6 tiles")]
    fn background_substatus(
        rendered: usize,
        tiles: usize,
        sample: Option<(u32, Option<u32>)>,
        denoised: Option<usize>,
    ) -> String {
        tiles_substatus(rendered, tiles, sample, denoised)
    }
}
