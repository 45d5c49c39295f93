//! Render session: a worker thread driving the scheduler, the tiles and a device.
//!
//! The host only talks to [`Session`]. Requests coming from the host (reset, pause,
//! sample target changes, cancellation) are recorded under small locks and picked up by the
//! worker between work units, so a dispatch in flight is never torn down under the device.

mod params;
mod worker;

pub use params::{ParamsError, SessionParams};

use std::sync::{
    Arc, Condvar, Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::thread::{self, JoinHandle};

use bon::bon;

use crate::buffers::{BufferParams, RenderBuffers};
use crate::callbacks::{NoTileCallbacks, TileCallbacks};
use crate::device::{DenoiseParams, Device};
use crate::display::Display;
use crate::progress::Progress;
use crate::scene::Scene;
use crate::scheduler::RenderScheduler;
use crate::tiles::{TileCoordinator, TileManager};
use crate::util::lock;

/// Coarse state of a session as seen from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet.
    Idle,
    Running,
    Paused,
    /// The worker ran out of work (background) and exited.
    Finished,
    /// The worker exited after a cancel or an error.
    Cancelled,
}

/// Buffer reset requested by the host, applied by the worker before its next iteration.
struct DelayedReset {
    params: BufferParams,
    samples: Option<u32>,
}

struct SceneState<S> {
    scene: S,
    /// Width, height and resolution divider of the last scene update.
    last_resolution: Option<(u32, u32, u32)>,
}

/// State shared between the session handle and its worker thread.
///
/// Lock order: scene, delayed reset, buffers, scheduler, tiles. The pause lock is taken
/// after the delayed reset lock and is never held together with the scene or the buffers.
struct Shared<D, S> {
    background: bool,
    params: Mutex<SessionParams>,
    device: D,

    scene: Mutex<SceneState<S>>,
    delayed_reset: Mutex<DelayedReset>,
    /// A delayed reset waits to be applied. Only changed under the delayed reset lock, but
    /// readable while holding the buffers.
    reset_pending: AtomicBool,

    pause: Mutex<bool>,
    pause_cond: Condvar,
    /// Bumped under the pause lock with every wake up of the worker, so that the worker
    /// notices changes made between computing its work and going to sleep.
    wake_count: AtomicU64,
    /// How many times the worker blocked waiting for work or for the end of a pause.
    idle_waits: AtomicUsize,

    buffers: Mutex<RenderBuffers>,
    display: Mutex<Option<Box<dyn Display>>>,
    scheduler: Mutex<RenderScheduler>,
    tiles: TileCoordinator,
    progress: Arc<Progress>,
    state: Mutex<SessionState>,
}

impl<D: Device, S: Scene> Shared<D, S> {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Switches off denoising the device can't run.
    fn validate_denoising(&self, mut denoising: DenoiseParams) -> DenoiseParams {
        if !self
            .device
            .info()
            .supports_denoiser(denoising.denoiser_type)
        {
            if denoising.use_denoising {
                log::warn!(
                    "Denoiser {:?} is not supported by {}, disabling denoising",
                    denoising.denoiser_type,
                    self.device.info().name
                );
                self.progress
                    .set_error("Denoiser type not supported by compute device");
            }
            denoising.use_denoising = false;
        }
        denoising
    }

    fn apply_denoising(&self, denoising: DenoiseParams) {
        let denoising = self.validate_denoising(denoising);
        lock(&self.params).denoising = denoising;
        self.tiles
            .set_schedule_denoising(self.background && denoising.use_denoising);
    }

    /// Wakes the worker if it is waiting. Must be called with the pause lock held.
    fn notify_worker(&self, _pause: &MutexGuard<'_, bool>) {
        self.wake_count.fetch_add(1, Ordering::AcqRel);
        self.pause_cond.notify_all();
    }
}

/// A progressive render session.
///
/// Dropping the session cancels and joins its worker before the device is dropped.
pub struct Session<D: Device + 'static, S: Scene + 'static> {
    shared: Arc<Shared<D, S>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Stays set after the worker is joined.
    started: AtomicBool,
}

#[bon]
impl<D: Device + 'static, S: Scene + 'static> Session<D, S> {
    #[builder]
    pub fn new(
        params: SessionParams,
        device: D,
        scene: S,
        tile_callbacks: Option<Box<dyn TileCallbacks>>,
        display: Option<Box<dyn Display>>,
    ) -> Self {
        let progress = Arc::new(Progress::new());

        let mut scheduler =
            RenderScheduler::new(params.background, params.pixel_size, params.scheduler);
        scheduler.set_total_samples(params.samples);

        let tiles = TileCoordinator::new(
            TileManager::new(
                params.tile_size,
                params.tile_order,
                params.pixel_size,
                params.background,
            ),
            tile_callbacks.unwrap_or_else(|| Box::new(NoTileCallbacks)),
            Arc::clone(&progress),
        );
        tiles.set_samples(params.samples);

        let empty = BufferParams::new(0, 0);
        let buffers = RenderBuffers::new(device.info().id, empty);

        log::info!(
            "Creating {} session on {}",
            if params.background {
                "background"
            } else {
                "interactive"
            },
            device.info().name
        );

        let shared = Shared {
            background: params.background,
            params: Mutex::new(params),
            device,

            scene: Mutex::new(SceneState {
                scene,
                last_resolution: None,
            }),
            delayed_reset: Mutex::new(DelayedReset {
                params: empty,
                samples: params.samples,
            }),
            reset_pending: AtomicBool::new(false),

            pause: Mutex::new(false),
            pause_cond: Condvar::new(),
            wake_count: AtomicU64::new(0),
            idle_waits: AtomicUsize::new(0),

            buffers: Mutex::new(buffers),
            display: Mutex::new(display),
            scheduler: Mutex::new(scheduler),
            tiles,
            progress,
            state: Mutex::new(SessionState::Idle),
        };
        shared.apply_denoising(params.denoising);

        Session {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

impl<D: Device + 'static, S: Scene + 'static> Session<D, S> {
    /// Starts the worker thread. Does nothing if it was already started.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut worker = lock(&self.thread);
        if self.is_started() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        shared.set_state(SessionState::Running);
        let handle = thread::Builder::new()
            .name("session".to_string())
            .spawn(move || shared.run());
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                self.started.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Idle);
                Err(e.into())
            }
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Stops rendering as soon as possible and waits for the worker to exit.
    /// Safe to call at any time, any number of times.
    pub fn cancel(&self) {
        if !self.is_started() {
            return;
        }
        log::debug!("Cancelling session");
        self.shared.progress.set_cancel("Cancelled");
        lock(&self.shared.scheduler).cancel();
        self.shared.tiles.cancel_work();
        {
            let mut pause = lock(&self.shared.pause);
            *pause = false;
            self.shared.notify_worker(&pause);
        }
        self.wait();
    }

    /// Waits for the worker to exit on its own, without cancelling it.
    pub fn wait(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Session worker panicked");
                self.shared.set_state(SessionState::Cancelled);
            }
        }
    }

    /// Requests new frame buffers and sample target.
    ///
    /// The reset is applied by the worker before it schedules more work; a work unit in flight
    /// is asked to stop early. Of several resets arriving before the worker gets to them, only
    /// the last one is applied.
    pub fn reset(&self, params: BufferParams, samples: Option<u32>) {
        let mut delayed_reset = lock(&self.shared.delayed_reset);
        let pause = lock(&self.shared.pause);

        delayed_reset.params = params;
        delayed_reset.samples = samples;
        self.shared.reset_pending.store(true, Ordering::SeqCst);

        self.shared.device.cancel_current_task();
        self.shared.tiles.cancel_work();
        self.shared.notify_worker(&pause);
    }

    /// Changes the sample target of the running render.
    pub fn set_samples(&self, samples: Option<u32>) {
        {
            let mut params = lock(&self.shared.params);
            if params.samples == samples {
                return;
            }
            params.samples = samples;
        }
        self.shared.tiles.set_samples(samples);
        lock(&self.shared.scheduler).set_total_samples(samples);

        let pause = lock(&self.shared.pause);
        self.shared.notify_worker(&pause);
    }

    /// Pauses or resumes an interactive render. Setting the current value again has no effect.
    pub fn set_pause(&self, pause: bool) {
        let started = self.is_started();
        let mut current = lock(&self.shared.pause);
        if *current == pause {
            return;
        }
        *current = pause;

        if started {
            self.shared.notify_worker(&current);
        } else if pause {
            drop(current);
            self.shared.update_status_time(true, false);
        }
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.shared.pause)
    }

    /// Changes denoising settings. Requesting a denoiser the device doesn't support
    /// is an error and switches denoising off.
    pub fn set_denoising(&self, denoising: DenoiseParams) {
        self.shared.apply_denoising(denoising);
    }

    pub fn set_denoising_start_sample(&self, sample: u32) {
        {
            let mut params = lock(&self.shared.params);
            if params.denoising.start_sample == sample {
                return;
            }
            params.denoising.start_sample = sample;
        }
        let pause = lock(&self.shared.pause);
        self.shared.notify_worker(&pause);
    }

    pub fn params(&self) -> SessionParams {
        *lock(&self.shared.params)
    }

    pub fn set_display(&self, display: Box<dyn Display>) {
        *lock(&self.shared.display) = Some(display);
    }

    /// Presents the latest finished work unit. Returns false if there is nothing to show.
    pub fn draw(&self) -> bool {
        lock(&self.shared.display)
            .as_mut()
            .is_some_and(|display| display.draw())
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn progress(&self) -> &Progress {
        &self.shared.progress
    }

    pub fn device(&self) -> &D {
        &self.shared.device
    }

    /// Runs `f` with the scene locked, blocking the worker from updating it.
    pub fn with_scene<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.shared.scene).scene)
    }

    /// Runs `f` with the frame buffers locked. Blocks while a work unit is being rendered.
    pub fn with_buffers<R>(&self, f: impl FnOnce(&RenderBuffers) -> R) -> R {
        f(&lock(&self.shared.buffers))
    }
}

impl<D: Device + 'static, S: Scene + 'static> Drop for Session<D, S> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::{
        BoxFilterDenoiser, CpuDevice, DenoiserType, DeviceError, DeviceId, DeviceInfo, DeviceKind,
        RenderContext, RingsKernel,
    };
    use crate::display::ImageDisplay;
    use crate::scheduler::{RenderWork, SampleRange};
    use crate::screen_block::ScreenBlockExt;
    use crate::tiles::{RenderTile, TileKinds};
    use assert2::assert;
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(20);

    /// Holds the first dispatch until the test lets it go.
    struct Gate {
        started: mpsc::Sender<()>,
        go: Mutex<mpsc::Receiver<()>>,
    }

    struct MockDevice {
        info: DeviceInfo,
        works: Mutex<Vec<(RenderWork, BufferParams)>>,
        cancels: AtomicUsize,
        gate: Option<Gate>,
        error: Option<DeviceError>,
        delay: Duration,
    }

    impl MockDevice {
        fn new() -> Self {
            MockDevice {
                info: DeviceInfo {
                    id: DeviceId(0),
                    name: "Mock".to_string(),
                    kind: DeviceKind::Cpu,
                    denoisers: vec![DenoiserType::BoxFilter],
                    show_samples: false,
                },
                works: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
                gate: None,
                error: None,
                delay: Duration::ZERO,
            }
        }

        fn works(&self) -> Vec<(RenderWork, BufferParams)> {
            lock(&self.works).clone()
        }

        /// Number of full resolution samples dispatched, checking that they are contiguous.
        fn full_resolution_samples(&self) -> u32 {
            let mut next = 0;
            for (work, _) in self.works() {
                if work.resolution_divider == 1 {
                    assert!(work.sample_range.start == next);
                    next = work.sample_range.end();
                }
            }
            next
        }
    }

    impl Device for MockDevice {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        fn execute(
            &self,
            work: &RenderWork,
            context: &RenderContext<'_>,
        ) -> Result<(), DeviceError> {
            let first = {
                let mut works = lock(&self.works);
                works.push((*work, context.frame_params()));
                works.len() == 1
            };
            if let (true, Some(gate)) = (first, &self.gate) {
                gate.started.send(()).unwrap();
                lock(&gate.go).recv().unwrap();
            }
            if let Some(error) = &self.error {
                return Err(error.clone());
            }
            std::thread::sleep(self.delay);
            while let Some(mut tile) = context.acquire_tile(self.info.id, TileKinds::RENDER) {
                tile.sample = tile.sample_range.end();
                context.release_tile(tile, work.denoise);
            }
            Ok(())
        }

        fn cancel_current_task(&self) {
            self.cancels.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct RecordingScene {
        updates: Vec<(u32, u32, u32)>,
    }

    impl Scene for RecordingScene {
        fn update(&mut self, width: u32, height: u32, resolution_divider: u32) -> bool {
            self.updates.push((width, height, resolution_divider));
            true
        }
    }

    fn session<D: Device + 'static>(
        background: bool,
        samples: Option<u32>,
        device: D,
    ) -> Session<D, RecordingScene> {
        let params = SessionParams::builder()
            .background(background)
            .maybe_samples(samples)
            .tile_size(16)
            .build()
            .unwrap();
        Session::builder()
            .params(params)
            .device(device)
            .scene(RecordingScene::default())
            .build()
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < TIMEOUT {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn status<D: Device + 'static, S: Scene + 'static>(session: &Session<D, S>) -> String {
        session.progress().get_status().0
    }

    #[test]
    fn background_renders_all_samples() {
        let session = session(true, Some(16), MockDevice::new());
        session.reset(BufferParams::new(64, 48), Some(16));
        session.start().unwrap();
        session.wait();

        assert!(session.device().full_resolution_samples() == 16);
        assert!(session.device().works().iter().all(|(work, _)| work.resolution_divider == 1));
        assert!(session.state() == SessionState::Finished);
        assert!(status(&session) == "Finished");
        assert!(session.shared.idle_waits.load(Ordering::Relaxed) == 0);
        assert!(!session.progress().get_cancel());
        session.with_scene(|scene| assert!(scene.updates == vec![(64, 48, 1)]));
    }

    #[test]
    fn interactive_pause_and_resume() {
        let session = session(false, Some(4), MockDevice::new());
        session.reset(BufferParams::new(64, 64), Some(4));
        session.set_pause(true);
        assert!(status(&session) == "Rendering Paused");

        session.start().unwrap();
        assert!(wait_until(|| session.state() == SessionState::Paused));
        assert!(status(&session) == "Rendering Paused");
        assert!(session.device().works().is_empty());

        session.set_pause(false);
        assert!(wait_until(|| status(&session) == "Rendering Done"));
        assert!(session.device().full_resolution_samples() == 4);
        // Preview passes ran before full resolution.
        assert!(session.device().works()[0].0.resolution_divider == 8);

        session.cancel();
        assert!(session.state() == SessionState::Cancelled);
    }

    #[test]
    fn reset_during_dispatch_applies_before_next_work() {
        let (started_sender, started) = mpsc::channel();
        let (go, go_receiver) = mpsc::channel();
        let device = MockDevice {
            gate: Some(Gate {
                started: started_sender,
                go: Mutex::new(go_receiver),
            }),
            ..MockDevice::new()
        };
        let session = session(true, Some(4), device);
        let first = BufferParams::new(32, 32);
        let second = BufferParams::new(64, 16);
        session.reset(first, Some(4));
        session.start().unwrap();

        started.recv_timeout(TIMEOUT).unwrap();
        session.reset(second, Some(2));
        assert!(session.device().cancels.load(Ordering::Relaxed) >= 1);
        go.send(()).unwrap();
        session.wait();

        let works = session.device().works();
        assert!(works[0].1 == first);
        assert!(works[1..].iter().all(|(_, params)| *params == second));
        assert!(works[1].0.sample_range.start == 0);
        let samples: u32 = works[1..].iter().map(|(work, _)| work.sample_range.count).sum();
        assert!(samples == 2);
        session.with_scene(|scene| assert!(scene.updates.last() == Some(&(64, 16, 1))));
        assert!(session.state() == SessionState::Finished);
    }

    #[test]
    fn device_error_cancels_session() {
        let device = MockDevice {
            error: Some(DeviceError::Message("Out of device memory".to_string())),
            ..MockDevice::new()
        };
        let session = session(true, Some(8), device);
        session.reset(BufferParams::new(16, 16), Some(8));
        session.start().unwrap();
        session.wait();

        assert!(session.progress().get_error());
        assert!(session.progress().get_error_message() == "Out of device memory");
        assert!(session.progress().get_cancel());
        assert!(status(&session) == "Out of device memory");
        assert!(session.state() == SessionState::Cancelled);
        assert!(session.device().works().len() == 1);
    }

    #[test]
    fn pause_is_idempotent() {
        let device = MockDevice {
            delay: Duration::from_millis(1),
            ..MockDevice::new()
        };
        let session = session(false, None, device);
        session.reset(BufferParams::new(16, 16), None);
        session.start().unwrap();

        let wakes = || session.shared.wake_count.load(Ordering::Acquire);
        let before = wakes();
        session.set_pause(true);
        session.set_pause(true);
        assert!(wakes() == before + 1);
        assert!(session.is_paused());

        session.set_pause(false);
        session.set_pause(false);
        assert!(wakes() == before + 2);
        assert!(!session.is_paused());
    }

    #[test]
    fn latest_reset_wins() {
        let session = session(true, Some(4), MockDevice::new());
        session.reset(BufferParams::new(32, 32), Some(4));
        session.reset(BufferParams::new(48, 16), Some(8));
        session.start().unwrap();
        session.wait();

        let works = session.device().works();
        assert!(works.iter().all(|(_, params)| *params == BufferParams::new(48, 16)));
        assert!(session.device().full_resolution_samples() == 8);
    }

    #[test]
    fn cancel_while_paused() {
        let session = session(false, None, MockDevice::new());
        session.reset(BufferParams::new(16, 16), None);
        session.set_pause(true);
        session.start().unwrap();
        assert!(wait_until(|| session.state() == SessionState::Paused));

        session.cancel();
        assert!(session.state() == SessionState::Cancelled);
        assert!(status(&session) == "Cancelled");
        assert!(!session.is_paused());
        assert!(lock(&session.shared.scheduler).get_render_work().is_none());

        // Cancelling again is harmless.
        session.cancel();
    }

    #[test]
    fn background_status_counts_tiles() {
        let session = session(true, Some(2), MockDevice::new());
        session.reset(BufferParams::new(32, 32), Some(2));
        session.start().unwrap();
        session.wait();

        session.shared.update_status_time(false, false);
        assert!(status(&session) == "Rendered 4/4 Tiles");
        assert!(session.progress().get_rendered_tiles() == 4);
    }

    #[test]
    fn work_scheduled_before_reset_is_dropped() {
        let session = session(false, Some(4), MockDevice::new());
        session.reset(BufferParams::new(32, 32), Some(4));
        let work = RenderWork {
            resolution_divider: 1,
            sample_range: SampleRange::new(0, 1),
            init_buffers: true,
            denoise: false,
        };
        session.shared.render(&work);
        assert!(session.device().works().is_empty());
        assert!(session.progress().get_pixel_samples() == 0);
    }

    #[test]
    fn cancel_before_start_does_nothing() {
        let session = session(false, None, MockDevice::new());
        session.cancel();
        assert!(session.state() == SessionState::Idle);
        assert!(!session.progress().get_cancel());
    }

    #[test]
    fn raising_sample_target_continues_rendering() {
        let session = session(false, Some(2), MockDevice::new());
        session.reset(BufferParams::new(32, 32), Some(2));
        session.start().unwrap();
        assert!(wait_until(|| status(&session) == "Rendering Done"));
        assert!(session.device().full_resolution_samples() == 2);

        session.set_samples(Some(5));
        assert!(wait_until(|| session.device().full_resolution_samples() == 5));
        assert!(wait_until(|| status(&session) == "Rendering Done"));
        assert!(session.progress().get_status().1 == "Sample 0/5");
        session.cancel();
    }

    #[test]
    fn unsupported_denoiser_is_disabled() {
        let params = SessionParams::builder()
            .denoising(DenoiseParams {
                use_denoising: true,
                denoiser_type: DenoiserType::Optix,
                start_sample: 0,
            })
            .build()
            .unwrap();
        let session = Session::builder()
            .params(params)
            .device(MockDevice::new())
            .scene(RecordingScene::default())
            .build();

        assert!(!session.params().denoising.use_denoising);
        assert!(session.progress().get_error());
        assert!(
            session.progress().get_error_message()
                == "Denoiser type not supported by compute device"
        );
    }

    #[test]
    fn denoising_start_sample_updates_params() {
        let session = session(false, None, MockDevice::new());
        session.set_denoising(DenoiseParams {
            use_denoising: true,
            denoiser_type: DenoiserType::BoxFilter,
            start_sample: 0,
        });
        session.set_denoising_start_sample(4);
        assert!(session.params().denoising.use_denoising);
        assert!(session.params().denoising.start_sample == 4);
        assert!(!session.progress().get_error());
    }

    #[derive(Default)]
    struct WriteCounter(Mutex<Vec<crate::geometry::ScreenBlock>>);

    impl TileCallbacks for Arc<WriteCounter> {
        fn on_tile_written(&self, tile: &RenderTile) {
            lock(&self.0).push(tile.block);
        }
    }

    #[test]
    fn cpu_device_end_to_end() {
        let written = Arc::new(WriteCounter::default());
        let params = SessionParams::builder()
            .background(true)
            .samples(4)
            .tile_size(16)
            .denoising(DenoiseParams {
                use_denoising: true,
                denoiser_type: DenoiserType::BoxFilter,
                start_sample: 0,
            })
            .build()
            .unwrap();
        let device = CpuDevice::new(DeviceId(0), RingsKernel::default(), 2)
            .with_denoiser(BoxFilterDenoiser::default());
        let session = Session::builder()
            .params(params)
            .device(device)
            .scene(RecordingScene::default())
            .tile_callbacks(Box::new(Arc::clone(&written)))
            .display(Box::new(ImageDisplay::new()))
            .build();

        session.reset(BufferParams::new(32, 32), Some(4));
        session.start().unwrap();
        session.wait();

        assert!(session.state() == SessionState::Finished);
        assert!(session.progress().get_progress() == 1.0);
        assert!(lock(&written.0).len() == 4);
        session.with_buffers(|buffers| {
            assert!(buffers.has_denoised());
            for point in buffers.params().block().internal_points() {
                assert!(buffers.sample_count(point) == 4);
            }
        });
        assert!(session.draw());
    }
}
