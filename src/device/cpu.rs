use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread;

use super::{
    Denoiser, Device, DeviceError, DeviceId, DeviceInfo, DeviceKind, Kernel, RenderContext,
    TileWorker,
};
use crate::scheduler::RenderWork;
use crate::tiles::{NeighborTiles, RenderTile, TileKinds, TileTask};
use crate::util::lock;

/// Renders on a pool of CPU threads, one per core by default, each pinned to its core.
pub struct CpuDevice<K: Kernel> {
    info: DeviceInfo,
    kernel: K,
    denoiser: Option<Box<dyn Denoiser>>,
    threads: usize,
    task_cancelled: AtomicBool,
}

impl<K: Kernel> CpuDevice<K> {
    /// Zero threads means one thread per CPU.
    pub fn new(id: DeviceId, kernel: K, threads: usize) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        CpuDevice {
            info: DeviceInfo {
                id,
                name: format!("CPU ({threads} threads)"),
                kind: DeviceKind::Cpu,
                denoisers: Vec::new(),
                show_samples: true,
            },
            kernel,
            denoiser: None,
            threads,
            task_cancelled: AtomicBool::new(false),
        }
    }

    pub fn with_denoiser(mut self, denoiser: impl Denoiser + 'static) -> Self {
        self.info.denoisers = vec![denoiser.denoiser_type()];
        self.denoiser = Some(Box::new(denoiser));
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn is_cancelled(&self, context: &RenderContext<'_>) -> bool {
        self.task_cancelled.load(Ordering::Acquire) || context.get_cancel()
    }

    fn run_worker(
        &self,
        worker_id: usize,
        work: &RenderWork,
        kinds: TileKinds,
        context: &RenderContext<'_>,
    ) -> Result<(), DeviceError> {
        let mut worker = TileWorker::new(worker_id);
        while !self.is_cancelled(context) {
            let Some(mut tile) = context.acquire_tile(self.info.id, kinds) else {
                break;
            };
            let result = match tile.task {
                TileTask::PathTrace | TileTask::Bake => {
                    worker.render_tile(&self.kernel, &mut tile, context, &self.task_cancelled)
                }
                TileTask::Denoise => self.denoise_tile(&mut tile, context),
            };
            context.release_tile(tile, work.denoise);
            result?;
        }
        Ok(())
    }

    fn denoise_tile(
        &self,
        tile: &mut RenderTile,
        context: &RenderContext<'_>,
    ) -> Result<(), DeviceError> {
        let Some(denoiser) = &self.denoiser else {
            return Ok(());
        };
        let neighbors = context.map_neighbor_tiles(tile);
        denoiser.denoise(&neighbors, &mut tile.buffers)
    }

    /// Denoises the whole frame at once, used when denoising is not scheduled per tile.
    fn denoise_frame(&self, context: &RenderContext<'_>) -> Result<(), DeviceError> {
        let Some(denoiser) = &self.denoiser else {
            return Ok(());
        };
        context.with_frame(|frame| {
            let neighbors = NeighborTiles::from_center(frame.params().block(), frame.clone());
            denoiser.denoise(&neighbors, frame)
        })
    }
}

impl<K: Kernel> Device for CpuDevice<K> {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn execute(&self, work: &RenderWork, context: &RenderContext<'_>) -> Result<(), DeviceError> {
        self.task_cancelled.store(false, Ordering::Release);

        let tile_denoising =
            work.denoise && self.denoiser.is_some() && context.schedules_tile_denoising();
        let kinds = if tile_denoising {
            TileKinds::ALL
        } else {
            TileKinds::RENDER
        };

        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let error: Mutex<Option<DeviceError>> = Mutex::new(None);

        thread::scope(|scope| {
            for worker_id in 0..self.threads {
                let core = (!cores.is_empty()).then(|| cores[worker_id % cores.len()]);
                let error = &error;
                let spawned = thread::Builder::new()
                    .name(format!("worker{worker_id}"))
                    .spawn_scoped(scope, move || {
                        if let Some(core) = core {
                            core_affinity::set_for_current(core);
                        }
                        if let Err(e) = self.run_worker(worker_id, work, kinds, context) {
                            log::error!("Worker {worker_id} failed: {e}");
                            self.task_cancelled.store(true, Ordering::Release);
                            lock(error).get_or_insert(e);
                        }
                    });
                if let Err(e) = spawned {
                    self.task_cancelled.store(true, Ordering::Release);
                    lock(&error).get_or_insert(DeviceError::ThreadSpawn(e.to_string()));
                    break;
                }
            }
        });

        if let Some(e) = error.into_inner().expect("Poisoned lock!") {
            return Err(e);
        }

        if work.denoise && !tile_denoising && !self.is_cancelled(context) {
            self.denoise_frame(context)?;
        }
        Ok(())
    }

    fn cancel_current_task(&self) {
        self.task_cancelled.store(true, Ordering::Release);
    }
}
