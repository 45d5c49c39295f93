use std::sync::{
    Arc, Condvar, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use itertools::iproduct;

use super::{
    CENTER, NeighborTile, NeighborTiles, RenderTile, TileIdx, TileKinds, TileManager, TileTask,
    placeholder,
};
use crate::buffers::{BufferParams, RenderBuffers};
use crate::callbacks::TileCallbacks;
use crate::device::DeviceId;
use crate::geometry::ScreenPoint;
use crate::progress::Progress;
use crate::scheduler::RenderWork;
use crate::util::lock;

/// Hands out tiles of the current work to device threads and collects them back.
///
/// All tile state transitions and all tile callbacks happen under a single lock.
pub struct TileCoordinator {
    manager: Mutex<TileManager>,
    /// Signalled whenever a tile is released or the work is cancelled.
    tile_released: Condvar,
    /// Stops handing out tiles until the next work starts.
    work_cancelled: AtomicBool,
    callbacks: Box<dyn TileCallbacks>,
    progress: Arc<Progress>,
}

impl TileCoordinator {
    pub fn new(
        manager: TileManager,
        callbacks: Box<dyn TileCallbacks>,
        progress: Arc<Progress>,
    ) -> Self {
        TileCoordinator {
            manager: Mutex::new(manager),
            tile_released: Condvar::new(),
            work_cancelled: AtomicBool::new(false),
            callbacks,
            progress,
        }
    }

    fn manager(&self) -> MutexGuard<'_, TileManager> {
        lock(&self.manager)
    }

    pub fn reset(&self, params: BufferParams, samples: Option<u32>) {
        self.manager().reset(params, samples);
    }

    pub fn set_samples(&self, samples: Option<u32>) {
        self.manager().set_samples(samples);
    }

    pub fn set_schedule_denoising(&self, schedule: bool) {
        self.manager().set_schedule_denoising(schedule);
    }

    pub fn schedules_denoising(&self) -> bool {
        self.manager().schedules_denoising()
    }

    /// Tiles are rendered as bake tasks.
    pub fn is_baking(&self) -> bool {
        self.callbacks.bake()
    }

    pub fn begin_work(&self, work: &RenderWork) {
        self.manager().begin_work(work);
        self.progress.reset_tiles();
        self.work_cancelled.store(false, Ordering::Release);
    }

    /// Makes all pending and future `acquire_tile` calls of the current work return `None`.
    /// Tiles already in flight are still expected to be released.
    pub fn cancel_work(&self) {
        self.work_cancelled.store(true, Ordering::Release);
        let _manager = self.manager();
        self.tile_released.notify_all();
    }

    pub fn is_work_cancelled(&self) -> bool {
        self.work_cancelled.load(Ordering::Acquire)
    }

    fn should_stop(&self) -> bool {
        self.is_work_cancelled() || self.progress.get_cancel()
    }

    pub fn in_flight(&self) -> usize {
        self.manager().in_flight()
    }

    pub fn num_tiles(&self) -> usize {
        self.manager().len()
    }

    /// Checks out the next tile of the current work for a device.
    ///
    /// Returns `None` when the work is cancelled or there is nothing left for the
    /// requested kinds. A device accepting denoise tiles blocks while other tiles are
    /// in flight, since their release may make more tiles ready for denoising.
    pub fn acquire_tile(&self, device: DeviceId, kinds: TileKinds) -> Option<RenderTile> {
        let mut manager = self.manager();
        let index = loop {
            if self.should_stop() {
                return None;
            }
            if let Some(index) = manager.next_tile(kinds) {
                break index;
            }
            if kinds.denoise && manager.in_flight() > 0 {
                manager = self
                    .tile_released
                    .wait(manager)
                    .expect("Poisoned lock!");
                continue;
            }
            return None;
        };

        let work = *manager.work();
        let task = manager.task_for(index, self.is_baking());
        let params = manager.tile_params(index);
        let tile = manager.tile_mut(index);
        let restore_from_frame =
            task != TileTask::Denoise && tile.buffers.is_none() && tile.sample > 0;

        let mut buffers = match task {
            TileTask::Denoise => tile.buffers.clone(),
            TileTask::PathTrace | TileTask::Bake => tile.buffers.take(),
        }
        .unwrap_or_else(|| {
            log::trace!("Allocating buffers for tile {:?} on {:?}", tile.block, device);
            RenderBuffers::new(device, params)
        });
        buffers.move_device(device);

        let mut render_tile = RenderTile {
            index,
            block: tile.block,
            task,
            sample_range: work.sample_range,
            sample: work.sample_range.start,
            resolution_divider: work.resolution_divider,
            buffers,
            restore_from_frame,
        };

        match task {
            TileTask::Bake if work.sample_range.start == 0 => {
                self.callbacks.on_bake_tile_read(&mut render_tile)
            }
            TileTask::Denoise => {}
            _ => self.callbacks.on_tile_updated(&render_tile, true),
        }

        Some(render_tile)
    }

    /// Returns a tile checked out by [`TileCoordinator::acquire_tile`].
    ///
    /// Finished tiles are passed to the write callback (and dropped in background
    /// sessions), the rest to the update callback.
    pub fn release_tile(&self, tile: RenderTile, need_denoise: bool) {
        let mut manager = self.manager();

        let (index, task, sample) = (tile.index, tile.task, tile.sample);
        if task == TileTask::Denoise || manager.is_final_sample(sample) {
            self.progress.add_finished_tile(task == TileTask::Denoise);
        }
        if task == TileTask::Denoise {
            if let Some(buffers) = &mut manager.tile_mut(index).buffers {
                buffers.copy_denoised_from(&tile.buffers);
            }
        }

        let finished = manager.finish_tile(index, task, sample, need_denoise);

        if task != TileTask::Denoise {
            if !finished.contains(&index) {
                self.callbacks.on_tile_updated(&tile, false);
            }
            let stored = &mut manager.tile_mut(index).buffers;
            debug_assert!(stored.is_none());
            *stored = Some(tile.buffers);
        }
        for &finished_index in &finished {
            self.write_tile(&mut manager, finished_index);
        }

        drop(manager);
        self.tile_released.notify_all();
        self.progress.set_update();
    }

    fn write_tile(&self, manager: &mut TileManager, index: TileIdx) {
        let work = *manager.work();
        let free = manager.free_finished();
        let tile = manager.tile_mut(index);
        let Some(buffers) = tile.buffers.take() else {
            log::warn!("Finished tile {:?} has no buffers", tile.block);
            return;
        };
        let render_tile = RenderTile {
            index,
            block: tile.block,
            task: TileTask::PathTrace,
            sample_range: work.sample_range,
            sample: tile.sample,
            resolution_divider: work.resolution_divider,
            buffers,
            restore_from_frame: false,
        };
        self.callbacks.on_tile_written(&render_tile);
        if !free {
            tile.buffers = Some(render_tile.buffers);
        }
    }

    /// Snapshot of the 3x3 neighborhood of a tile.
    ///
    /// Missing neighbors are represented by zero sized blocks placed one tile away from
    /// the center tile, clamped to the frame.
    pub fn map_neighbor_tiles(&self, center: &RenderTile) -> NeighborTiles {
        let manager = self.manager();
        let frame = manager.scaled_params().block();
        let tile_size = manager.grid().tile_size() as i64;

        let offsets: Vec<(i32, i32)> = iproduct!(-1..=1, -1..=1).map(|(dy, dx)| (dx, dy)).collect();
        let tiles = std::array::from_fn(|i| {
            let (dx, dy) = offsets[i];
            if i == CENTER {
                return NeighborTile {
                    block: center.block,
                    buffers: Some(center.buffers.clone()),
                };
            }
            if let Some(neighbor) = manager.neighbor(center.index, dx, dy) {
                let tile = manager.tile(neighbor);
                if let Some(buffers) = &tile.buffers {
                    return NeighborTile {
                        block: tile.block,
                        buffers: Some(buffers.clone()),
                    };
                }
            }
            let clamp = |v: u32, d: i32, min: u32, max: u32| {
                (v as i64 + d as i64 * tile_size).clamp(min as i64, max as i64) as u32
            };
            placeholder(ScreenPoint::new(
                clamp(center.block.min.x, dx, frame.min.x, frame.max.x),
                clamp(center.block.min.y, dy, frame.min.y, frame.max.y),
            ))
        });

        NeighborTiles { tiles }
    }
}
