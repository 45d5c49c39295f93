use std::collections::VecDeque;

use index_vec::IndexVec;

use super::{TileIdx, TileKinds, TileState, TileTask};
use crate::buffers::{BufferParams, RenderBuffers};
use crate::geometry::ScreenBlock;
use crate::scheduler::RenderWork;
use crate::screen_block::{ScreenBlockExt, TileGrid, TileOrder};

#[derive(Debug)]
pub struct Tile {
    /// Pixel rectangle in the downscaled frame of the current work.
    pub block: ScreenBlock,
    pub state: TileState,
    /// The tile is checked out by a device.
    pub in_progress: bool,
    /// Samples accumulated in the buffers.
    pub sample: u32,
    /// `None` until first acquired, while checked out for rendering, and after being freed.
    pub buffers: Option<RenderBuffers>,
}

impl Tile {
    fn new(block: ScreenBlock) -> Self {
        Tile {
            block,
            state: TileState::Render,
            in_progress: false,
            sample: 0,
            buffers: None,
        }
    }
}

/// Tile table and state machine of the tiles of a frame.
///
/// Not synchronized, [`super::TileCoordinator`] guards it with a single lock.
#[derive(Debug)]
pub struct TileManager {
    tile_size: u32,
    order: TileOrder,
    pixel_size: u32,
    /// Finished tiles release their buffers after being written out.
    free_finished: bool,
    schedule_denoising: bool,

    params: BufferParams,
    total_samples: Option<u32>,

    work: RenderWork,
    /// Frame as seen by the current work.
    scaled: BufferParams,
    grid: TileGrid,
    tiles: IndexVec<TileIdx, Tile>,

    render_queue: VecDeque<TileIdx>,
    denoise_queue: VecDeque<TileIdx>,
    in_flight: usize,
}

impl TileManager {
    pub fn new(tile_size: u32, order: TileOrder, pixel_size: u32, background: bool) -> Self {
        let params = BufferParams::new(0, 0);
        TileManager {
            tile_size,
            order,
            pixel_size,
            free_finished: background,
            schedule_denoising: false,

            params,
            total_samples: None,

            work: RenderWork::default(),
            scaled: params,
            grid: params.block().tile_grid(tile_size),
            tiles: IndexVec::new(),

            render_queue: VecDeque::new(),
            denoise_queue: VecDeque::new(),
            in_flight: 0,
        }
    }

    /// Forgets all tiles, the grid is rebuilt by the next [`TileManager::begin_work`].
    pub fn reset(&mut self, params: BufferParams, samples: Option<u32>) {
        if self.in_flight > 0 {
            log::warn!("Resetting tiles with {} tiles still in flight", self.in_flight);
        }
        self.params = params;
        self.total_samples = samples;
        self.work = RenderWork::default();
        self.scaled = params;
        self.grid = params.block().tile_grid(self.tile_size);
        self.tiles = IndexVec::new();
        self.render_queue.clear();
        self.denoise_queue.clear();
        self.in_flight = 0;
    }

    pub fn set_samples(&mut self, samples: Option<u32>) {
        self.total_samples = samples;
    }

    pub fn set_schedule_denoising(&mut self, schedule: bool) {
        self.schedule_denoising = schedule;
    }

    pub fn schedules_denoising(&self) -> bool {
        self.schedule_denoising
    }

    pub fn free_finished(&self) -> bool {
        self.free_finished
    }

    /// Queues all tiles for rendering the given work.
    ///
    /// Tile buffers survive between work units of the same resolution, work that
    /// initializes buffers or changes the resolution starts with a fresh tile table.
    pub fn begin_work(&mut self, work: &RenderWork) {
        if self.in_flight > 0 {
            log::warn!("{} tiles were not released before new work", self.in_flight);
            self.in_flight = 0;
        }

        let rebuild = work.init_buffers
            || work.resolution_divider != self.work.resolution_divider
            || self.tiles.is_empty();
        self.work = *work;

        if rebuild {
            self.scaled = self.params.scaled(work.resolution_divider.max(1));
            self.grid = self.scaled.block().tile_grid(self.tile_size);
            self.tiles = self.grid.blocks().map(Tile::new).collect();
            log::trace!(
                "Tile grid {}x{} for {}x{} pixels",
                self.grid.size().x,
                self.grid.size().y,
                self.scaled.width,
                self.scaled.height
            );
        }

        for tile in self.tiles.iter_mut() {
            tile.state = TileState::Render;
            tile.in_progress = false;
        }
        self.render_queue = self
            .grid
            .ordering(self.order)
            .into_iter()
            .map(TileIdx::from_usize)
            .collect();
        self.denoise_queue.clear();
    }

    pub fn work(&self) -> &RenderWork {
        &self.work
    }

    /// Frame of the current work, downscaled by its resolution divider.
    pub fn scaled_params(&self) -> &BufferParams {
        &self.scaled
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tile(&self, index: TileIdx) -> &Tile {
        &self.tiles[index]
    }

    pub fn tile_mut(&mut self, index: TileIdx) -> &mut Tile {
        &mut self.tiles[index]
    }

    /// Buffer shape of a tile in the downscaled frame.
    pub fn tile_params(&self, index: TileIdx) -> BufferParams {
        self.scaled.for_block(&self.tiles[index].block)
    }

    pub fn neighbor(&self, index: TileIdx, dx: i32, dy: i32) -> Option<TileIdx> {
        self.grid
            .neighbor(index.index(), dx, dy)
            .map(TileIdx::from_usize)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// There are no queued tiles and none in flight.
    pub fn is_work_done(&self) -> bool {
        self.render_queue.is_empty() && self.denoise_queue.is_empty() && self.in_flight == 0
    }

    /// Task a device gets for the tile in its current state.
    pub fn task_for(&self, index: TileIdx, bake: bool) -> TileTask {
        match self.tiles[index].state {
            TileState::Denoise => TileTask::Denoise,
            _ if bake => TileTask::Bake,
            _ => TileTask::PathTrace,
        }
    }

    /// Pops the next tile of an accepted kind and marks it as in flight.
    /// Denoising is preferred so that finished tiles free up quickly.
    pub fn next_tile(&mut self, kinds: TileKinds) -> Option<TileIdx> {
        let index = kinds
            .denoise
            .then(|| self.denoise_queue.pop_front())
            .flatten()
            .or_else(|| kinds.render.then(|| self.render_queue.pop_front()).flatten())?;

        let tile = &mut self.tiles[index];
        debug_assert!(!tile.in_progress);
        tile.in_progress = true;
        self.in_flight += 1;
        Some(index)
    }

    /// Marks a tile as released after completing `task` with `sample` samples accumulated.
    ///
    /// Returns tiles that are finished for good and can be written out. These may include
    /// neighbors of the released tile that were waiting for its denoising.
    pub fn finish_tile(
        &mut self,
        index: TileIdx,
        task: TileTask,
        sample: u32,
        need_denoise: bool,
    ) -> Vec<TileIdx> {
        debug_assert!(self.in_flight > 0);
        self.in_flight = self.in_flight.saturating_sub(1);
        let is_final = self.is_final_sample(sample);
        let tile = &mut self.tiles[index];
        tile.in_progress = false;

        match task {
            TileTask::PathTrace | TileTask::Bake => {
                tile.sample = sample;
                if !is_final {
                    return Vec::new();
                }
                if self.schedule_denoising && need_denoise {
                    tile.state = TileState::Rendered;
                    self.queue_denoisable_neighbors(index);
                    Vec::new()
                } else {
                    tile.state = TileState::Done;
                    vec![index]
                }
            }
            TileTask::Denoise => {
                tile.state = TileState::Denoised;
                self.finish_denoised_neighbors(index)
            }
        }
    }

    /// A tile reaching `sample` has all its samples. Tiles of preview passes are never final.
    pub fn is_final_sample(&self, sample: u32) -> bool {
        self.work.resolution_divider <= self.pixel_size
            && self.total_samples.is_some_and(|total| sample >= total)
    }

    /// Indices of the tile and all its existing neighbors.
    fn neighborhood(&self, index: TileIdx) -> impl Iterator<Item = TileIdx> + '_ {
        itertools::iproduct!(-1..=1, -1..=1)
            .filter_map(move |(dy, dx)| self.neighbor(index, dx, dy))
    }

    fn neighborhood_reached(&self, index: TileIdx, state: TileState) -> bool {
        self.neighborhood(index)
            .all(|neighbor| self.tiles[neighbor].state >= state)
    }

    fn queue_denoisable_neighbors(&mut self, index: TileIdx) {
        let ready: Vec<TileIdx> = self
            .neighborhood(index)
            .filter(|&i| {
                self.tiles[i].state == TileState::Rendered
                    && self.neighborhood_reached(i, TileState::Rendered)
            })
            .collect();
        for i in ready {
            self.tiles[i].state = TileState::Denoise;
            self.denoise_queue.push_back(i);
        }
    }

    fn finish_denoised_neighbors(&mut self, index: TileIdx) -> Vec<TileIdx> {
        let ready: Vec<TileIdx> = self
            .neighborhood(index)
            .filter(|&i| {
                self.tiles[i].state == TileState::Denoised
                    && self.neighborhood_reached(i, TileState::Denoised)
            })
            .collect();
        for &i in &ready {
            self.tiles[i].state = TileState::Done;
        }
        ready
    }
}
