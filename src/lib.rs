pub mod buffers;
pub mod callbacks;
pub mod device;
pub mod display;
pub mod geometry;
pub mod progress;
pub mod scene;
pub mod scheduler;
pub mod screen_block;
pub mod session;
pub mod tiles;
mod util;

pub use crate::buffers::{BufferParams, RenderBuffers};
pub use crate::progress::Progress;
pub use crate::scheduler::RenderWork;
pub use crate::session::{Session, SessionParams, SessionState};
pub use util::Rgba;
