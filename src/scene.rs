/// Scene collaborator of a session.
///
/// The session calls `update` from its worker thread, under the scene lock, before any
/// work whose resolution differs from the previous one.
pub trait Scene: Send {
    /// Prepares the scene for rendering a frame of the given (downscaled) size.
    /// Returns true if anything changed.
    fn update(&mut self, width: u32, height: u32, resolution_divider: u32) -> bool;
}

/// Scene whose only state is the resolution of its camera.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CameraScene {
    pub width: u32,
    pub height: u32,
    pub resolution_divider: u32,
}

impl Scene for CameraScene {
    fn update(&mut self, width: u32, height: u32, resolution_divider: u32) -> bool {
        let updated = CameraScene {
            width,
            height,
            resolution_divider,
        };
        let changed = *self != updated;
        if changed {
            log::debug!("Camera resolution {width}x{height} (divider {resolution_divider})");
        }
        *self = updated;
        changed
    }
}
