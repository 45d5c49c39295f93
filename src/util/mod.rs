mod stats;

use std::sync::{Mutex, MutexGuard};

pub use stats::DurationStats;

pub type Rgba = rgb::RGBA<f32>;

/// Locks a mutex shared between the session worker and the foreground.
/// A poisoned lock means one of the threads already panicked while holding it,
/// which leaves the session state undefined.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("Poisoned lock!")
}

/// Integer division rounding towards positive infinity.
pub fn divide_round_up(a: u32, b: u32) -> u32 {
    debug_assert!(b > 0);
    a.div_ceil(b)
}
