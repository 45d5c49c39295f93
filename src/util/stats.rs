use std::fmt::Display;
use std::time::Duration;

/// Running statistics of measured durations.
#[derive(Clone, Debug, PartialEq)]
pub struct DurationStats {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub avg: f64,
}

impl DurationStats {
    pub fn add_sample(&mut self, value: Duration) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.avg += (value.as_secs_f64() - self.avg) / (self.count as f64);
    }

    /// Average in seconds, `None` until the first sample arrives.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then_some(self.avg)
    }
}

impl Default for DurationStats {
    fn default() -> Self {
        DurationStats {
            count: 0,
            min: Duration::MAX,
            max: Duration::ZERO,
            avg: 0.0,
        }
    }
}

impl Display for DurationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.3?} - {:.3?}; avg {:.3}s; {} samples",
            self.min, self.max, self.avg, self.count
        )
    }
}
