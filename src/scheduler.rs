use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

const MAX_DEFAULT_DEPTH: u16 = 8;

/// Async depth used when the configuration leaves it unset: one frame in
/// flight per pipeline element.
pub fn default_async_depth(stage_count: usize) -> u16 {
    (stage_count.min(MAX_DEFAULT_DEPTH as usize) as u16).max(1)
}

/// Throttles the driver loop to a target frame rate.
#[derive(Debug, Clone)]
pub struct SpeedGovernor {
    interval: Option<Duration>,
    started: Option<Instant>,
    frames: u64,
}

impl SpeedGovernor {
    pub fn new(max_fps: Option<f64>) -> Self {
        let interval = max_fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps));
        Self {
            interval,
            started: None,
            frames: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn is_limited(&self) -> bool {
        self.interval.is_some()
    }

    /// Sleeps until the next frame is due. Pacing is measured against the
    /// first call so jitter in individual iterations does not accumulate.
    pub fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = interval.mul_f64(self.frames as f64);
        self.frames += 1;
        let elapsed = started.elapsed();
        if due > elapsed {
            let wait = due - elapsed;
            trace!(?wait, "Throttling to target rate");
            thread::sleep(wait);
        }
    }
}
