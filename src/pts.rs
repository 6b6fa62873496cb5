//! Constant-frame-rate resequencing of decoded frames.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{PipelineError, PipelineResult};
use crate::surface::SurfaceLease;
use crate::sync::{Completion, SyncPoint};

fn default_window() -> usize {
    17
}

fn default_tolerance() -> f64 {
    0.75
}

fn default_wrap_modulus() -> Option<i64> {
    Some(1 << 33)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfrConfig {
    /// Nominal output frame duration in timestamp units.
    pub frame_duration: i64,
    /// Entries collected before the head is forced out.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Drift, as a fraction of a frame, that triggers a duplicate or a drop.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Timestamp counter range; differences beyond half of it have wrapped.
    #[serde(default = "default_wrap_modulus")]
    pub wrap_modulus: Option<i64>,
}

impl CfrConfig {
    pub fn new(frame_duration: i64) -> Self {
        Self {
            frame_duration,
            window: default_window(),
            tolerance: default_tolerance(),
            wrap_modulus: default_wrap_modulus(),
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    fn drift_threshold(&self) -> i64 {
        ((self.frame_duration as f64) * self.tolerance).round().max(1.0) as i64
    }

    /// Maps a raw timestamp difference into `(-modulus/2, modulus/2]`.
    pub fn normalize(&self, difference: i64) -> i64 {
        match self.wrap_modulus {
            Some(modulus) if modulus > 0 => {
                let reduced = difference.rem_euclid(modulus);
                if reduced > modulus / 2 {
                    reduced - modulus
                } else {
                    reduced
                }
            }
            _ => difference,
        }
    }

    fn wrap(&self, pts: i64) -> i64 {
        match self.wrap_modulus {
            Some(modulus) if modulus > 0 => pts.rem_euclid(modulus),
            _ => pts,
        }
    }
}

/// A decoded frame whose timestamp has not been read yet.
#[derive(Debug)]
pub struct PtsQueueEntry {
    pub sync: Option<SyncPoint>,
    pub surface: SurfaceLease,
    pub pts: Option<i64>,
    /// Subtracted from the resolved timestamp.
    pub offset: i64,
}

impl PtsQueueEntry {
    pub fn new(surface: SurfaceLease, sync: SyncPoint) -> Self {
        Self {
            sync: Some(sync),
            surface,
            pts: None,
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug)]
pub struct CfrFrame {
    pub surface: SurfaceLease,
    pub pts: i64,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CfrStats {
    pub emitted: u64,
    pub duplicated: u64,
    pub dropped: u64,
}

pub struct PtsResequencer {
    config: CfrConfig,
    resolve_lag: usize,
    sync_timeout: Duration,
    window: VecDeque<PtsQueueEntry>,
    expected: Option<i64>,
    stats: CfrStats,
}

impl PtsResequencer {
    pub fn new(config: CfrConfig, depth: u16, sync_timeout: Duration) -> PipelineResult<Self> {
        if config.frame_duration <= 0 {
            return Err(PipelineError::InvalidConfig(
                "constant frame rate needs a positive frame duration".into(),
            ));
        }
        if config.window == 0 {
            return Err(PipelineError::InvalidConfig(
                "resequencer window must hold at least one entry".into(),
            ));
        }
        Ok(Self {
            resolve_lag: (depth as usize / 2).max(1),
            window: VecDeque::with_capacity(config.window + 1),
            config,
            sync_timeout,
            expected: None,
            stats: CfrStats::default(),
        })
    }

    pub fn config(&self) -> &CfrConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn stats(&self) -> CfrStats {
        self.stats
    }

    pub fn expected(&self) -> Option<i64> {
        self.expected
    }

    pub fn push(&mut self, entry: PtsQueueEntry) -> PipelineResult<()> {
        self.window.push_back(entry);
        while self.unresolved() >= self.resolve_lag {
            self.resolve_next()?;
        }
        Ok(())
    }

    fn unresolved(&self) -> usize {
        self.window.iter().filter(|e| e.pts.is_none()).count()
    }

    fn resolve_next(&mut self) -> PipelineResult<bool> {
        let timeout = self.sync_timeout;
        let Some(entry) = self.window.iter_mut().find(|e| e.pts.is_none()) else {
            return Ok(false);
        };
        let pts = match entry.sync.take() {
            Some(sync) => match sync.wait("pts resolve", timeout)? {
                Completion::Frame { pts } => pts,
                Completion::Unit(_) => {
                    return Err(PipelineError::stage(
                        "pts resolve",
                        "decoder completion carried an encoded unit",
                    ));
                }
            },
            None => entry.surface.meta().pts,
        };
        let pts = if entry.offset == 0 {
            pts
        } else {
            self.config.wrap(pts - entry.offset)
        };
        entry.pts = Some(pts);
        trace!(pts, offset = entry.offset, "Resolved decoded timestamp");
        Ok(true)
    }

    /// Returns the next constant-rate frame, if the window allows a decision.
    ///
    /// Outside of flushing a decision is only made once the window is full.
    pub fn pop_ready(&mut self, flushing: bool) -> PipelineResult<Option<CfrFrame>> {
        let threshold = self.config.drift_threshold();
        loop {
            if self.window.is_empty() || (!flushing && self.window.len() < self.config.window) {
                return Ok(None);
            }
            while self.resolve_next()? {}

            let baseline = match self.expected {
                Some(expected) => expected,
                None => self.window.front().and_then(|e| e.pts).unwrap_or_default(),
            };
            let config = &self.config;
            self.window.make_contiguous().sort_by_key(|entry| {
                config.normalize(entry.pts.unwrap_or(baseline) - baseline)
            });

            let Some(head_pts) = self.window.front().and_then(|e| e.pts) else {
                return Ok(None);
            };
            let expected = *self.expected.get_or_insert(head_pts);
            let drift = self.config.normalize(head_pts - expected);

            if drift <= -threshold {
                self.window.pop_front();
                self.stats.dropped += 1;
                debug!(pts = head_pts, expected, drift, "Dropping late frame");
                continue;
            }

            let duplicate = drift >= threshold;
            let surface = if duplicate {
                self.stats.duplicated += 1;
                debug!(pts = head_pts, expected, drift, "Duplicating frame to fill gap");
                match self.window.front() {
                    Some(head) => head.surface.clone(),
                    None => return Ok(None),
                }
            } else {
                match self.window.pop_front() {
                    Some(head) => head.surface,
                    None => return Ok(None),
                }
            };

            self.expected = Some(expected + self.config.frame_duration);
            self.stats.emitted += 1;
            return Ok(Some(CfrFrame {
                surface,
                pts: self.config.wrap(expected),
                duplicate,
            }));
        }
    }
}
