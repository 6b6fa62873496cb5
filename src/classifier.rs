//! Frame classification on a companion thread.
//!
//! The driver and the classifier share a ring of [`InputSlot`]s. The driver
//! publishes a sample into slot `sequence % ring` ("start"), the classifier
//! thread analyzes it and publishes hints ("done"). The driver only reads
//! hints from a slot in the `Done` phase, and the classifier only writes a
//! slot it has claimed from the `Started` phase.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::surface::SurfaceLease;

const POLL_SLICE: Duration = Duration::from_millis(20);
const SAMPLE_POINTS: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Idr,
    I,
    #[default]
    P,
    B,
}

impl FrameType {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Idr => b'K',
            Self::I => b'I',
            Self::P => b'P',
            Self::B => b'B',
        }
    }
}

/// Encoding hints for one source frame. `qp_offsets[1]` applies to the
/// companion frame when a rate-doubling filter is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameHints {
    pub frame_type: FrameType,
    pub qp_offsets: [i8; 2],
}

#[derive(Debug, Clone, Default)]
pub struct FrameSample {
    pub sequence: u64,
    pub luma: Vec<u8>,
}

impl FrameSample {
    /// Copies an evenly strided luma sample so the classifier never touches
    /// the surface itself.
    pub fn from_surface(sequence: u64, surface: &SurfaceLease) -> Self {
        let luma = surface.with_payload(|payload| {
            let visible = {
                let info = surface.info();
                (info.crop.width as usize * info.crop.height as usize).min(payload.len())
            };
            let plane = &payload[..visible];
            if plane.len() <= SAMPLE_POINTS {
                return plane.to_vec();
            }
            let stride = plane.len() / SAMPLE_POINTS;
            plane.iter().step_by(stride).take(SAMPLE_POINTS).copied().collect()
        });
        Self { sequence, luma }
    }
}

pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, sample: &FrameSample) -> Result<FrameHints>;
}

/// Scene-cut and GOP-position classifier.
#[derive(Debug, Clone)]
pub struct SceneCutAnalyzer {
    pub gop_size: u32,
    pub b_frames: u32,
    /// Mean absolute luma difference that starts a new GOP.
    pub scene_cut_threshold: f64,
    previous: Option<Vec<u8>>,
    since_key: u32,
}

impl Default for SceneCutAnalyzer {
    fn default() -> Self {
        Self::new(60, 2, 48.0)
    }
}

impl SceneCutAnalyzer {
    pub fn new(gop_size: u32, b_frames: u32, scene_cut_threshold: f64) -> Self {
        Self {
            gop_size: gop_size.max(1),
            b_frames,
            scene_cut_threshold,
            previous: None,
            since_key: 0,
        }
    }
}

impl FrameAnalyzer for SceneCutAnalyzer {
    fn analyze(&mut self, sample: &FrameSample) -> Result<FrameHints> {
        let difference = match &self.previous {
            Some(previous) if previous.len() == sample.luma.len() && !previous.is_empty() => {
                previous
                    .iter()
                    .zip(&sample.luma)
                    .map(|(a, b)| a.abs_diff(*b) as f64)
                    .sum::<f64>()
                    / previous.len() as f64
            }
            _ => f64::INFINITY,
        };

        let frame_type = if difference > self.scene_cut_threshold || self.since_key >= self.gop_size
        {
            self.since_key = 0;
            FrameType::Idr
        } else if self.since_key % (self.b_frames + 1) == 0 {
            FrameType::P
        } else {
            FrameType::B
        };
        self.since_key += 1;

        let activity = spatial_activity(&sample.luma);
        let offset = ((activity - 16.0) / 8.0).round().clamp(-4.0, 4.0) as i8;
        self.previous = Some(sample.luma.clone());

        Ok(FrameHints {
            frame_type,
            qp_offsets: [offset, offset.saturating_add(1).min(4)],
        })
    }
}

fn spatial_activity(luma: &[u8]) -> f64 {
    if luma.len() < 2 {
        return 0.0;
    }
    luma.windows(2)
        .map(|pair| pair[0].abs_diff(pair[1]) as f64)
        .sum::<f64>()
        / (luma.len() - 1) as f64
}

enum SlotPhase {
    Idle,
    Started { sequence: u64, sample: FrameSample },
    Analyzing { sequence: u64 },
    Done { sequence: u64, hints: FrameHints },
}

impl SlotPhase {
    fn sequence(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Started { sequence, .. }
            | Self::Analyzing { sequence }
            | Self::Done { sequence, .. } => Some(*sequence),
        }
    }

    fn owned_by_classifier(&self) -> bool {
        matches!(self, Self::Started { .. } | Self::Analyzing { .. })
    }
}

struct InputSlot {
    phase: Mutex<SlotPhase>,
    changed: Condvar,
}

struct Shared {
    slots: Vec<InputSlot>,
    end_at: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn slot(&self, sequence: u64) -> &InputSlot {
        &self.slots[(sequence % self.slots.len() as u64) as usize]
    }

    fn ended(&self, sequence: u64) -> bool {
        sequence >= self.end_at.load(Ordering::Acquire)
    }
}

/// Handle to the classifier thread, owned by the driver thread.
pub struct Classifier {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<u64>>,
    next_sequence: u64,
    timeout: Duration,
}

impl Classifier {
    pub fn spawn(
        ring_size: usize,
        analyzer: Box<dyn FrameAnalyzer>,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let ring_size = ring_size.max(1);
        let shared = Arc::new(Shared {
            slots: (0..ring_size)
                .map(|_| InputSlot {
                    phase: Mutex::new(SlotPhase::Idle),
                    changed: Condvar::new(),
                })
                .collect(),
            end_at: AtomicU64::new(u64::MAX),
            failure: Mutex::new(None),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("framepipe-classifier".into())
            .spawn(move || classify_loop(&worker, analyzer))
            .map_err(|err| PipelineError::ClassifierFailed(err.to_string()))?;
        info!(ring_size, "Classifier thread started");
        Ok(Self {
            shared,
            handle: Some(handle),
            next_sequence: 0,
            timeout,
        })
    }

    pub fn ring_size(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn started(&self) -> u64 {
        self.next_sequence
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Publishes the next frame's sample and returns its sequence number.
    pub fn signal_start(&mut self, mut sample: FrameSample) -> PipelineResult<u64> {
        let sequence = self.next_sequence;
        sample.sequence = sequence;
        let slot = self.shared.slot(sequence);
        let started = Instant::now();
        let mut phase = slot.phase.lock();
        while phase.owned_by_classifier() {
            self.check_progress(sequence, started)?;
            slot.changed.wait_for(&mut phase, POLL_SLICE);
        }
        *phase = SlotPhase::Started { sequence, sample };
        slot.changed.notify_all();
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Blocks until the hints for `sequence` are published.
    pub fn wait_done(&self, sequence: u64) -> PipelineResult<FrameHints> {
        if sequence >= self.next_sequence {
            return Err(PipelineError::ClassifierFailed(format!(
                "frame {sequence} was never submitted for classification"
            )));
        }
        let slot = self.shared.slot(sequence);
        let started = Instant::now();
        let mut phase = slot.phase.lock();
        loop {
            match &*phase {
                SlotPhase::Done {
                    sequence: done,
                    hints,
                } if *done == sequence => return Ok(*hints),
                other if other.sequence().is_some_and(|s| s > sequence) => {
                    return Err(PipelineError::ClassifierFailed(format!(
                        "hints for frame {sequence} were recycled before use"
                    )));
                }
                _ => {}
            }
            self.check_progress(sequence, started)?;
            slot.changed.wait_for(&mut phase, POLL_SLICE);
        }
    }

    fn check_progress(&self, sequence: u64, started: Instant) -> PipelineResult<()> {
        if !self.is_alive() {
            let reason = self
                .shared
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| "thread exited".to_string());
            return Err(PipelineError::ClassifierFailed(reason));
        }
        let waited = started.elapsed();
        if waited >= self.timeout {
            return Err(PipelineError::ClassifierStalled { sequence, waited });
        }
        Ok(())
    }

    /// Marks input as exhausted after every frame started so far and waits
    /// for the thread to finish them.
    pub fn finish(&mut self) -> PipelineResult<u64> {
        self.shared
            .end_at
            .store(self.next_sequence, Ordering::Release);
        for slot in &self.shared.slots {
            let _phase = slot.phase.lock();
            slot.changed.notify_all();
        }
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        let processed = handle
            .join()
            .map_err(|_| PipelineError::ClassifierFailed("thread panicked".into()))?;
        if let Some(reason) = self.shared.failure.lock().clone() {
            return Err(PipelineError::ClassifierFailed(reason));
        }
        debug!(processed, "Classifier thread joined");
        Ok(processed)
    }
}

impl Drop for Classifier {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.finish();
        }
    }
}

fn classify_loop(shared: &Shared, mut analyzer: Box<dyn FrameAnalyzer>) -> u64 {
    let mut sequence = 0u64;
    loop {
        if shared.ended(sequence) {
            return sequence;
        }
        let slot = shared.slot(sequence);
        let sample = {
            let mut phase = slot.phase.lock();
            loop {
                if let SlotPhase::Started {
                    sequence: started,
                    sample,
                } = &mut *phase
                    && *started == sequence
                {
                    let sample = mem::take(sample);
                    *phase = SlotPhase::Analyzing { sequence };
                    break sample;
                }
                if shared.ended(sequence) {
                    return sequence;
                }
                slot.changed.wait_for(&mut phase, POLL_SLICE);
            }
        };

        match analyzer.analyze(&sample) {
            Ok(hints) => {
                let mut phase = slot.phase.lock();
                *phase = SlotPhase::Done { sequence, hints };
                slot.changed.notify_all();
            }
            Err(err) => {
                error!(sequence, error = %err, "Frame classification failed");
                *shared.failure.lock() = Some(format!("frame {sequence}: {err:#}"));
                return sequence;
            }
        }
        sequence += 1;
    }
}
