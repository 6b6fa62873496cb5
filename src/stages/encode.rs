//! Synthetic encoder.
//!
//! Units are produced on a worker thread so completions arrive
//! asynchronously, optionally in batches that finish out of order. Each unit
//! starts with a fixed header describing the frame it was made from:
//!
//! | bytes  | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | frame type (`K`, `I`, `P`, `B`)         |
//! | 1      | QP offset as two's complement           |
//! | 2      | 1 for a companion frame                 |
//! | 3..11  | chain sequence, little endian           |
//! | 11..19 | presentation timestamp, little endian   |
//!
//! The rest of the unit is filler derived from the frame payload.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, trace, warn};

use super::{reject_unknown, take_u16, take_u32, take_u64};
use crate::classifier::FrameType;
use crate::pipeline::{
    FrameControl, Stage, StageInput, StageKind, StageOutput, StageParameters, StageStatus,
    Submission,
};
use crate::sizing::StageRequirements;
use crate::surface::{FrameMeta, SurfaceLease};
use crate::sync::{Completion, EncodedUnit, SyncPoint, SyncSignal};

pub const UNIT_HEADER_BYTES: usize = 19;

const BATCH_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    /// Frames held back before the first unit is emitted.
    pub lookahead: u16,
    pub unit_bytes: usize,
    /// Every `large_every`-th unit is `large_bytes` long; 0 disables.
    pub large_every: u64,
    pub large_bytes: usize,
    /// Every `busy_every`-th input is refused `busy_repeats` times; 0 disables.
    pub busy_every: u64,
    pub busy_repeats: u32,
    /// Chain sequence whose submission is rejected as fatal.
    pub fail_at_frame: Option<u64>,
    /// Unit index whose completion fails on the worker.
    pub fail_unit_at: Option<u64>,
    /// Units completed per batch, last one first; values below 2 keep order.
    pub reorder: u32,
    pub latency: Duration,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            lookahead: 0,
            unit_bytes: 64,
            large_every: 0,
            large_bytes: 4096,
            busy_every: 0,
            busy_repeats: 3,
            fail_at_frame: None,
            fail_unit_at: None,
            reorder: 0,
            latency: Duration::ZERO,
        }
    }
}

impl EncodeSettings {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let defaults = Self::default();
        let lookahead = take_u16(&mut params, "lookahead")?.unwrap_or(defaults.lookahead);
        let unit_bytes = take_u64(&mut params, "unit_bytes")?
            .map(|bytes| bytes as usize)
            .unwrap_or(defaults.unit_bytes);
        if unit_bytes < UNIT_HEADER_BYTES {
            bail!("encode 'unit_bytes' must be at least {UNIT_HEADER_BYTES}, got {unit_bytes}");
        }
        let large_every = take_u64(&mut params, "large_every")?.unwrap_or(0);
        let large_bytes = take_u64(&mut params, "large_bytes")?
            .map(|bytes| bytes as usize)
            .unwrap_or(defaults.large_bytes);
        if large_bytes < UNIT_HEADER_BYTES {
            bail!("encode 'large_bytes' must be at least {UNIT_HEADER_BYTES}, got {large_bytes}");
        }
        let busy_every = take_u64(&mut params, "busy_every")?.unwrap_or(0);
        let busy_repeats = take_u32(&mut params, "busy_repeats")?.unwrap_or(defaults.busy_repeats);
        let fail_at_frame = take_u64(&mut params, "fail_at_frame")?;
        let fail_unit_at = take_u64(&mut params, "fail_unit_at")?;
        let reorder = take_u32(&mut params, "reorder")?.unwrap_or(0);
        let latency = take_u64(&mut params, "latency_us")?
            .map(Duration::from_micros)
            .unwrap_or_default();
        reject_unknown(params, "encode")?;
        Ok(Self {
            lookahead,
            unit_bytes,
            large_every,
            large_bytes,
            busy_every,
            busy_repeats,
            fail_at_frame,
            fail_unit_at,
            reorder,
            latency,
        })
    }

    fn unit_size(&self, unit: u64) -> usize {
        if self.large_every > 0 && (unit + 1) % self.large_every == 0 {
            self.large_bytes
        } else {
            self.unit_bytes
        }
    }
}

struct Captured {
    meta: FrameMeta,
    control: Option<FrameControl>,
    digest: u8,
    surface: SurfaceLease,
}

struct Job {
    unit: EncodedUnit,
    fail: bool,
    surface: SurfaceLease,
    signal: SyncSignal,
}

struct Worker {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<u64>>,
}

impl Worker {
    fn spawn(batch: usize, latency: Duration) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("framepipe-encoder".into())
            .spawn(move || encode_loop(rx, batch, latency))?;
        Ok(Self {
            jobs: Some(tx),
            handle: Some(handle),
        })
    }

    fn send(&self, job: Job) -> std::result::Result<(), String> {
        match &self.jobs {
            Some(jobs) => jobs
                .send(job)
                .map_err(|_| "encoder worker stopped".to_string()),
            None => Err("encoder worker stopped".to_string()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(units) => debug!(units, "Encoder worker stopped"),
                Err(_) => warn!("Encoder worker panicked"),
            }
        }
    }
}

fn encode_loop(jobs: Receiver<Job>, batch: usize, latency: Duration) -> u64 {
    let mut completed = 0u64;
    let mut pending: Vec<Job> = Vec::with_capacity(batch);
    loop {
        let closed = match jobs.recv_timeout(BATCH_POLL) {
            Ok(job) => {
                pending.push(job);
                if pending.len() < batch {
                    continue;
                }
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                false
            }
            Err(RecvTimeoutError::Disconnected) => true,
        };
        while let Some(job) = pending.pop() {
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            let Job {
                unit,
                fail,
                surface,
                signal,
            } = job;
            drop(surface);
            if fail {
                signal.fail(format!("unit {} failed to encode", unit.sequence));
            } else {
                signal.complete(Completion::Unit(unit));
            }
            completed += 1;
        }
        if closed {
            return completed;
        }
    }
}

pub struct EncodeStage {
    settings: EncodeSettings,
    queue: VecDeque<Captured>,
    accepted: u64,
    emitted: u64,
    busy_remaining: Option<u32>,
    worker: Option<Worker>,
}

impl EncodeStage {
    pub fn new(settings: EncodeSettings) -> Self {
        Self {
            settings,
            queue: VecDeque::new(),
            accepted: 0,
            emitted: 0,
            busy_remaining: None,
            worker: None,
        }
    }

    pub fn from_params(params: StageParameters) -> Result<Self> {
        Ok(Self::new(EncodeSettings::from_params(params)?))
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    fn inject_busy(&mut self) -> bool {
        let every = self.settings.busy_every;
        if every == 0 || (self.accepted + 1) % every != 0 {
            return false;
        }
        let remaining = self
            .busy_remaining
            .get_or_insert(self.settings.busy_repeats);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    fn capture(&mut self, surface: &SurfaceLease, control: Option<&FrameControl>) {
        let digest = surface.with_payload(|payload| {
            payload
                .iter()
                .fold(0u8, |acc, byte| acc.wrapping_mul(31).wrapping_add(*byte))
        });
        self.queue.push_back(Captured {
            meta: surface.meta(),
            control: control.copied(),
            digest,
            surface: surface.clone(),
        });
        self.accepted += 1;
        self.busy_remaining = None;
    }

    fn build_unit(&self, frame: &Captured) -> EncodedUnit {
        let frame_type = match frame.control {
            Some(control) => control.frame_type,
            None if frame.meta.sequence == 0 => FrameType::Idr,
            None => FrameType::P,
        };
        let qp_offset = frame.control.map(|control| control.qp_offset).unwrap_or(0);
        let size = self.settings.unit_size(self.emitted);
        let mut data = Vec::with_capacity(size);
        data.push(frame_type.as_byte());
        data.push(qp_offset as u8);
        data.push(u8::from(frame.meta.companion));
        data.extend_from_slice(&frame.meta.sequence.to_le_bytes());
        data.extend_from_slice(&frame.meta.pts.to_le_bytes());
        data.resize(size, frame.digest);
        EncodedUnit {
            sequence: self.emitted,
            pts: frame.meta.pts,
            frame_type,
            data,
        }
    }

    fn dispatch(&mut self) -> StageStatus {
        let Some(frame) = self.queue.pop_front() else {
            return StageStatus::NeedMoreInput;
        };
        if self.worker.is_none() {
            match Worker::spawn(self.settings.reorder.max(1) as usize, self.settings.latency) {
                Ok(worker) => self.worker = Some(worker),
                Err(err) => return StageStatus::Fatal(format!("cannot start encoder: {err}")),
            }
        }
        let unit = self.build_unit(&frame);
        let fail = self.settings.fail_unit_at == Some(unit.sequence);
        trace!(
            unit = unit.sequence,
            sequence = frame.meta.sequence,
            pts = unit.pts,
            "Dispatching unit"
        );
        self.emitted += 1;
        let (signal, sync) = SyncPoint::pending();
        let job = Job {
            unit,
            fail,
            surface: frame.surface,
            signal,
        };
        match self.worker.as_ref().map(|worker| worker.send(job)) {
            Some(Ok(())) => StageStatus::Ready(StageOutput {
                surface: None,
                sync,
            }),
            Some(Err(message)) => StageStatus::Fatal(message),
            None => StageStatus::Fatal("encoder worker missing".into()),
        }
    }

    /// Whether this call will emit a unit, and so needs a bitstream.
    fn will_emit(&self, flushing: bool) -> bool {
        if flushing {
            !self.queue.is_empty()
        } else {
            self.queue.len() >= self.settings.lookahead as usize
        }
    }
}

impl Stage for EncodeStage {
    fn name(&self) -> &'static str {
        "encode"
    }

    fn kind(&self) -> StageKind {
        StageKind::Encode
    }

    fn requirements(&self, depth: u16) -> StageRequirements {
        StageRequirements::new(depth.saturating_add(self.settings.lookahead), 0)
            .with_bitstream_bytes(self.settings.unit_bytes)
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus {
        let input = match submission.input {
            StageInput::Surface(surface) => Some(surface),
            StageInput::Flush => None,
            StageInput::Packet(_) => return StageStatus::Fatal("encode expects surfaces".into()),
        };
        if input.is_some() && self.inject_busy() {
            return StageStatus::Busy;
        }
        if let Some(surface) = input
            && self.settings.fail_at_frame == Some(surface.meta().sequence)
        {
            return StageStatus::Fatal(format!(
                "rejected frame {} (pts {})",
                surface.meta().sequence,
                surface.meta().pts
            ));
        }
        if self.will_emit(input.is_none()) {
            let required = self.settings.unit_size(self.emitted);
            let available = submission.bitstream_capacity.unwrap_or(0);
            if available < required {
                return StageStatus::NotEnoughBuffer { required };
            }
        }
        match input {
            Some(surface) => {
                self.capture(surface, submission.control);
                if self.queue.len() > self.settings.lookahead as usize {
                    self.dispatch()
                } else {
                    StageStatus::NeedMoreInput
                }
            }
            None => self.dispatch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{FrameInfo, PixelLayout, SurfacePool};

    fn frame(pool: &SurfacePool, sequence: u64, pts: i64) -> SurfaceLease {
        let surface = pool.checkout().unwrap();
        surface.set_meta(FrameMeta {
            pts,
            sequence,
            ..FrameMeta::default()
        });
        surface
    }

    fn submit(stage: &mut EncodeStage, surface: &SurfaceLease, capacity: usize) -> StageStatus {
        stage.submit(Submission {
            bitstream_capacity: Some(capacity),
            ..Submission::new(StageInput::Surface(surface))
        })
    }

    #[test]
    fn unit_header_describes_the_frame() {
        let pool = SurfacePool::allocate("enc", 2, FrameInfo::new(16, 16, PixelLayout::Nv12));
        let mut stage = EncodeStage::new(EncodeSettings::default());
        let surface = frame(&pool, 0, 4500);
        let StageStatus::Ready(output) = submit(&mut stage, &surface, 64) else {
            panic!("expected a unit");
        };
        let Completion::Unit(unit) = output.sync.wait("encode", Duration::from_secs(5)).unwrap()
        else {
            panic!("expected an encoded unit");
        };
        assert_eq!(unit.data.len(), 64);
        assert_eq!(unit.data[0], b'K');
        assert_eq!(i64::from_le_bytes(unit.data[11..19].try_into().unwrap()), 4500);
    }

    #[test]
    fn small_bitstream_is_reported_before_input_is_consumed() {
        let pool = SurfacePool::allocate("enc", 2, FrameInfo::new(16, 16, PixelLayout::Nv12));
        let mut stage = EncodeStage::new(EncodeSettings {
            large_every: 1,
            large_bytes: 512,
            ..EncodeSettings::default()
        });
        let surface = frame(&pool, 0, 0);
        assert!(matches!(
            submit(&mut stage, &surface, 64),
            StageStatus::NotEnoughBuffer { required: 512 }
        ));
        assert!(stage.queue.is_empty());
        assert!(matches!(submit(&mut stage, &surface, 512), StageStatus::Ready(_)));
    }

    #[test]
    fn busy_injection_refuses_then_accepts() {
        let pool = SurfacePool::allocate("enc", 2, FrameInfo::new(16, 16, PixelLayout::Nv12));
        let mut stage = EncodeStage::new(EncodeSettings {
            busy_every: 1,
            busy_repeats: 2,
            ..EncodeSettings::default()
        });
        let surface = frame(&pool, 0, 0);
        assert!(matches!(submit(&mut stage, &surface, 64), StageStatus::Busy));
        assert!(matches!(submit(&mut stage, &surface, 64), StageStatus::Busy));
        assert!(matches!(submit(&mut stage, &surface, 64), StageStatus::Ready(_)));
    }
}
