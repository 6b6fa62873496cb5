//! Bounded ring of output tasks.
//!
//! Tasks are created once and recycled. Delivery to the sink always goes
//! through the oldest in-flight task first, so the sink sees units in
//! submission order no matter when the encoder finishes them.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace};

use crate::classifier::FrameType;
use crate::error::{PipelineError, PipelineResult};
use crate::sink::Sink;
use crate::surface::SurfaceLease;
use crate::sync::{Completion, EncodedUnit, SyncPoint};

/// Output buffer owned by a task until it is handed to the sink.
#[derive(Debug, Clone, Default)]
pub struct Bitstream {
    data: Vec<u8>,
    capacity: usize,
    pub sequence: u64,
    pub pts: i64,
    pub frame_type: FrameType,
}

impl Bitstream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            ..Self::default()
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn grow(&mut self, required: usize, limit: usize) -> PipelineResult<()> {
        if required > limit {
            return Err(PipelineError::BufferGrowth { required, limit });
        }
        if required > self.capacity {
            self.data.reserve(required - self.data.len());
            self.capacity = required;
        }
        Ok(())
    }

    fn fill(&mut self, unit: EncodedUnit) -> PipelineResult<()> {
        if unit.data.len() > self.capacity {
            return Err(PipelineError::stage(
                "encode",
                format!(
                    "unit of {} bytes overflowed a {} byte bitstream",
                    unit.data.len(),
                    self.capacity
                ),
            ));
        }
        self.data.clear();
        self.data.extend_from_slice(&unit.data);
        self.sequence = unit.sequence;
        self.pts = unit.pts;
        self.frame_type = unit.frame_type;
        Ok(())
    }

    fn clear(&mut self) {
        self.data.clear();
        self.sequence = 0;
        self.pts = 0;
        self.frame_type = FrameType::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    InFlight,
    Complete,
}

#[derive(Debug)]
pub struct Task {
    bitstream: Bitstream,
    sync: Option<SyncPoint>,
    surface: Option<SurfaceLease>,
    state: TaskState,
    submission: u64,
}

impl Task {
    fn recycle(&mut self) {
        self.bitstream.clear();
        self.sync = None;
        self.surface = None;
        self.state = TaskState::Free;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

pub struct TaskPool {
    tasks: Vec<Task>,
    in_flight: VecDeque<usize>,
    sync_timeout: Duration,
    submitted: u64,
    delivered: u64,
    peak_in_flight: usize,
}

impl TaskPool {
    pub fn new(depth: u16, bitstream_bytes: usize, sync_timeout: Duration) -> Self {
        let count = depth.max(1) as usize;
        let tasks = (0..count)
            .map(|_| Task {
                bitstream: Bitstream::with_capacity(bitstream_bytes),
                sync: None,
                surface: None,
                state: TaskState::Free,
                submission: 0,
            })
            .collect();
        debug!(tasks = count, bitstream_bytes, "Allocated output task pool");
        Self {
            tasks,
            in_flight: VecDeque::with_capacity(count),
            sync_timeout,
            submitted: 0,
            delivered: 0,
            peak_in_flight: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tasks.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        self.tasks[id.0].state
    }

    pub fn bitstream_capacity(&self, id: TaskId) -> usize {
        self.tasks[id.0].bitstream.capacity()
    }

    pub fn grow_bitstream(&mut self, id: TaskId, required: usize, limit: usize) -> PipelineResult<()> {
        debug!(task = id.0, required, "Growing task bitstream");
        self.tasks[id.0].bitstream.grow(required, limit)
    }

    fn free_task(&self) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|task| task.state == TaskState::Free)
            .map(TaskId)
    }

    /// Returns an idle task, delivering the oldest in-flight one first if
    /// every task is busy.
    pub fn get_free_task(&mut self, sink: &mut dyn Sink) -> PipelineResult<TaskId> {
        if let Some(id) = self.free_task() {
            return Ok(id);
        }
        self.synchronize_first_task(sink)?;
        self.free_task().ok_or_else(|| {
            PipelineError::InvalidConfig("output task pool has no tasks".into())
        })
    }

    /// Marks `id` as carrying the encoder call that produced `sync`.
    pub fn submit(&mut self, id: TaskId, sync: SyncPoint, surface: Option<SurfaceLease>) {
        let task = &mut self.tasks[id.0];
        task.sync = Some(sync);
        task.surface = surface;
        task.state = TaskState::InFlight;
        task.submission = self.submitted;
        self.submitted += 1;
        self.in_flight.push_back(id.0);
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
        trace!(task = id.0, submission = task.submission, "Task in flight");
    }

    /// Waits for the oldest in-flight task, writes it to the sink and frees
    /// it. Returns `false` when nothing is in flight.
    pub fn synchronize_first_task(&mut self, sink: &mut dyn Sink) -> PipelineResult<bool> {
        let Some(index) = self.in_flight.pop_front() else {
            return Ok(false);
        };
        let timeout = self.sync_timeout;
        let task = &mut self.tasks[index];
        let outcome = match task.sync.take() {
            Some(sync) => sync.wait("encode", timeout),
            None => Err(PipelineError::stage("encode", "task in flight without a sync point")),
        };
        let delivered = outcome.and_then(|completion| match completion {
            Completion::Unit(unit) => {
                task.bitstream.fill(unit)?;
                task.state = TaskState::Complete;
                sink.write_task(&task.bitstream)?;
                Ok(())
            }
            Completion::Frame { .. } => Err(PipelineError::stage(
                "encode",
                "encoder completion carried no output unit",
            )),
        });
        trace!(task = index, submission = task.submission, "Task synchronized");
        task.recycle();
        delivered?;
        self.delivered += 1;
        Ok(true)
    }

    /// Delivers every in-flight task and waits for the sink to settle.
    pub fn drain(&mut self, sink: &mut dyn Sink) -> PipelineResult<u64> {
        while self.synchronize_first_task(sink)? {}
        sink.wait_for_drain()?;
        Ok(self.delivered)
    }

    /// Like [`TaskPool::drain`], but keeps going past failed tasks and
    /// releases everything. Used on the error path.
    pub fn drain_best_effort(&mut self, sink: &mut dyn Sink) -> u64 {
        while !self.in_flight.is_empty() {
            if let Err(err) = self.synchronize_first_task(sink) {
                debug!(error = %err, "Discarding failed task during teardown");
            }
        }
        if let Err(err) = sink.wait_for_drain() {
            debug!(error = %err, "Sink drain failed during teardown");
        }
        self.delivered
    }
}
