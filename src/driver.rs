//! Stage chain driver.
//!
//! One driver thread pulls frames from the source, pushes them through the
//! stage arena in order and hands encoder completions to the task pool.
//! Stages are addressed by index; the surface pool feeding stage `k` and
//! the pool stage `k` writes into are looked up from the pool plan.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::classifier::{Classifier, FrameAnalyzer, FrameSample, SceneCutAnalyzer};
use crate::error::{PipelineError, PipelineResult};
use crate::observability::{Counter, MetricsCollector};
use crate::pipeline::{
    FrameControl, PipelineContext, Stage, StageInput, StageKind, StageStatus, Submission,
};
use crate::pts::{PtsQueueEntry, PtsResequencer};
use crate::retry::retry_while_busy;
use crate::scheduler::SpeedGovernor;
use crate::sink::{Sink, SinkSummary};
use crate::sizing::PoolBoundary;
use crate::source::{FrameSource, Packet, SourceFrame};
use crate::surface::{Crop, FrameInfo, SurfaceLease, SurfacePool};
use crate::sync::{Completion, SyncPoint};
use crate::tasks::TaskPool;

/// A stage that reported more output for an input it has not finished.
struct Pending {
    stage: usize,
    input: SurfaceLease,
}

enum Produced {
    Frame {
        surface: SurfaceLease,
        sync: SyncPoint,
        more: bool,
    },
    Absorbed,
}

enum Encoded {
    Submitted { more: bool },
    Absorbed,
}

#[derive(Debug, Default)]
struct Counters {
    frames_read: u64,
    trimmed: u64,
    /// Duration of the trimmed frames, cut out of later timestamps.
    trim_offset: i64,
    entered: u64,
    busy_retries: u64,
    buffer_growths: u64,
    aborted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub async_depth: u16,
    pub pools: Vec<PoolBoundary>,
    pub frames_read: u64,
    pub frames_trimmed: u64,
    /// Frames that entered the filter chain, after trimming and resequencing.
    pub frames_entered: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub tasks_submitted: u64,
    pub tasks_delivered: u64,
    pub peak_in_flight: usize,
    pub busy_retries: u64,
    pub buffer_growths: u64,
    pub classified: u64,
    pub aborted: bool,
    pub sink: SinkSummary,
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    labels: Vec<String>,
    ctx: PipelineContext,
    pools: Vec<SurfacePool>,
    input_pool: Option<usize>,
    output_pools: Vec<Option<usize>>,
    /// Last input geometry seen by each stage.
    observed: Vec<FrameInfo>,
    /// Input crop of stages downstream of a convert stage, whose output
    /// geometry does not follow the source.
    fixed_crops: Vec<Option<Crop>>,
    tasks: TaskPool,
    resequencer: Option<PtsResequencer>,
    classifier: Option<Classifier>,
    analyzer: Option<Box<dyn FrameAnalyzer>>,
    governor: SpeedGovernor,
    abort: Arc<AtomicBool>,
    metrics: MetricsCollector,
    pending: Vec<Pending>,
    held_packet: Option<Packet>,
    counters: Counters,
}

impl Pipeline {
    pub fn new(
        stages: Vec<Box<dyn Stage>>,
        ctx: PipelineContext,
        input: FrameInfo,
    ) -> PipelineResult<Self> {
        if stages.last().map(|stage| stage.kind()) != Some(StageKind::Encode) {
            return Err(PipelineError::InvalidConfig(
                "pipeline must end with an encode stage".into(),
            ));
        }
        let labels: Vec<String> = stages
            .iter()
            .enumerate()
            .map(|(idx, stage)| format!("{}#{}", stage.name(), idx))
            .collect();

        let mut expected = Vec::with_capacity(stages.len());
        expected.push(input);
        for stage in &stages[..stages.len() - 1] {
            let previous = expected[expected.len() - 1];
            expected.push(stage.output_info(previous));
        }
        let mut converted = false;
        let fixed_crops: Vec<Option<Crop>> = stages
            .iter()
            .zip(&expected)
            .map(|(stage, info)| {
                let crop = converted.then_some(info.crop);
                converted |= stage.kind() == StageKind::Convert;
                crop
            })
            .collect();

        let pools: Vec<SurfacePool> = ctx
            .plan
            .boundaries
            .iter()
            .map(|boundary| {
                SurfacePool::allocate(
                    boundary.name.clone(),
                    boundary.size,
                    expected[boundary.consumer],
                )
            })
            .collect();
        ctx.plan.verify(&pools)?;
        let output_pools = (0..stages.len())
            .map(|idx| ctx.plan.output_pool_of(idx))
            .collect();

        let resequencer = ctx
            .cfr
            .clone()
            .map(|cfr| PtsResequencer::new(cfr, ctx.depth, ctx.sync_timeout))
            .transpose()?;

        Ok(Self {
            input_pool: ctx.plan.input_pool(),
            tasks: TaskPool::new(ctx.depth, ctx.bitstream_bytes, ctx.sync_timeout),
            governor: SpeedGovernor::new(ctx.max_fps),
            stages,
            labels,
            pools,
            output_pools,
            observed: expected,
            fixed_crops,
            resequencer,
            classifier: None,
            analyzer: None,
            abort: Arc::new(AtomicBool::new(false)),
            metrics: MetricsCollector::new(),
            pending: Vec::new(),
            held_packet: None,
            counters: Counters::default(),
            ctx,
        })
    }

    /// Replaces the default scene-cut analyzer used when classification is on.
    pub fn with_analyzer(mut self, analyzer: Box<dyn FrameAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn pools(&self) -> &[SurfacePool] {
        &self.pools
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Flag polled once per loop iteration; setting it ends the input early
    /// and drains what is already in flight.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    fn has_decoder(&self) -> bool {
        self.stages[0].kind() == StageKind::Decode
    }

    fn chain_start(&self) -> usize {
        usize::from(self.has_decoder())
    }

    fn encoder_index(&self) -> usize {
        self.stages.len() - 1
    }

    #[instrument(skip_all, fields(stages = self.stages.len(), depth = self.ctx.depth))]
    pub fn run(
        mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn Sink,
    ) -> PipelineResult<PipelineReport> {
        if source.produces_packets() != self.has_decoder() {
            return Err(PipelineError::InvalidConfig(if self.has_decoder() {
                "decode stage needs a source that produces packets".into()
            } else {
                "packet source needs a decode stage".into()
            }));
        }
        let started_at = Utc::now();
        let started = Instant::now();

        if self.ctx.classify {
            let analyzer: Box<dyn FrameAnalyzer> = match self.analyzer.take() {
                Some(analyzer) => analyzer,
                None => Box::new(SceneCutAnalyzer::default()),
            };
            let ring = self.ctx.plan.total_surfaces() + self.ctx.depth as usize + 1;
            self.classifier = Some(Classifier::spawn(
                ring,
                analyzer,
                self.ctx.classifier_timeout,
            )?);
        }

        let outcome = self
            .drive(source, sink)
            .and_then(|()| self.drain(sink))
            .and_then(|()| self.finish_classifier());
        if let Err(err) = outcome {
            error!(error = %err, "Pipeline failed");
            self.teardown(sink);
            return Err(err);
        }

        let report = self.report(started_at, started.elapsed(), sink);
        self.metrics.record_total_duration(started.elapsed());
        info!(
            frames_read = report.frames_read,
            delivered = report.tasks_delivered,
            dropped = report.frames_dropped,
            duplicated = report.frames_duplicated,
            aborted = report.aborted,
            "Pipeline finished"
        );
        Ok(report)
    }

    fn drive(&mut self, source: &mut dyn FrameSource, sink: &mut dyn Sink) -> PipelineResult<()> {
        loop {
            if self.abort.load(Ordering::Acquire) {
                warn!(frames_read = self.counters.frames_read, "Abort requested; draining");
                self.counters.aborted = true;
                return Ok(());
            }
            self.governor.pace();

            if let Some(pending) = self.pending.pop() {
                self.resume(pending, sink)?;
                continue;
            }
            if self.release_resequenced(false, sink)? {
                continue;
            }
            match self.next_input(source, sink)? {
                Some((surface, sync)) => self.admit(surface, sync, sink)?,
                None => return Ok(()),
            }
        }
    }

    /// Flushes every stage in chain order, then delivers every task.
    fn drain(&mut self, sink: &mut dyn Sink) -> PipelineResult<()> {
        debug!(pending = self.pending.len(), "Draining pipeline");
        self.settle(false, sink)?;

        if self.has_decoder() {
            while let Produced::Frame { surface, sync, .. } = self.decode(None, sink)? {
                self.admit(surface, Some(sync), sink)?;
                self.settle(false, sink)?;
            }
        }
        self.settle(true, sink)?;

        for index in self.chain_start()..self.encoder_index() {
            while let Produced::Frame { surface, .. } =
                self.run_stage(index, StageInput::Flush, sink)?
            {
                self.push_through(index + 1, surface, sink)?;
                self.settle(true, sink)?;
            }
            trace!(stage = self.labels[index].as_str(), "Stage flushed");
        }

        while let Encoded::Submitted { .. } = self.encode(None, sink)? {}

        let delivered = self.tasks.drain(sink)?;
        debug!(delivered, "Task pool drained");
        Ok(())
    }

    /// Clears the pending stack and, if asked, everything the resequencer
    /// still holds.
    fn settle(&mut self, flushing: bool, sink: &mut dyn Sink) -> PipelineResult<()> {
        loop {
            if let Some(pending) = self.pending.pop() {
                self.resume(pending, sink)?;
                continue;
            }
            if !self.release_resequenced(flushing, sink)? {
                return Ok(());
            }
        }
    }

    fn finish_classifier(&mut self) -> PipelineResult<()> {
        if let Some(mut classifier) = self.classifier.take() {
            let processed = classifier.finish()?;
            debug!(processed, "Classifier finished");
        }
        Ok(())
    }

    /// Error path: keep what already completed, release the rest.
    fn teardown(&mut self, sink: &mut dyn Sink) {
        self.pending.clear();
        self.held_packet = None;
        self.resequencer = None;
        let delivered = self.tasks.drain_best_effort(sink);
        if let Some(mut classifier) = self.classifier.take()
            && let Err(err) = classifier.finish()
        {
            debug!(error = %err, "Classifier stopped with an error");
        }
        warn!(delivered, "Pipeline torn down after failure");
    }

    fn next_input(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn Sink,
    ) -> PipelineResult<Option<(SurfaceLease, Option<SyncPoint>)>> {
        if self.has_decoder() {
            return self.next_decoded(source, sink);
        }
        let pool = self.input_pool.ok_or_else(|| {
            PipelineError::InvalidConfig("no input pool planned for raw frames".into())
        })?;
        let surface = self.acquire_surface(pool, sink)?;
        source.set_next_surface(surface);
        match source.next_frame()? {
            SourceFrame::Surface(surface) => Ok(Some((surface, None))),
            SourceFrame::EndOfStream => Ok(None),
            SourceFrame::Packet(packet) => Err(PipelineError::Source(format!(
                "packet {} needs a decode stage",
                packet.index
            ))),
        }
    }

    /// Feeds packets until the decoder returns a frame.
    fn next_decoded(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn Sink,
    ) -> PipelineResult<Option<(SurfaceLease, Option<SyncPoint>)>> {
        loop {
            let packet = match self.held_packet.take() {
                Some(packet) => packet,
                None => match source.next_frame()? {
                    SourceFrame::Packet(packet) => packet,
                    SourceFrame::EndOfStream => return Ok(None),
                    SourceFrame::Surface(_) => {
                        return Err(PipelineError::Source(
                            "raw frame delivered to a decode stage".into(),
                        ));
                    }
                },
            };
            match self.decode(Some(&packet), sink)? {
                Produced::Frame {
                    surface,
                    sync,
                    more,
                } => {
                    if more {
                        self.held_packet = Some(packet);
                    }
                    return Ok(Some((surface, Some(sync))));
                }
                Produced::Absorbed => continue,
            }
        }
    }

    fn decode(&mut self, packet: Option<&Packet>, sink: &mut dyn Sink) -> PipelineResult<Produced> {
        let input = match packet {
            Some(packet) => StageInput::Packet(packet),
            None => StageInput::Flush,
        };
        self.run_stage(0, input, sink)
    }

    /// Counts a decoded or raw frame and routes it past trim and the
    /// resequencer.
    fn admit(
        &mut self,
        surface: SurfaceLease,
        sync: Option<SyncPoint>,
        sink: &mut dyn Sink,
    ) -> PipelineResult<()> {
        let index = surface.meta().source_index;
        self.counters.frames_read += 1;
        if !self.ctx.trim.keeps(index) {
            self.counters.trimmed += 1;
            self.metrics.add(Counter::FramesTrimmed, 1);
            if let Some(resequencer) = &self.resequencer {
                self.counters.trim_offset += resequencer.config().frame_duration;
            }
            trace!(index, "Frame outside trim ranges");
            return Ok(());
        }
        match self.resequencer.as_mut() {
            Some(resequencer) => {
                let sync = sync.unwrap_or_else(|| {
                    SyncPoint::ready(Completion::Frame {
                        pts: surface.meta().pts,
                    })
                });
                resequencer.push(
                    PtsQueueEntry::new(surface, sync).with_offset(self.counters.trim_offset),
                )
            }
            None => self.enter_chain(surface, sink),
        }
    }

    fn release_resequenced(&mut self, flushing: bool, sink: &mut dyn Sink) -> PipelineResult<bool> {
        let Some(resequencer) = self.resequencer.as_mut() else {
            return Ok(false);
        };
        let Some(frame) = resequencer.pop_ready(flushing)? else {
            return Ok(false);
        };
        frame.surface.update_meta(|meta| meta.pts = frame.pts);
        self.enter_chain(frame.surface, sink)?;
        Ok(true)
    }

    fn enter_chain(&mut self, surface: SurfaceLease, sink: &mut dyn Sink) -> PipelineResult<()> {
        let sequence = self.counters.entered;
        self.counters.entered += 1;
        surface.update_meta(|meta| {
            meta.sequence = sequence;
            meta.companion = false;
        });
        if let Some(classifier) = self.classifier.as_mut() {
            classifier.signal_start(FrameSample::from_surface(sequence, &surface))?;
        }
        let start = self.chain_start();
        self.push_through(start, surface, sink)
    }

    fn push_through(
        &mut self,
        start: usize,
        frame: SurfaceLease,
        sink: &mut dyn Sink,
    ) -> PipelineResult<()> {
        let encoder = self.encoder_index();
        let mut current = frame;
        for index in start..encoder {
            match self.run_stage(index, StageInput::Surface(&current), sink)? {
                Produced::Absorbed => return Ok(()),
                Produced::Frame { surface, more, .. } => {
                    let input = mem::replace(&mut current, surface);
                    if more {
                        self.pending.push(Pending {
                            stage: index,
                            input,
                        });
                    }
                }
            }
        }
        if let Encoded::Submitted { more: true } = self.encode(Some(&current), sink)? {
            self.pending.push(Pending {
                stage: encoder,
                input: current,
            });
        }
        Ok(())
    }

    /// Re-invokes the deepest stage with output pending for its last input.
    fn resume(&mut self, pending: Pending, sink: &mut dyn Sink) -> PipelineResult<()> {
        if pending.stage == self.encoder_index() {
            if let Encoded::Submitted { more: true } = self.encode(Some(&pending.input), sink)? {
                self.pending.push(pending);
            }
            return Ok(());
        }
        match self.run_stage(pending.stage, StageInput::Surface(&pending.input), sink)? {
            Produced::Absorbed => Ok(()),
            Produced::Frame { surface, more, .. } => {
                let next = pending.stage + 1;
                if more {
                    self.pending.push(pending);
                }
                self.push_through(next, surface, sink)
            }
        }
    }

    fn run_stage(
        &mut self,
        index: usize,
        input: StageInput<'_>,
        sink: &mut dyn Sink,
    ) -> PipelineResult<Produced> {
        let work = match self.output_pools[index] {
            Some(pool) => Some(self.acquire_surface(pool, sink)?),
            None => None,
        };
        if let StageInput::Surface(surface) = input {
            self.prepare_input(index, surface);
        }
        let submission = Submission {
            input,
            work: work.as_ref(),
            bitstream_capacity: None,
            control: None,
        };
        match self.call_stage(index, submission)? {
            StageStatus::Ready(output) => self.produced(index, output.surface, output.sync, false),
            StageStatus::NeedMoreOutput(output) => {
                self.produced(index, output.surface, output.sync, true)
            }
            StageStatus::NeedMoreInput => Ok(Produced::Absorbed),
            status => Err(self.unexpected(index, status)),
        }
    }

    fn produced(
        &self,
        index: usize,
        surface: Option<SurfaceLease>,
        sync: SyncPoint,
        more: bool,
    ) -> PipelineResult<Produced> {
        let surface = surface.ok_or_else(|| {
            PipelineError::stage(self.labels[index].as_str(), "returned output without a surface")
        })?;
        Ok(Produced::Frame {
            surface,
            sync,
            more,
        })
    }

    fn encode(&mut self, input: Option<&SurfaceLease>, sink: &mut dyn Sink) -> PipelineResult<Encoded> {
        let index = self.encoder_index();
        let task = self.tasks.get_free_task(sink)?;

        let control = match (input, self.classifier.as_ref()) {
            (Some(surface), Some(classifier)) => {
                let meta = surface.meta();
                let hints = classifier.wait_done(meta.sequence)?;
                Some(FrameControl {
                    frame_type: hints.frame_type,
                    qp_offset: hints.qp_offsets[usize::from(meta.companion)],
                })
            }
            _ => None,
        };
        if let Some(surface) = input {
            self.prepare_input(index, surface);
        }
        let stage_input = match input {
            Some(surface) => StageInput::Surface(surface),
            None => StageInput::Flush,
        };

        let mut grown = false;
        loop {
            let submission = Submission {
                input: stage_input,
                work: None,
                bitstream_capacity: Some(self.tasks.bitstream_capacity(task)),
                control: control.as_ref(),
            };
            match self.call_stage(index, submission)? {
                StageStatus::Ready(output) => {
                    self.tasks.submit(task, output.sync, output.surface);
                    return Ok(Encoded::Submitted { more: false });
                }
                StageStatus::NeedMoreOutput(output) => {
                    self.tasks.submit(task, output.sync, output.surface);
                    return Ok(Encoded::Submitted { more: true });
                }
                StageStatus::NeedMoreInput => return Ok(Encoded::Absorbed),
                StageStatus::NotEnoughBuffer { required } if !grown => {
                    self.tasks
                        .grow_bitstream(task, required, self.ctx.max_bitstream_bytes)?;
                    self.counters.buffer_growths += 1;
                    self.metrics.add(Counter::BufferGrowths, 1);
                    grown = true;
                }
                StageStatus::NotEnoughBuffer { required } => {
                    return Err(PipelineError::stage(
                        self.labels[index].as_str(),
                        format!("still needs {required} bytes after the bitstream was grown"),
                    ));
                }
                status => return Err(self.unexpected(index, status)),
            }
        }
    }

    fn call_stage(&mut self, index: usize, submission: Submission<'_>) -> PipelineResult<StageStatus> {
        let _timer = self.metrics.start_stage(&self.labels[index]);
        let stage = &mut self.stages[index];
        let retried = retry_while_busy(&self.ctx.busy, &self.labels[index], || {
            stage.submit(submission)
        })?;
        if retried.busy_retries > 0 {
            let retries = u64::from(retried.busy_retries);
            self.counters.busy_retries += retries;
            self.metrics.add(Counter::BusyRetries, retries);
        }
        Ok(retried.value)
    }

    fn unexpected(&self, index: usize, status: StageStatus) -> PipelineError {
        let label = self.labels[index].as_str();
        match status {
            StageStatus::Fatal(message) => PipelineError::stage(label, message),
            StageStatus::NotEnoughBuffer { required } => PipelineError::stage(
                label,
                format!("asked for a {required} byte bitstream but produces surfaces"),
            ),
            other => PipelineError::stage(label, format!("unexpected status {other:?}")),
        }
    }

    fn acquire_surface(&mut self, pool: usize, sink: &mut dyn Sink) -> PipelineResult<SurfaceLease> {
        let pool = self.pools[pool].clone();
        if let Some(surface) = pool.checkout() {
            return Ok(surface);
        }
        self.metrics.add(Counter::SurfaceWaits, 1);
        trace!(pool = pool.name(), "Surface pool exhausted; synchronizing oldest task");
        while self.tasks.synchronize_first_task(sink)? {
            if let Some(surface) = pool.checkout() {
                return Ok(surface);
            }
        }
        match retry_while_busy(&self.ctx.busy, pool.name(), || pool.checkout()) {
            Ok(retried) => retried.value.ok_or_else(|| PipelineError::SurfaceStarved {
                pool: pool.name().to_string(),
                waited: Duration::ZERO,
            }),
            Err(PipelineError::BusyTimeout { waited, .. }) => Err(PipelineError::SurfaceStarved {
                pool: pool.name().to_string(),
                waited,
            }),
            Err(err) => Err(err),
        }
    }

    /// Sets the crop a stage reads from `surface`.
    ///
    /// Up to the convert stage every frame keeps the geometry it was decoded
    /// with, so frames buffered across a resolution change stay intact.
    /// Past it the crop is the one the convert stage produces.
    fn prepare_input(&mut self, index: usize, surface: &SurfaceLease) {
        if let Some(crop) = self.fixed_crops[index] {
            surface.set_crop(crop);
        }
        let info = surface.info();
        if self.observed[index] == info {
            return;
        }
        info!(
            stage = self.labels[index].as_str(),
            source_index = surface.meta().source_index,
            width = info.crop.width,
            height = info.crop.height,
            "Input geometry changed"
        );
        self.observed[index] = info;
    }

    fn report(&self, started_at: DateTime<Utc>, elapsed: Duration, sink: &dyn Sink) -> PipelineReport {
        let cfr = self
            .resequencer
            .as_ref()
            .map(|resequencer| resequencer.stats())
            .unwrap_or_default();
        self.metrics.add(Counter::FramesDropped, cfr.dropped);
        self.metrics.add(Counter::FramesDuplicated, cfr.duplicated);
        self.metrics
            .add(Counter::TasksDelivered, self.tasks.delivered());
        PipelineReport {
            started_at,
            duration_ms: elapsed.as_secs_f64() * 1_000.0,
            async_depth: self.ctx.depth,
            pools: self.ctx.plan.boundaries.clone(),
            frames_read: self.counters.frames_read,
            frames_trimmed: self.counters.trimmed,
            frames_entered: self.counters.entered,
            frames_dropped: cfr.dropped,
            frames_duplicated: cfr.duplicated,
            tasks_submitted: self.tasks.submitted(),
            tasks_delivered: self.tasks.delivered(),
            peak_in_flight: self.tasks.peak_in_flight(),
            busy_retries: self.counters.busy_retries,
            buffer_growths: self.counters.buffer_growths,
            classified: if self.ctx.classify {
                self.counters.entered
            } else {
                0
            },
            aborted: self.counters.aborted,
            sink: sink.summary(),
        }
    }
}
