use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use framepipe::classifier::{FrameAnalyzer, FrameHints, FrameSample, FrameType};
use framepipe::error::{PipelineError, PipelineResult};
use framepipe::pipeline::{
    PipelineConfig, Stage, StageInput, StageKind, StageOutput, StageRegistry, StageSpec,
    StageStatus, Submission, build_pipeline,
};
use framepipe::pts::CfrConfig;
use framepipe::sink::{FileSink, MemorySink, Sink};
use framepipe::source::{
    FrameSource, ResolutionChange, SourceFrame, SyntheticConfig, SyntheticSource,
};
use framepipe::sizing::StageRequirements;
use framepipe::stages::{default_registry, register_defaults};
use framepipe::surface::{FrameInfo, SurfaceLease, SurfacePool};
use framepipe::sync::{Completion, SyncPoint};
use framepipe::trim::TrimRange;
use framepipe::{Pipeline, PipelineReport};
use tempfile::tempdir;

fn build(specs: &[StageSpec], config: &PipelineConfig, source: &dyn FrameSource) -> Pipeline {
    build_pipeline(default_registry(), specs, config, source.frame_info()).unwrap()
}

fn run(
    specs: &[StageSpec],
    config: PipelineConfig,
    source: SyntheticConfig,
) -> (PipelineResult<PipelineReport>, MemorySink) {
    let mut source = SyntheticSource::new(source);
    let pipeline = build(specs, &config, &source);
    let sink = MemorySink::new();
    let mut writer = sink.clone();
    (pipeline.run(&mut source, &mut writer), sink)
}

fn frames(count: u64) -> SyntheticConfig {
    SyntheticConfig {
        frames: count,
        width: 64,
        height: 48,
        ..SyntheticConfig::default()
    }
}

fn packets(count: u64) -> SyntheticConfig {
    SyntheticConfig {
        packets: true,
        ..frames(count)
    }
}

fn header_pts(data: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[11..19]);
    i64::from_le_bytes(bytes)
}

#[test]
fn raw_frames_are_delivered_in_order_despite_reordered_completion() {
    let specs = [
        StageSpec::named("filter").with_param("delay", 2),
        StageSpec::named("encode")
            .with_param("lookahead", 3)
            .with_param("reorder", 4),
    ];
    let (report, sink) = run(&specs, PipelineConfig::default(), frames(40));
    let report = report.unwrap();

    assert_eq!(report.frames_read, 40);
    assert_eq!(report.tasks_delivered, 40);
    assert_eq!(sink.sequences(), (0..40).collect::<Vec<_>>());
    assert_eq!(
        sink.timestamps(),
        (0..40).map(|i| i * 3000).collect::<Vec<_>>()
    );
    assert!(report.peak_in_flight <= report.async_depth as usize);
    assert_eq!(sink.drain_count(), 1);
}

#[test]
fn decoded_stream_drains_every_buffered_frame() {
    let specs = [
        StageSpec::named("decode").with_param("delay", 3),
        StageSpec::named("filter").with_param("delay", 1),
        StageSpec::named("encode").with_param("reorder", 3),
    ];
    let config = PipelineConfig {
        async_depth: Some(4),
        ..PipelineConfig::default()
    };
    let (report, sink) = run(&specs, config, packets(25));
    let report = report.unwrap();

    assert_eq!(report.async_depth, 4);
    assert_eq!(report.tasks_delivered, 25);
    assert_eq!(sink.len(), 25);
    for (unit, pts) in sink.units().iter().zip(sink.timestamps()) {
        assert_eq!(header_pts(&unit.data), pts);
    }
}

#[test]
fn every_surface_is_released_after_a_run() {
    let specs = [
        StageSpec::named("decode").with_param("delay", 2),
        StageSpec::named("double_rate"),
        StageSpec::named("encode")
            .with_param("lookahead", 2)
            .with_param("reorder", 2),
    ];
    let mut source = SyntheticSource::new(packets(15));
    let pipeline = build(&specs, &PipelineConfig::default(), &source);
    let pools: Vec<SurfacePool> = pipeline.pools().to_vec();
    let mut sink = MemorySink::new();
    pipeline.run(&mut source, &mut sink).unwrap();

    for pool in &pools {
        assert_eq!(pool.free_count(), pool.capacity(), "{} leaked", pool.name());
    }
}

#[test]
fn frame_doubling_interleaves_companions() {
    let specs = [
        StageSpec::named("decode"),
        StageSpec::named("double_rate"),
        StageSpec::named("encode"),
    ];
    let (report, sink) = run(&specs, PipelineConfig::default(), packets(10));
    let report = report.unwrap();

    assert_eq!(report.frames_entered, 10);
    assert_eq!(report.tasks_delivered, 20);
    assert_eq!(
        sink.timestamps(),
        (0..20).map(|i| i * 1500).collect::<Vec<_>>()
    );
    let companions: Vec<u8> = sink.units().iter().map(|unit| unit.data[2]).collect();
    assert_eq!(
        companions,
        (0..20).map(|i| (i % 2) as u8).collect::<Vec<_>>()
    );
}

#[test]
fn trim_keeps_only_listed_frames() {
    let config = PipelineConfig {
        trim: vec![
            TrimRange { start: 10, end: 11 },
            TrimRange { start: 2, end: 4 },
        ],
        ..PipelineConfig::default()
    };
    let specs = [StageSpec::named("filter"), StageSpec::named("encode")];
    let (report, sink) = run(&specs, config, frames(20));
    let report = report.unwrap();

    assert_eq!(report.frames_read, 20);
    assert_eq!(report.frames_trimmed, 15);
    assert_eq!(report.frames_entered, 5);
    assert_eq!(sink.timestamps(), vec![6000, 9000, 12000, 30000, 33000]);
    assert_eq!(sink.sequences(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn trim_closes_the_gap_under_constant_rate() {
    let specs = [StageSpec::named("decode"), StageSpec::named("encode")];
    let config = PipelineConfig {
        cfr: Some(CfrConfig::new(3000)),
        trim: vec![
            TrimRange { start: 0, end: 9 },
            TrimRange { start: 20, end: 29 },
        ],
        ..PipelineConfig::default()
    };
    let (report, sink) = run(&specs, config, packets(30));
    let report = report.unwrap();

    assert_eq!(report.frames_trimmed, 10);
    assert_eq!(report.frames_entered, 20);
    assert_eq!(report.frames_duplicated, 0);
    assert_eq!(report.frames_dropped, 0);
    assert_eq!(report.tasks_delivered, 20);
    assert_eq!(
        sink.timestamps(),
        (0..20).map(|i| i * 3000).collect::<Vec<_>>()
    );
}

#[test]
fn constant_rate_output_absorbs_jitter() {
    let specs = [StageSpec::named("decode"), StageSpec::named("encode")];
    let config = PipelineConfig {
        cfr: Some(CfrConfig::new(1000)),
        ..PipelineConfig::default()
    };
    let source = SyntheticConfig {
        timestamps: Some(vec![0, 1000, 2400, 3000]),
        ..packets(0)
    };
    let (report, sink) = run(&specs, config, source);
    let report = report.unwrap();

    assert_eq!(sink.timestamps(), vec![0, 1000, 2000, 3000]);
    assert_eq!(report.frames_dropped, 0);
    assert_eq!(report.frames_duplicated, 0);
}

#[test]
fn constant_rate_with_doubling_drains_completely() {
    let specs = [
        StageSpec::named("decode").with_param("delay", 1),
        StageSpec::named("double_rate").with_param("frame_duration", 1000),
        StageSpec::named("encode").with_param("reorder", 2),
    ];
    let config = PipelineConfig {
        cfr: Some(CfrConfig::new(1000)),
        ..PipelineConfig::default()
    };
    let source = SyntheticConfig {
        timestamps: Some(vec![0, 1000, 1050, 3000]),
        ..packets(0)
    };
    let (report, sink) = run(&specs, config, source);
    let report = report.unwrap();

    assert_eq!(report.frames_read, 4);
    assert_eq!(report.frames_dropped, 1);
    assert_eq!(report.frames_duplicated, 1);
    assert_eq!(report.frames_entered, 4);
    assert_eq!(
        sink.timestamps(),
        vec![0, 500, 1000, 1500, 2000, 2500, 3000, 3500]
    );
}

#[test]
fn busy_encoder_is_retried() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode")
            .with_param("busy_every", 3)
            .with_param("busy_repeats", 2),
    ];
    let mut source = SyntheticSource::new(frames(9));
    let pipeline = build(&specs, &PipelineConfig::default(), &source);
    let metrics = pipeline.metrics();
    let mut sink = MemorySink::new();
    let report = pipeline.run(&mut source, &mut sink).unwrap();

    assert_eq!(report.busy_retries, 6);
    assert_eq!(metrics.snapshot().busy_retries, 6);
    assert_eq!(sink.len(), 9);
}

#[test]
fn endlessly_busy_stage_times_out() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode")
            .with_param("busy_every", 1)
            .with_param("busy_repeats", u32::MAX),
    ];
    let config = PipelineConfig {
        busy_timeout: Duration::from_millis(50),
        ..PipelineConfig::default()
    };
    let (report, sink) = run(&specs, config, frames(3));
    let err = report.unwrap_err();

    assert!(matches!(&err, PipelineError::BusyTimeout { stage, .. } if stage == "encode#1"));
    assert!(sink.is_empty());
}

#[test]
fn bitstream_grows_for_large_units() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode")
            .with_param("large_every", 4)
            .with_param("large_bytes", 1024),
    ];
    let (report, sink) = run(&specs, PipelineConfig::default(), frames(12));
    let report = report.unwrap();

    assert!((1..=3).contains(&report.buffer_growths));
    let sizes: Vec<usize> = sink.units().iter().map(|unit| unit.data.len()).collect();
    for (index, size) in sizes.iter().enumerate() {
        let expected = if index % 4 == 3 { 1024 } else { 64 };
        assert_eq!(*size, expected, "unit {index}");
    }
}

#[test]
fn bitstream_growth_past_limit_is_fatal() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode")
            .with_param("large_every", 4)
            .with_param("large_bytes", 1024),
    ];
    let config = PipelineConfig {
        max_bitstream_bytes: 512,
        ..PipelineConfig::default()
    };
    let (report, sink) = run(&specs, config, frames(12));

    assert!(matches!(
        report.unwrap_err(),
        PipelineError::BufferGrowth {
            required: 1024,
            limit: 512
        }
    ));
    assert_eq!(sink.sequences(), vec![0, 1, 2]);
}

#[test]
fn fatal_stage_error_keeps_completed_output() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode").with_param("fail_at_frame", 5),
    ];
    let (report, sink) = run(&specs, PipelineConfig::default(), frames(10));
    let err = report.unwrap_err();

    assert!(matches!(&err, PipelineError::StageFailed { stage, .. } if stage == "encode#1"));
    assert_eq!(sink.sequences(), vec![0, 1, 2, 3, 4]);
    assert_eq!(sink.drain_count(), 1);
}

#[test]
fn failed_completion_is_reported_and_skipped() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode").with_param("fail_unit_at", 3),
    ];
    let (report, sink) = run(&specs, PipelineConfig::default(), frames(10));

    assert!(matches!(
        report.unwrap_err(),
        PipelineError::StageFailed { .. }
    ));
    let sequences = sink.sequences();
    assert_eq!(&sequences[..3], &[0, 1, 2]);
    assert!(!sequences.contains(&3));
}

struct AbortAfter {
    inner: SyntheticSource,
    abort: Arc<AtomicBool>,
    after: u64,
    produced: u64,
}

impl FrameSource for AbortAfter {
    fn frame_info(&self) -> FrameInfo {
        self.inner.frame_info()
    }

    fn produces_packets(&self) -> bool {
        self.inner.produces_packets()
    }

    fn set_next_surface(&mut self, surface: SurfaceLease) {
        self.inner.set_next_surface(surface);
    }

    fn next_frame(&mut self) -> PipelineResult<SourceFrame> {
        let frame = self.inner.next_frame()?;
        self.produced += 1;
        if self.produced == self.after {
            self.abort.store(true, Ordering::Release);
        }
        Ok(frame)
    }
}

#[test]
fn abort_drains_what_was_read() {
    let specs = [
        StageSpec::named("filter"),
        StageSpec::named("encode").with_param("lookahead", 2),
    ];
    let inner = SyntheticSource::new(frames(50));
    let pipeline = build(&specs, &PipelineConfig::default(), &inner);
    let mut source = AbortAfter {
        inner,
        abort: pipeline.abort_handle(),
        after: 4,
        produced: 0,
    };
    let mut sink = MemorySink::new();
    let report = pipeline.run(&mut source, &mut sink).unwrap();

    assert!(report.aborted);
    assert_eq!(report.frames_read, 4);
    assert_eq!(sink.len(), 4);
}

#[test]
fn decoder_resolution_change_reaches_the_convert_stage() {
    let specs = [
        StageSpec::named("decode").with_param("delay", 1),
        StageSpec::named("filter"),
        StageSpec::named("resize")
            .with_param("width", 32)
            .with_param("height", 32),
        StageSpec::named("encode"),
    ];
    let source = SyntheticConfig {
        resolution_change: Some(ResolutionChange {
            at_frame: 6,
            width: 160,
            height: 120,
        }),
        ..packets(12)
    };
    let (report, sink) = run(&specs, PipelineConfig::default(), source);
    let report = report.unwrap();

    assert_eq!(report.tasks_delivered, 12);
    assert_eq!(sink.len(), 12);
}

type Seen = Arc<Mutex<Vec<(u64, u32, u32)>>>;

/// Passes frames through and records the crop each one arrives with.
struct CropRecorder {
    seen: Seen,
}

impl Stage for CropRecorder {
    fn name(&self) -> &'static str {
        "record"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn requirements(&self, depth: u16) -> StageRequirements {
        StageRequirements::new(depth, depth)
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus {
        let StageInput::Surface(input) = submission.input else {
            return StageStatus::NeedMoreInput;
        };
        let Some(work) = submission.work else {
            return StageStatus::Fatal("no output surface".into());
        };
        let info = input.info();
        let meta = input.meta();
        self.seen
            .lock()
            .unwrap()
            .push((meta.source_index, info.crop.width, info.crop.height));
        work.set_info(info);
        work.set_meta(meta);
        let payload = input.with_payload(|data| data.to_vec());
        work.write_payload(|buffer| *buffer = payload);
        StageStatus::Ready(StageOutput {
            surface: Some(work.clone()),
            sync: SyncPoint::ready(Completion::Frame { pts: meta.pts }),
        })
    }
}

fn recording_registry(seen: &Seen) -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    let seen = seen.clone();
    registry.register("record", move |_| {
        Ok(Box::new(CropRecorder { seen: seen.clone() }))
    });
    registry
}

#[test]
fn buffered_frames_keep_their_crop_across_a_resolution_change() {
    let seen = Seen::default();
    let registry = recording_registry(&seen);
    let specs = [
        StageSpec::named("decode").with_param("delay", 1),
        StageSpec::named("filter").with_param("delay", 1),
        StageSpec::named("record"),
        StageSpec::named("encode").with_param("lookahead", 1),
    ];
    let mut source = SyntheticSource::new(SyntheticConfig {
        resolution_change: Some(ResolutionChange {
            at_frame: 6,
            width: 160,
            height: 120,
        }),
        ..packets(12)
    });
    let pipeline =
        build_pipeline(&registry, &specs, &PipelineConfig::default(), source.frame_info())
            .unwrap();
    let mut sink = MemorySink::new();
    pipeline.run(&mut source, &mut sink).unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 12);
    for (index, width, height) in seen {
        let expected = if index < 6 { (64, 48) } else { (160, 120) };
        assert_eq!((width, height), expected, "frame {index} arrived with wrong crop");
    }
}

#[test]
fn crop_after_the_convert_stage_is_fixed() {
    let seen = Seen::default();
    let registry = recording_registry(&seen);
    let specs = [
        StageSpec::named("decode").with_param("delay", 1),
        StageSpec::named("filter").with_param("delay", 1),
        StageSpec::named("resize")
            .with_param("width", 32)
            .with_param("height", 24),
        StageSpec::named("record"),
        StageSpec::named("encode"),
    ];
    let mut source = SyntheticSource::new(SyntheticConfig {
        resolution_change: Some(ResolutionChange {
            at_frame: 4,
            width: 160,
            height: 120,
        }),
        ..packets(10)
    });
    let pipeline =
        build_pipeline(&registry, &specs, &PipelineConfig::default(), source.frame_info())
            .unwrap();
    let mut sink = MemorySink::new();
    pipeline.run(&mut source, &mut sink).unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 10);
    assert!(seen.iter().all(|&(_, width, height)| (width, height) == (32, 24)));
}

/// Alternates key and bidirectional frames with fixed QP offsets.
struct Alternating;

impl FrameAnalyzer for Alternating {
    fn analyze(&mut self, sample: &FrameSample) -> Result<FrameHints> {
        Ok(FrameHints {
            frame_type: if sample.sequence % 3 == 0 {
                FrameType::Idr
            } else {
                FrameType::B
            },
            qp_offsets: [2, -3],
        })
    }
}

struct Broken;

impl FrameAnalyzer for Broken {
    fn analyze(&mut self, sample: &FrameSample) -> Result<FrameHints> {
        if sample.sequence == 2 {
            bail!("cannot analyze frame");
        }
        Ok(FrameHints::default())
    }
}

#[test]
fn classifier_hints_reach_the_encoder() {
    let specs = [
        StageSpec::named("decode"),
        StageSpec::named("double_rate").with_param("frame_duration", 3000),
        StageSpec::named("encode"),
    ];
    let config = PipelineConfig {
        classify: true,
        ..PipelineConfig::default()
    };
    let mut source = SyntheticSource::new(packets(6));
    let pipeline = build(&specs, &config, &source).with_analyzer(Box::new(Alternating));
    let mut sink = MemorySink::new();
    let report = pipeline.run(&mut source, &mut sink).unwrap();

    assert_eq!(report.classified, 6);
    let units = sink.units();
    assert_eq!(units.len(), 12);
    for (index, unit) in units.iter().enumerate() {
        let frame = index / 2;
        let expected = if frame % 3 == 0 { b'K' } else { b'B' };
        assert_eq!(unit.data[0], expected, "unit {index}");
        let qp = unit.data[1] as i8;
        assert_eq!(qp, if index % 2 == 0 { 2 } else { -3 }, "unit {index}");
    }
}

#[test]
fn classifier_failure_stops_the_run() {
    let specs = [StageSpec::named("filter"), StageSpec::named("encode")];
    let config = PipelineConfig {
        classify: true,
        ..PipelineConfig::default()
    };
    let mut source = SyntheticSource::new(frames(10));
    let pipeline = build(&specs, &config, &source).with_analyzer(Box::new(Broken));
    let mut sink = MemorySink::new();
    let err = pipeline.run(&mut source, &mut sink).unwrap_err();

    assert!(matches!(err, PipelineError::ClassifierFailed(_)));
    assert!(sink.len() <= 2);
}

#[test]
fn decoder_without_packets_is_rejected() {
    let specs = [StageSpec::named("decode"), StageSpec::named("encode")];
    let (report, _) = run(&specs, PipelineConfig::default(), frames(3));
    assert!(matches!(
        report.unwrap_err(),
        PipelineError::InvalidConfig(_)
    ));
}

#[test]
fn speed_governor_limits_frame_rate() {
    let specs = [StageSpec::named("filter"), StageSpec::named("encode")];
    let config = PipelineConfig {
        max_fps: Some(200.0),
        ..PipelineConfig::default()
    };
    let (report, _) = run(&specs, config, frames(10));
    assert!(report.unwrap().duration_ms >= 40.0);
}

#[test]
fn file_sink_digests_the_stream() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("out").join("stream.bin");
    let specs = [StageSpec::named("filter"), StageSpec::named("encode")];
    let mut source = SyntheticSource::new(frames(8));
    let pipeline = build(&specs, &PipelineConfig::default(), &source);
    let mut sink = FileSink::create(&path).unwrap();
    let report = pipeline.run(&mut source, &mut sink).unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len() as u64, report.sink.bytes);
    assert_eq!(report.sink.units, 8);
    assert_eq!(report.sink.sha256.as_deref().map(str::len), Some(64));
    assert_eq!(sink.summary().sha256, report.sink.sha256);
}
