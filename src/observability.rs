use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub busy_retries: u64,
    pub buffer_growths: u64,
    pub surface_waits: u64,
    pub tasks_delivered: u64,
    pub frames_trimmed: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Counters a run can bump without holding a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    BusyRetries,
    BufferGrowths,
    SurfaceWaits,
    TasksDelivered,
    FramesTrimmed,
    FramesDropped,
    FramesDuplicated,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        if amount == 0 {
            return;
        }
        if let Ok(mut guard) = self.inner.lock() {
            let slot = match counter {
                Counter::BusyRetries => &mut guard.busy_retries,
                Counter::BufferGrowths => &mut guard.buffer_growths,
                Counter::SurfaceWaits => &mut guard.surface_waits,
                Counter::TasksDelivered => &mut guard.tasks_delivered,
                Counter::FramesTrimmed => &mut guard.frames_trimmed,
                Counter::FramesDropped => &mut guard.frames_dropped,
                Counter::FramesDuplicated => &mut guard.frames_duplicated,
            };
            *slot += amount;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage call recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        tasks_delivered = snapshot.tasks_delivered,
        busy_retries = snapshot.busy_retries,
        buffer_growths = snapshot.buffer_growths,
        frames_trimmed = snapshot.frames_trimmed,
        frames_dropped = snapshot.frames_dropped,
        frames_duplicated = snapshot.frames_duplicated,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

fn push_counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP framepipe_{name} {help}\n"));
    output.push_str(&format!("# TYPE framepipe_{name} counter\n"));
    output.push_str(&format!("framepipe_{name} {value}\n"));
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        push_counter(
            &mut output,
            "tasks_delivered_total",
            "Output units delivered to the sink",
            self.tasks_delivered,
        );
        push_counter(
            &mut output,
            "busy_retries_total",
            "Stage calls repeated because the stage was busy",
            self.busy_retries,
        );
        push_counter(
            &mut output,
            "buffer_growths_total",
            "Bitstream buffers grown on request of the encoder",
            self.buffer_growths,
        );
        push_counter(
            &mut output,
            "surface_waits_total",
            "Surface acquisitions that had to wait for a free slot",
            self.surface_waits,
        );
        push_counter(
            &mut output,
            "frames_trimmed_total",
            "Input frames skipped by trim ranges",
            self.frames_trimmed,
        );
        push_counter(
            &mut output,
            "frames_dropped_total",
            "Frames dropped by the constant frame rate resequencer",
            self.frames_dropped,
        );
        push_counter(
            &mut output,
            "frames_duplicated_total",
            "Frames duplicated by the constant frame rate resequencer",
            self.frames_duplicated,
        );
        output.push_str("# HELP framepipe_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE framepipe_stage_calls_total counter\n");
        output.push_str(
            "# HELP framepipe_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE framepipe_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP framepipe_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE framepipe_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "framepipe_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "framepipe_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "framepipe_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP framepipe_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE framepipe_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "framepipe_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
