use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::classifier::FrameType;
use crate::driver::Pipeline;
use crate::error::{PipelineError, PipelineResult};
use crate::pts::CfrConfig;
use crate::retry::{BusyPolicy, Retryable};
use crate::scheduler::default_async_depth;
use crate::sizing::{PlanInput, PoolPlan, SizingOptions, StageRequirements, plan_pools};
use crate::source::Packet;
use crate::surface::{FrameInfo, SurfaceLease};
use crate::sync::SyncPoint;
use crate::trim::{TrimRange, TrimRanges};

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Decode,
    Filter,
    Convert,
    Encode,
}

/// What a stage is asked to consume.
#[derive(Debug, Clone, Copy)]
pub enum StageInput<'a> {
    Packet(&'a Packet),
    Surface(&'a SurfaceLease),
    /// End of stream: emit whatever is still buffered.
    Flush,
}

/// Per-frame encoder control derived from classifier hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub qp_offset: i8,
}

#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub input: StageInput<'a>,
    /// Free surface from the stage's output pool.
    pub work: Option<&'a SurfaceLease>,
    /// Capacity of the task bitstream the output will be copied into.
    pub bitstream_capacity: Option<usize>,
    pub control: Option<&'a FrameControl>,
}

impl<'a> Submission<'a> {
    pub fn new(input: StageInput<'a>) -> Self {
        Self {
            input,
            work: None,
            bitstream_capacity: None,
            control: None,
        }
    }
}

#[derive(Debug)]
pub struct StageOutput {
    pub surface: Option<SurfaceLease>,
    pub sync: SyncPoint,
}

#[derive(Debug)]
pub enum StageStatus {
    Ready(StageOutput),
    /// Input absorbed without output; during flush, the stage is exhausted.
    NeedMoreInput,
    /// Valid output, and more will follow for the same input.
    NeedMoreOutput(StageOutput),
    Busy,
    NotEnoughBuffer {
        required: usize,
    },
    Fatal(String),
}

impl Retryable for StageStatus {
    fn is_busy(&self) -> bool {
        matches!(self, StageStatus::Busy)
    }
}

pub trait Stage: Send {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StageKind;
    fn requirements(&self, depth: u16) -> StageRequirements;

    /// Geometry of the surfaces produced for an input of geometry `input`.
    fn output_info(&self, input: FrameInfo) -> FrameInfo {
        input
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default)]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn named(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            params: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(StageParameters::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// Run-wide settings as supplied by a recipe or a caller.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames allowed in flight; derived from the stage count when unset.
    pub async_depth: Option<u16>,
    pub cfr: Option<CfrConfig>,
    pub classify: bool,
    pub trim: Vec<TrimRange>,
    pub max_fps: Option<f64>,
    pub busy_timeout: Duration,
    pub sync_timeout: Duration,
    pub classifier_timeout: Duration,
    pub max_pool_surfaces: Option<usize>,
    /// Initial task bitstream size; 0 takes the encoder's suggestion.
    pub bitstream_buffer_bytes: usize,
    pub max_bitstream_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            async_depth: None,
            cfr: None,
            classify: false,
            trim: Vec::new(),
            max_fps: None,
            busy_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30),
            classifier_timeout: Duration::from_secs(30),
            max_pool_surfaces: None,
            bitstream_buffer_bytes: 0,
            max_bitstream_bytes: 64 << 20,
        }
    }
}

/// Everything the driver, pools and task pool are built from.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub depth: u16,
    pub plan: PoolPlan,
    pub busy: BusyPolicy,
    pub sync_timeout: Duration,
    pub classifier_timeout: Duration,
    pub trim: TrimRanges,
    pub cfr: Option<CfrConfig>,
    pub classify: bool,
    pub max_fps: Option<f64>,
    pub bitstream_bytes: usize,
    pub max_bitstream_bytes: usize,
}

const FALLBACK_BITSTREAM_BYTES: usize = 4096;

impl PipelineContext {
    pub fn prepare(stages: &[Box<dyn Stage>], config: &PipelineConfig) -> PipelineResult<Self> {
        let problems = check_stage_order(&stage_kinds(stages));
        if let Some(first) = problems.into_iter().next() {
            return Err(PipelineError::InvalidConfig(first));
        }
        let depth = config
            .async_depth
            .unwrap_or_else(|| default_async_depth(stages.len()));
        if depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "async depth must be at least 1".into(),
            ));
        }

        let requirements: Vec<StageRequirements> =
            stages.iter().map(|stage| stage.requirements(depth)).collect();
        let inputs: Vec<PlanInput<'_>> = stages
            .iter()
            .zip(&requirements)
            .map(|(stage, requirements)| PlanInput {
                name: stage.name(),
                kind: stage.kind(),
                requirements: *requirements,
            })
            .collect();
        let plan = plan_pools(
            &inputs,
            &SizingOptions {
                depth,
                cfr_window: config.cfr.as_ref().map(|cfr| cfr.window),
                max_pool_surfaces: config.max_pool_surfaces,
            },
        )?;

        let suggested = requirements
            .last()
            .map(|r| r.bitstream_bytes)
            .filter(|bytes| *bytes > 0)
            .unwrap_or(FALLBACK_BITSTREAM_BYTES);
        let bitstream_bytes = match config.bitstream_buffer_bytes {
            0 => suggested,
            bytes => bytes,
        };
        if bitstream_bytes > config.max_bitstream_bytes {
            return Err(PipelineError::BufferGrowth {
                required: bitstream_bytes,
                limit: config.max_bitstream_bytes,
            });
        }

        info!(
            depth,
            stages = stages.len(),
            surfaces = plan.total_surfaces(),
            bitstream_bytes,
            "Pipeline context prepared"
        );
        Ok(Self {
            depth,
            plan,
            busy: BusyPolicy::default().with_timeout(config.busy_timeout),
            sync_timeout: config.sync_timeout,
            classifier_timeout: config.classifier_timeout,
            trim: TrimRanges::new(config.trim.clone())?,
            cfr: config.cfr.clone(),
            classify: config.classify,
            max_fps: config.max_fps,
            bitstream_bytes,
            max_bitstream_bytes: config.max_bitstream_bytes,
        })
    }
}

pub fn stage_kinds(stages: &[Box<dyn Stage>]) -> Vec<StageKind> {
    stages.iter().map(|stage| stage.kind()).collect()
}

/// Ordering rules of a chain: an optional leading decoder, filters, at most
/// one convert stage, and exactly one encoder at the end.
pub fn check_stage_order(kinds: &[StageKind]) -> Vec<String> {
    let mut problems = Vec::new();
    if kinds.is_empty() {
        problems.push("Pipeline must contain at least one stage".to_string());
        return problems;
    }
    for (idx, kind) in kinds.iter().enumerate() {
        if *kind == StageKind::Decode && idx != 0 {
            problems.push(format!("Decode stage at position {} must be first", idx + 1));
        }
        if *kind == StageKind::Encode && idx + 1 != kinds.len() {
            problems.push(format!("Encode stage at position {} must be last", idx + 1));
        }
    }
    if kinds.last() != Some(&StageKind::Encode) {
        problems.push("Pipeline must end with an encode stage".to_string());
    }
    let converts = kinds.iter().filter(|k| **k == StageKind::Convert).count();
    if converts > 1 {
        problems.push(format!(
            "At most one convert stage is allowed, found {converts}"
        ));
    }
    problems
}

pub fn build_stages(registry: &StageRegistry, specs: &[StageSpec]) -> Result<Vec<Box<dyn Stage>>> {
    let mut stages = Vec::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        let params = spec.params.clone().unwrap_or_default();
        let stage = registry
            .create(&spec.stage, params)
            .with_context(|| format!("Stage {} ('{}')", idx + 1, spec.stage))?;
        debug!(stage = spec.stage.as_str(), kind = ?stage.kind(), "Stage constructed");
        stages.push(stage);
    }
    Ok(stages)
}

pub fn build_pipeline(
    registry: &StageRegistry,
    stage_specs: &[StageSpec],
    config: &PipelineConfig,
    input: FrameInfo,
) -> Result<Pipeline> {
    let stages = build_stages(registry, stage_specs)?;
    let ctx = PipelineContext::prepare(&stages, config)?;
    let pipeline = Pipeline::new(stages, ctx, input)?;
    Ok(pipeline)
}
