//! Surface pool sizing.
//!
//! Every boundary between two stages gets one pool. It has to absorb the
//! producer's queued outputs and the consumer's held inputs at the same
//! time, minus the frames that are merely in flight because of the async
//! depth rather than genuinely duplicated.

use serde::Serialize;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::StageKind;
use crate::surface::SurfacePool;

/// Buffer needs a stage declares for a given async depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageRequirements {
    /// Input surfaces the stage may hold at once.
    pub input_frames: u16,
    /// Output surfaces the stage may have queued at once.
    pub output_frames: u16,
    /// Outputs produced per input (2 for rate doubling).
    pub frame_multiplier: u16,
    /// Suggested bitstream buffer size for encoders.
    pub bitstream_bytes: usize,
}

impl StageRequirements {
    pub fn new(input_frames: u16, output_frames: u16) -> Self {
        Self {
            input_frames,
            output_frames,
            frame_multiplier: 1,
            bitstream_bytes: 0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: u16) -> Self {
        self.frame_multiplier = multiplier.max(1);
        self
    }

    pub fn with_bitstream_bytes(mut self, bytes: usize) -> Self {
        self.bitstream_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub name: &'a str,
    pub kind: StageKind,
    pub requirements: StageRequirements,
}

#[derive(Debug, Clone, Default)]
pub struct SizingOptions {
    pub depth: u16,
    /// Sort window of the PTS resequencer, when constant frame rate is on.
    pub cfr_window: Option<usize>,
    pub max_pool_surfaces: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    Source,
    Stage(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolBoundary {
    pub name: String,
    pub producer: Producer,
    pub consumer: usize,
    pub size: usize,
    pub reserve: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolPlan {
    pub depth: u16,
    pub boundaries: Vec<PoolBoundary>,
}

impl PoolPlan {
    /// Boundary fed by raw source frames, present when the chain has no decoder.
    pub fn input_pool(&self) -> Option<usize> {
        self.boundaries
            .iter()
            .position(|b| b.producer == Producer::Source)
    }

    pub fn output_pool_of(&self, stage: usize) -> Option<usize> {
        self.boundaries
            .iter()
            .position(|b| b.producer == Producer::Stage(stage))
    }

    pub fn total_surfaces(&self) -> usize {
        self.boundaries.iter().map(|b| b.size).sum()
    }

    /// Checks allocated pools against the plan, boundary by boundary.
    pub fn verify(&self, pools: &[SurfacePool]) -> PipelineResult<()> {
        if pools.len() != self.boundaries.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "{} pool(s) allocated for {} boundaries",
                pools.len(),
                self.boundaries.len()
            )));
        }
        for (boundary, pool) in self.boundaries.iter().zip(pools) {
            if pool.capacity() < boundary.size {
                return Err(PipelineError::Allocation {
                    pool: boundary.name.clone(),
                    required: boundary.size,
                    available: pool.capacity(),
                });
            }
        }
        Ok(())
    }
}

pub fn plan_pools(stages: &[PlanInput<'_>], options: &SizingOptions) -> PipelineResult<PoolPlan> {
    if options.depth == 0 {
        return Err(PipelineError::InvalidConfig(
            "async depth must be at least 1".into(),
        ));
    }
    let Some(first) = stages.first() else {
        return Err(PipelineError::InvalidConfig(
            "pipeline has no stages".into(),
        ));
    };
    let depth = options.depth as usize;
    let in_flight = depth - 1;

    let (mut producer, mut producer_out, mut producer_name, start) =
        if first.kind == StageKind::Decode {
            let declared = first.requirements.output_frames as usize;
            if declared < depth {
                return Err(PipelineError::Allocation {
                    pool: format!("{} output", first.name),
                    required: depth,
                    available: declared,
                });
            }
            (Producer::Stage(0), declared, endpoint(first.name, 0), 1)
        } else {
            (Producer::Source, 1, "source".to_string(), 0)
        };
    let mut carry = multiplied_carry(0, first, start == 1);

    let mut boundaries = Vec::with_capacity(stages.len());
    for (index, consumer) in stages.iter().enumerate().skip(start) {
        let reserve = match (boundaries.is_empty(), options.cfr_window) {
            (true, Some(window)) => window + depth / 2,
            _ => 0,
        };
        let suggested =
            carry + producer_out + consumer.requirements.input_frames as usize + reserve;
        let size = suggested.saturating_sub(in_flight).max(1);
        let name = format!("{}->{}", producer_name, endpoint(consumer.name, index));
        if let Some(limit) = options.max_pool_surfaces
            && size > limit
        {
            return Err(PipelineError::Allocation {
                pool: name,
                required: size,
                available: limit,
            });
        }
        debug!(pool = name.as_str(), size, carry, reserve, "Planned surface pool");
        boundaries.push(PoolBoundary {
            name,
            producer,
            consumer: index,
            size,
            reserve,
        });

        carry = multiplied_carry(carry, consumer, true);
        producer = Producer::Stage(index);
        producer_out = consumer.requirements.output_frames as usize;
        producer_name = endpoint(consumer.name, index);
    }

    Ok(PoolPlan {
        depth: options.depth,
        boundaries,
    })
}

fn multiplied_carry(carry: usize, stage: &PlanInput<'_>, applies: bool) -> usize {
    if !applies {
        return carry;
    }
    let multiplier = stage.requirements.frame_multiplier.max(1) as usize;
    carry * multiplier + (multiplier - 1)
}

fn endpoint(name: &str, index: usize) -> String {
    format!("{name}#{index}")
}
