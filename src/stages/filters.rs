use std::collections::VecDeque;

use anyhow::{Result, anyhow, bail};

use super::{copy_frame, reject_unknown, take_i64, take_layout, take_u32};
use crate::pipeline::{
    Stage, StageInput, StageKind, StageOutput, StageParameters, StageStatus, Submission,
};
use crate::sizing::StageRequirements;
use crate::surface::{FrameInfo, PixelLayout, SurfaceLease};
use crate::sync::{Completion, SyncPoint};

const DEFAULT_INTERVAL: i64 = 3000;

fn ready(surface: SurfaceLease, more: bool) -> StageStatus {
    let pts = surface.meta().pts;
    let output = StageOutput {
        surface: Some(surface),
        sync: SyncPoint::ready(Completion::Frame { pts }),
    };
    if more {
        StageStatus::NeedMoreOutput(output)
    } else {
        StageStatus::Ready(output)
    }
}

/// Pass-through filter with an optional internal delay line.
pub struct FilterStage {
    delay: u32,
    queue: VecDeque<SurfaceLease>,
}

impl FilterStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let delay = take_u32(&mut params, "delay")?.unwrap_or(0);
        reject_unknown(params, "filter")?;
        Ok(Self {
            delay,
            queue: VecDeque::new(),
        })
    }
}

impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn requirements(&self, depth: u16) -> StageRequirements {
        let frames = depth.saturating_add(u16::try_from(self.delay).unwrap_or(u16::MAX));
        StageRequirements::new(frames, frames)
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus {
        match submission.input {
            StageInput::Surface(input) => {
                let Some(work) = submission.work else {
                    return StageStatus::Fatal("filter called without an output surface".into());
                };
                copy_frame(input, work, input.info());
                self.queue.push_back(work.clone());
                if self.queue.len() > self.delay as usize {
                    match self.queue.pop_front() {
                        Some(surface) => ready(surface, false),
                        None => StageStatus::NeedMoreInput,
                    }
                } else {
                    StageStatus::NeedMoreInput
                }
            }
            StageInput::Flush => match self.queue.pop_front() {
                Some(surface) => ready(surface, false),
                None => StageStatus::NeedMoreInput,
            },
            StageInput::Packet(_) => StageStatus::Fatal("filter expects surfaces".into()),
        }
    }
}

/// Emits every input twice: the frame itself, then a companion frame half
/// an interval later.
pub struct DoubleRateStage {
    frame_duration: Option<i64>,
    last_pts: Option<i64>,
    companion_offset: Option<i64>,
}

impl DoubleRateStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let frame_duration = take_i64(&mut params, "frame_duration")?;
        if frame_duration.is_some_and(|duration| duration <= 0) {
            bail!("double_rate 'frame_duration' must be positive");
        }
        reject_unknown(params, "double_rate")?;
        Ok(Self {
            frame_duration,
            last_pts: None,
            companion_offset: None,
        })
    }

    fn interval(&self, pts: i64) -> i64 {
        self.frame_duration
            .or_else(|| self.last_pts.map(|last| pts - last))
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_INTERVAL)
    }
}

impl Stage for DoubleRateStage {
    fn name(&self) -> &'static str {
        "double_rate"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn requirements(&self, depth: u16) -> StageRequirements {
        StageRequirements::new(depth, depth.saturating_add(1)).with_multiplier(2)
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus {
        let input = match submission.input {
            StageInput::Surface(input) => input,
            // Nothing is buffered between calls.
            StageInput::Flush => return StageStatus::NeedMoreInput,
            StageInput::Packet(_) => {
                return StageStatus::Fatal("double_rate expects surfaces".into());
            }
        };
        let Some(work) = submission.work else {
            return StageStatus::Fatal("double_rate called without an output surface".into());
        };
        let meta = copy_frame(input, work, input.info());
        match self.companion_offset.take() {
            None => {
                self.companion_offset = Some(self.interval(meta.pts) / 2);
                self.last_pts = Some(meta.pts);
                ready(work.clone(), true)
            }
            Some(offset) => {
                work.update_meta(|meta| {
                    meta.pts += offset;
                    meta.companion = true;
                });
                ready(work.clone(), false)
            }
        }
    }
}

/// The convert stage: rescales to a fixed output geometry.
pub struct ResizeStage {
    width: u32,
    height: u32,
    layout: Option<PixelLayout>,
}

impl ResizeStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let width = take_u32(&mut params, "width")?
            .ok_or_else(|| anyhow!("resize stage requires 'width' parameter"))?;
        let height = take_u32(&mut params, "height")?
            .ok_or_else(|| anyhow!("resize stage requires 'height' parameter"))?;
        if width == 0 || height == 0 {
            bail!("resize dimensions must be non-zero, got {width}x{height}");
        }
        let layout = take_layout(&mut params)?;
        reject_unknown(params, "resize")?;
        Ok(Self {
            width,
            height,
            layout,
        })
    }
}

impl Stage for ResizeStage {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn kind(&self) -> StageKind {
        StageKind::Convert
    }

    fn requirements(&self, depth: u16) -> StageRequirements {
        StageRequirements::new(depth, depth)
    }

    fn output_info(&self, input: FrameInfo) -> FrameInfo {
        FrameInfo::new(self.width, self.height, self.layout.unwrap_or(input.layout))
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus {
        match submission.input {
            StageInput::Surface(input) => {
                let Some(work) = submission.work else {
                    return StageStatus::Fatal("resize called without an output surface".into());
                };
                copy_frame(input, work, self.output_info(input.info()));
                ready(work.clone(), false)
            }
            StageInput::Flush => StageStatus::NeedMoreInput,
            StageInput::Packet(_) => StageStatus::Fatal("resize expects surfaces".into()),
        }
    }
}
