use std::collections::VecDeque;

use anyhow::Result;

use super::{reject_unknown, take_layout, take_u16, take_u32};
use crate::pipeline::{
    Stage, StageInput, StageKind, StageOutput, StageParameters, StageStatus, Submission,
};
use crate::sizing::StageRequirements;
use crate::surface::{FrameInfo, FrameMeta, PixelLayout, SurfaceLease};
use crate::sync::{Completion, SyncPoint};

/// Turns synthetic packets into surfaces, holding `delay` frames back the
/// way a reordering decoder would.
pub struct DecodeStage {
    delay: u32,
    output_frames: Option<u16>,
    layout: PixelLayout,
    queue: VecDeque<SurfaceLease>,
}

impl DecodeStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let delay = take_u32(&mut params, "delay")?.unwrap_or(0);
        let output_frames = take_u16(&mut params, "output_frames")?;
        let layout = take_layout(&mut params)?.unwrap_or_default();
        reject_unknown(params, "decode")?;
        Ok(Self {
            delay,
            output_frames,
            layout,
            queue: VecDeque::new(),
        })
    }

    fn emit(&mut self) -> StageStatus {
        match self.queue.pop_front() {
            Some(surface) => {
                let pts = surface.meta().pts;
                StageStatus::Ready(StageOutput {
                    surface: Some(surface),
                    sync: SyncPoint::ready(Completion::Frame { pts }),
                })
            }
            None => StageStatus::NeedMoreInput,
        }
    }
}

impl Stage for DecodeStage {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn kind(&self) -> StageKind {
        StageKind::Decode
    }

    fn requirements(&self, depth: u16) -> StageRequirements {
        let delay = u16::try_from(self.delay).unwrap_or(u16::MAX);
        let output = self
            .output_frames
            .unwrap_or_else(|| depth.saturating_add(delay).saturating_add(1));
        StageRequirements::new(0, output)
    }

    fn output_info(&self, input: FrameInfo) -> FrameInfo {
        FrameInfo {
            layout: self.layout,
            ..input
        }
    }

    fn submit(&mut self, submission: Submission<'_>) -> StageStatus {
        match submission.input {
            StageInput::Packet(packet) => {
                let Some(work) = submission.work else {
                    return StageStatus::Fatal("decode called without an output surface".into());
                };
                work.set_info(FrameInfo::new(packet.width, packet.height, self.layout));
                work.set_meta(FrameMeta {
                    pts: packet.pts,
                    source_index: packet.index,
                    ..FrameMeta::default()
                });
                work.write_payload(|payload| {
                    payload.clear();
                    payload.extend_from_slice(&packet.data);
                });
                self.queue.push_back(work.clone());
                if self.queue.len() > self.delay as usize {
                    self.emit()
                } else {
                    StageStatus::NeedMoreInput
                }
            }
            StageInput::Flush => self.emit(),
            StageInput::Surface(_) => StageStatus::Fatal("decode expects packets".into()),
        }
    }
}
