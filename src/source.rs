//! Frame providers feeding the head of the chain.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::surface::{FrameInfo, FrameMeta, PixelLayout, SurfaceLease};

/// Bytes of luma preview carried by synthetic frames.
const PREVIEW_BYTES: usize = 4096;

/// A compressed unit for a decoder. Synthetic packets carry their own
/// geometry so a decoder can report resolution changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub index: u64,
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum SourceFrame {
    Packet(Packet),
    Surface(SurfaceLease),
    EndOfStream,
}

pub trait FrameSource: Send {
    /// Nominal geometry of the frames this source produces.
    fn frame_info(&self) -> FrameInfo;

    /// True when frames come out as packets that need a decoder.
    fn produces_packets(&self) -> bool;

    /// Hands over the free surface the next raw frame is written into.
    fn set_next_surface(&mut self, surface: SurfaceLease);

    fn next_frame(&mut self) -> PipelineResult<SourceFrame>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResolutionChange {
    pub at_frame: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub frame_duration: i64,
    /// Explicit timestamps. When set, the stream ends with the list.
    pub timestamps: Option<Vec<i64>>,
    /// Offsets added to the regular timestamps, cycled per frame.
    pub jitter: Vec<i64>,
    pub resolution_change: Option<ResolutionChange>,
    pub packets: bool,
    /// Frames per synthetic scene; the luma level jumps between scenes.
    pub scene_length: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            frames: 30,
            width: 320,
            height: 240,
            layout: PixelLayout::Nv12,
            frame_duration: 3000,
            timestamps: None,
            jitter: Vec::new(),
            resolution_change: None,
            packets: false,
            scene_length: 24,
        }
    }
}

/// Deterministic generator of frames or packets.
pub struct SyntheticSource {
    config: SyntheticConfig,
    next_index: u64,
    next_surface: Option<SurfaceLease>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            next_index: 0,
            next_surface: None,
        }
    }

    pub fn frame_count(&self) -> u64 {
        match &self.config.timestamps {
            Some(list) => list.len() as u64,
            None => self.config.frames,
        }
    }

    fn pts_of(&self, index: u64) -> i64 {
        if let Some(list) = &self.config.timestamps {
            return list[index as usize];
        }
        let base = index as i64 * self.config.frame_duration;
        if self.config.jitter.is_empty() {
            base
        } else {
            base + self.config.jitter[(index as usize) % self.config.jitter.len()]
        }
    }

    fn geometry_of(&self, index: u64) -> (u32, u32) {
        match &self.config.resolution_change {
            Some(change) if index >= change.at_frame => (change.width, change.height),
            _ => (self.config.width, self.config.height),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn frame_info(&self) -> FrameInfo {
        FrameInfo::new(self.config.width, self.config.height, self.config.layout)
    }

    fn produces_packets(&self) -> bool {
        self.config.packets
    }

    fn set_next_surface(&mut self, surface: SurfaceLease) {
        self.next_surface = Some(surface);
    }

    fn next_frame(&mut self) -> PipelineResult<SourceFrame> {
        let index = self.next_index;
        if index >= self.frame_count() {
            return Ok(SourceFrame::EndOfStream);
        }
        self.next_index += 1;

        let pts = self.pts_of(index);
        let (width, height) = self.geometry_of(index);
        let preview = luma_preview(index, self.config.scene_length, width, height);

        if self.config.packets {
            return Ok(SourceFrame::Packet(Packet {
                index,
                pts,
                width,
                height,
                data: preview,
            }));
        }

        let surface = self.next_surface.take().ok_or_else(|| {
            PipelineError::Source(format!("no surface provided for raw frame {index}"))
        })?;
        surface.set_info(FrameInfo::new(width, height, self.config.layout));
        surface.set_meta(FrameMeta {
            pts,
            source_index: index,
            ..FrameMeta::default()
        });
        surface.write_payload(|payload| {
            payload.clear();
            payload.extend_from_slice(&preview);
        });
        Ok(SourceFrame::Surface(surface))
    }
}

/// Luma plane preview for synthetic frame `index`: a scene-dependent level
/// plus a diagonal gradient.
pub fn luma_preview(index: u64, scene_length: u64, width: u32, height: u32) -> Vec<u8> {
    let len = (width as usize * height as usize).clamp(1, PREVIEW_BYTES);
    let scene = index / scene_length.max(1);
    let level = (scene.wrapping_mul(97) % 200) as usize;
    let row = (width as usize).clamp(1, 64);
    (0..len)
        .map(|i| (level + (i % row + i / row) % 48) as u8)
        .collect()
}

/// Fixed-size raw frames read back to back from a file.
pub struct RawFileSource {
    path: PathBuf,
    reader: BufReader<File>,
    info: FrameInfo,
    frame_duration: i64,
    frame_bytes: usize,
    next_index: u64,
    next_surface: Option<SurfaceLease>,
}

impl RawFileSource {
    pub fn open(
        path: &Path,
        width: u32,
        height: u32,
        layout: PixelLayout,
        frame_duration: i64,
    ) -> PipelineResult<Self> {
        let file = File::open(path).map_err(|err| {
            PipelineError::Source(format!("failed to open {}: {err}", path.display()))
        })?;
        let frame_bytes = layout.frame_bytes(width, height);
        if frame_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "raw frames must have a non-zero size".into(),
            ));
        }
        info!(path = %path.display(), width, height, ?layout, frame_bytes, "Opened raw source");
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            info: FrameInfo::new(width, height, layout),
            frame_duration,
            frame_bytes,
            next_index: 0,
            next_surface: None,
        })
    }
}

impl FrameSource for RawFileSource {
    fn frame_info(&self) -> FrameInfo {
        self.info
    }

    fn produces_packets(&self) -> bool {
        false
    }

    fn set_next_surface(&mut self, surface: SurfaceLease) {
        self.next_surface = Some(surface);
    }

    fn next_frame(&mut self) -> PipelineResult<SourceFrame> {
        let mut frame = vec![0u8; self.frame_bytes];
        let mut filled = 0;
        while filled < frame.len() {
            match self.reader.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(PipelineError::Source(format!(
                        "failed to read {}: {err}",
                        self.path.display()
                    )));
                }
            }
        }
        if filled == 0 {
            debug!(frames = self.next_index, "Raw source exhausted");
            return Ok(SourceFrame::EndOfStream);
        }
        if filled < frame.len() {
            return Err(PipelineError::Source(format!(
                "truncated frame {} in {}: {filled} of {} bytes",
                self.next_index,
                self.path.display(),
                self.frame_bytes
            )));
        }

        let index = self.next_index;
        self.next_index += 1;
        let surface = self.next_surface.take().ok_or_else(|| {
            PipelineError::Source(format!("no surface provided for raw frame {index}"))
        })?;
        surface.set_info(self.info);
        surface.set_meta(FrameMeta {
            pts: index as i64 * self.frame_duration,
            source_index: index,
            ..FrameMeta::default()
        });
        surface.write_payload(|payload| *payload = frame);
        Ok(SourceFrame::Surface(surface))
    }
}
