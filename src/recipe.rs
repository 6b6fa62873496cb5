use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::pipeline::{PipelineConfig, StageSpec};
use crate::pts::CfrConfig;
use crate::source::{FrameSource, RawFileSource, ResolutionChange, SyntheticConfig, SyntheticSource};
use crate::surface::PixelLayout;
use crate::trim::TrimRange;

#[derive(Debug, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub source: SourceSpec,
    pub pipeline: Vec<StageSpec>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub output: Option<OutputSpec>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let recipe: Recipe = serde_yaml::from_str(content)?;
        Ok(recipe)
    }

    pub fn to_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        let settings = &self.settings;
        PipelineConfig {
            async_depth: settings.async_depth,
            cfr: settings.cfr.clone(),
            classify: settings.classify,
            trim: settings.trim.clone(),
            max_fps: settings.max_fps,
            busy_timeout: settings
                .busy_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_timeout),
            sync_timeout: settings
                .sync_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_timeout),
            classifier_timeout: settings
                .classifier_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.classifier_timeout),
            max_pool_surfaces: settings.max_pool_surfaces,
            bitstream_buffer_bytes: settings.bitstream_buffer_bytes,
            max_bitstream_bytes: settings
                .max_bitstream_bytes
                .unwrap_or(defaults.max_bitstream_bytes),
        }
    }

    /// Opens the configured source. Relative raw file paths resolve against
    /// `base`, normally the recipe's directory.
    pub fn open_source(&self, base: &Path) -> Result<Box<dyn FrameSource>> {
        let source = &self.source;
        match source.kind {
            SourceKind::Synthetic => {
                let defaults = SyntheticConfig::default();
                Ok(Box::new(SyntheticSource::new(SyntheticConfig {
                    frames: source.frames.unwrap_or(defaults.frames),
                    width: source.width.unwrap_or(defaults.width),
                    height: source.height.unwrap_or(defaults.height),
                    layout: source.layout.unwrap_or(defaults.layout),
                    frame_duration: source.frame_duration.unwrap_or(defaults.frame_duration),
                    timestamps: source.timestamps.clone(),
                    jitter: source.jitter.clone(),
                    resolution_change: source.resolution_change.clone(),
                    packets: source.packets,
                    scene_length: source.scene_length.unwrap_or(defaults.scene_length),
                })))
            }
            SourceKind::RawFile => {
                let Some(path) = &source.path else {
                    bail!("raw_file source requires 'path'");
                };
                let (Some(width), Some(height)) = (source.width, source.height) else {
                    bail!("raw_file source requires 'width' and 'height'");
                };
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    base.join(path)
                };
                let raw = RawFileSource::open(
                    &path,
                    width,
                    height,
                    source.layout.unwrap_or_default(),
                    source
                        .frame_duration
                        .unwrap_or(SyntheticConfig::default().frame_duration),
                )
                .with_context(|| format!("Failed to open raw source: {}", path.display()))?;
                Ok(Box::new(raw))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Synthetic,
    RawFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceSpec {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub frames: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub layout: Option<PixelLayout>,
    #[serde(default)]
    pub frame_duration: Option<i64>,
    #[serde(default)]
    pub packets: bool,
    #[serde(default)]
    pub timestamps: Option<Vec<i64>>,
    #[serde(default)]
    pub jitter: Vec<i64>,
    #[serde(default)]
    pub resolution_change: Option<ResolutionChange>,
    #[serde(default)]
    pub scene_length: Option<u64>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub async_depth: Option<u16>,
    #[serde(default)]
    pub cfr: Option<CfrConfig>,
    #[serde(default)]
    pub classify: bool,
    #[serde(default)]
    pub trim: Vec<TrimRange>,
    #[serde(default)]
    pub max_fps: Option<f64>,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
    #[serde(default)]
    pub sync_timeout_ms: Option<u64>,
    #[serde(default)]
    pub classifier_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_pool_surfaces: Option<usize>,
    #[serde(default)]
    pub bitstream_buffer_bytes: usize,
    #[serde(default)]
    pub max_bitstream_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSpec {
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_pipeline_defaults() {
        let recipe = Recipe::parse(
            "version: 1\nsource: { frames: 4 }\npipeline:\n  - stage: encode\nsettings:\n  busy_timeout_ms: 250\n",
        )
        .unwrap();
        let config = recipe.to_config();
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.sync_timeout, PipelineConfig::default().sync_timeout);
        assert_eq!(recipe.source.kind, SourceKind::Synthetic);
        assert!(recipe.output.is_none());
    }
}
