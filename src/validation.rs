use serde::Serialize;

use crate::pipeline::{StageRegistry, StageSpec, check_stage_order};
use crate::recipe::{Recipe, SourceKind};
use crate::trim::TrimRanges;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    report.merge(validate_stages(&recipe.pipeline, registry));
    report.merge(validate_settings(recipe));
    report.merge(validate_source(recipe));
    report
}

/// Builds every stage to check its parameters, then checks the order of the
/// stages that could be built.
fn validate_stages(pipeline: &[StageSpec], registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    if pipeline.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
        return report;
    }

    let mut kinds = Vec::with_capacity(pipeline.len());
    for (idx, spec) in pipeline.iter().enumerate() {
        let params = spec.params.clone().unwrap_or_default();
        match registry.create(&spec.stage, params) {
            Ok(stage) => kinds.push(stage.kind()),
            Err(err) => report.errors.push(format!(
                "Stage {} ('{}'): {:#}",
                idx + 1,
                spec.stage,
                err.context("Failed to instantiate stage")
            )),
        }
    }
    if kinds.len() == pipeline.len() {
        report.errors.extend(check_stage_order(&kinds));
    }
    report
}

fn validate_settings(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let settings = &recipe.settings;

    if settings.async_depth == Some(0) {
        report.errors.push("async_depth must be at least 1".into());
    }
    if let Err(err) = TrimRanges::new(settings.trim.clone()) {
        report.errors.push(err.to_string());
    }
    if let Some(cfr) = &settings.cfr {
        if cfr.frame_duration <= 0 {
            report.errors.push(format!(
                "cfr frame_duration must be positive, got {}",
                cfr.frame_duration
            ));
        }
        if cfr.window == 0 {
            report.errors.push("cfr window must be at least 1".into());
        }
        if !(cfr.tolerance > 0.0 && cfr.tolerance < 1.0) {
            report.warnings.push(format!(
                "cfr tolerance {} is outside (0, 1); every jittered frame will be corrected",
                cfr.tolerance
            ));
        }
    }
    if let Some(fps) = settings.max_fps
        && fps <= 0.0
    {
        report
            .errors
            .push(format!("max_fps must be positive, got {fps}"));
    }
    if settings.max_pool_surfaces == Some(0) {
        report
            .errors
            .push("max_pool_surfaces must be at least 1".into());
    }
    if let Some(limit) = settings.max_bitstream_bytes
        && settings.bitstream_buffer_bytes > limit
    {
        report.errors.push(format!(
            "bitstream_buffer_bytes {} exceeds max_bitstream_bytes {limit}",
            settings.bitstream_buffer_bytes
        ));
    }
    for (name, value) in [
        ("busy_timeout_ms", settings.busy_timeout_ms),
        ("sync_timeout_ms", settings.sync_timeout_ms),
        ("classifier_timeout_ms", settings.classifier_timeout_ms),
    ] {
        if value == Some(0) {
            report.errors.push(format!("{name} must be positive"));
        }
    }
    report
}

fn validate_source(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let source = &recipe.source;

    let has_decoder = recipe
        .pipeline
        .first()
        .is_some_and(|spec| spec.stage == "decode");
    match source.kind {
        SourceKind::Synthetic => {
            if source.packets != has_decoder {
                report.errors.push(if has_decoder {
                    "decode stage needs a synthetic source with 'packets: true'".into()
                } else {
                    "packet source ('packets: true') needs a leading decode stage".into()
                });
            }
            if source.frames == Some(0) && source.timestamps.is_none() {
                report
                    .warnings
                    .push("source produces no frames; the run only drains".into());
            }
            if source.resolution_change.is_some() && !has_decoder {
                report.warnings.push(
                    "resolution changes are reported by a decoder; raw frames change size silently"
                        .into(),
                );
            }
        }
        SourceKind::RawFile => {
            if source.path.is_none() {
                report.errors.push("raw_file source requires 'path'".into());
            }
            if source.width.is_none() || source.height.is_none() {
                report
                    .errors
                    .push("raw_file source requires 'width' and 'height'".into());
            }
            if has_decoder {
                report
                    .errors
                    .push("raw_file source cannot feed a decode stage".into());
            }
        }
    }
    if source.width == Some(0) || source.height == Some(0) {
        report
            .errors
            .push("source width and height must be non-zero".into());
    }
    if source.frame_duration.is_some_and(|duration| duration <= 0) {
        report
            .errors
            .push("source frame_duration must be positive".into());
    }
    report
}
