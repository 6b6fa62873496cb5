//! Built-in synthetic stages.
//!
//! They honour the stage contract and the buffering they declare, but do no
//! real media work: payloads are small luma previews that are copied along.

mod decode;
mod encode;
mod filters;

use anyhow::{Result, anyhow, bail};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::pipeline::{StageParameters, StageRegistry};
use crate::surface::{FrameInfo, FrameMeta, PixelLayout, SurfaceLease};

pub use decode::DecodeStage;
pub use encode::{EncodeSettings, EncodeStage, UNIT_HEADER_BYTES};
pub use filters::{DoubleRateStage, FilterStage, ResizeStage};

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("decode", |params| {
        Ok(Box::new(DecodeStage::from_params(params)?))
    });
    registry.register("filter", |params| {
        Ok(Box::new(FilterStage::from_params(params)?))
    });
    registry.register("double_rate", |params| {
        Ok(Box::new(DoubleRateStage::from_params(params)?))
    });
    registry.register("resize", |params| {
        Ok(Box::new(ResizeStage::from_params(params)?))
    });
    registry.register("encode", |params| {
        Ok(Box::new(EncodeStage::from_params(params)?))
    });
}

static DEFAULT_REGISTRY: Lazy<StageRegistry> = Lazy::new(|| {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    registry
});

/// Registry holding every built-in stage.
pub fn default_registry() -> &'static StageRegistry {
    &DEFAULT_REGISTRY
}

/// Copies payload and metadata from `input` into `work` under new geometry.
fn copy_frame(input: &SurfaceLease, work: &SurfaceLease, info: FrameInfo) -> FrameMeta {
    let meta = input.meta();
    let payload = input.with_payload(|payload| payload.to_vec());
    work.set_info(info);
    work.set_meta(meta);
    work.write_payload(|buffer| *buffer = payload);
    meta
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn take_u64(params: &mut StageParameters, key: &str) -> Result<Option<u64>> {
    match params.remove(key) {
        None => Ok(None),
        Some(Value::Number(num)) => num
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer, got {num}")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be a non-negative integer, got '{s}'")),
        Some(other) => bail!("'{key}' must be a non-negative integer, got {other}"),
    }
}

fn take_u32(params: &mut StageParameters, key: &str) -> Result<Option<u32>> {
    take_u64(params, key)?
        .map(|value| u32::try_from(value).map_err(|_| anyhow!("'{key}' is out of range: {value}")))
        .transpose()
}

fn take_u16(params: &mut StageParameters, key: &str) -> Result<Option<u16>> {
    take_u64(params, key)?
        .map(|value| u16::try_from(value).map_err(|_| anyhow!("'{key}' is out of range: {value}")))
        .transpose()
}

fn take_i64(params: &mut StageParameters, key: &str) -> Result<Option<i64>> {
    match params.remove(key) {
        None => Ok(None),
        Some(Value::Number(num)) => num
            .as_i64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be an integer, got {num}")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("'{key}' must be an integer, got '{s}'")),
        Some(other) => bail!("'{key}' must be an integer, got {other}"),
    }
}

fn take_layout(params: &mut StageParameters) -> Result<Option<PixelLayout>> {
    take_string(params, "layout")
        .map(|label| {
            PixelLayout::from_label(&label).ok_or_else(|| anyhow!("Unknown pixel layout '{label}'"))
        })
        .transpose()
}

/// Fails on parameters no field consumed.
fn reject_unknown(params: StageParameters, stage: &str) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().cloned().collect();
    keys.sort();
    bail!("{stage} stage does not accept: {}", keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_parameters_accept_numbers_and_strings() {
        let mut params = StageParameters::new();
        params.insert("delay".into(), json!(2));
        params.insert("lookahead".into(), json!("3"));
        params.insert("offset".into(), json!(-5));
        assert_eq!(take_u32(&mut params, "delay").unwrap(), Some(2));
        assert_eq!(take_u16(&mut params, "lookahead").unwrap(), Some(3));
        assert_eq!(take_i64(&mut params, "offset").unwrap(), Some(-5));
        assert_eq!(take_u32(&mut params, "missing").unwrap(), None);
        assert!(params.is_empty());
    }

    #[test]
    fn leftover_parameters_are_rejected() {
        let mut params = StageParameters::new();
        params.insert("qualty".into(), json!(90));
        let err = reject_unknown(params, "encode").unwrap_err();
        assert!(err.to_string().contains("qualty"));
    }

    #[test]
    fn registry_lists_builtin_stages() {
        assert_eq!(
            default_registry().known_stages(),
            vec!["decode", "double_rate", "encode", "filter", "resize"]
        );
    }
}
