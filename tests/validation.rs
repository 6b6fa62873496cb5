use framepipe::recipe::Recipe;
use framepipe::stages::default_registry;
use framepipe::validation::validate_recipe;

fn validate(yaml: &str) -> framepipe::validation::ValidationReport {
    let recipe = Recipe::parse(yaml).unwrap();
    validate_recipe(&recipe, default_registry())
}

#[test]
fn complete_recipe_is_valid() {
    let report = validate(
        r#"
version: 1
source:
  frames: 24
  packets: true
pipeline:
  - stage: decode
    params: { delay: 2 }
  - stage: filter
  - stage: resize
    params: { width: 64, height: 32 }
  - stage: encode
    params: { lookahead: 2 }
settings:
  cfr: { frame_duration: 3000 }
  classify: true
  trim: [{ start: 0, end: 9 }, { start: 12, end: 20 }]
"#,
    );
    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
}

#[test]
fn missing_stage_parameters_are_reported() {
    let report = validate(
        r#"
version: 1
source: { frames: 4 }
pipeline:
  - stage: resize
  - stage: encode
"#,
    );
    assert!(!report.is_ok());
    assert!(report.errors.iter().any(|e| e.contains("width")));
}

#[test]
fn unknown_stage_and_parameter_are_reported() {
    let report = validate(
        r#"
version: 1
source: { frames: 4 }
pipeline:
  - stage: sharpen
  - stage: encode
    params: { qualty: 3 }
"#,
    );
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors[0].contains("Unknown stage 'sharpen'"));
    assert!(report.errors[1].contains("qualty"));
}

#[test]
fn misordered_stages_are_reported() {
    let report = validate(
        r#"
version: 1
source: { frames: 4 }
pipeline:
  - stage: filter
  - stage: encode
  - stage: resize
    params: { width: 8, height: 8 }
  - stage: resize
    params: { width: 4, height: 4 }
"#,
    );
    let errors = report.errors.join("\n");
    assert!(errors.contains("must be last"));
    assert!(errors.contains("must end with an encode stage"));
    assert!(errors.contains("At most one convert stage"));
}

#[test]
fn decode_must_come_first_and_needs_packets() {
    let report = validate(
        r#"
version: 1
source: { frames: 4 }
pipeline:
  - stage: filter
  - stage: decode
  - stage: encode
"#,
    );
    let errors = report.errors.join("\n");
    assert!(errors.contains("Decode stage at position 2 must be first"));

    let report = validate(
        r#"
version: 1
source: { frames: 4 }
pipeline:
  - stage: decode
  - stage: encode
"#,
    );
    assert!(report.errors.iter().any(|e| e.contains("packets: true")));
}

#[test]
fn invalid_settings_are_reported() {
    let report = validate(
        r#"
version: 2
source: { frames: 4 }
pipeline:
  - stage: encode
settings:
  async_depth: 0
  cfr: { frame_duration: 0 }
  trim: [{ start: 0, end: 10 }, { start: 5, end: 20 }]
"#,
    );
    let errors = report.errors.join("\n");
    assert!(errors.contains("Unsupported recipe version: 2"));
    assert!(errors.contains("async_depth must be at least 1"));
    assert!(errors.contains("frame_duration must be positive"));
    assert!(errors.contains("overlap"));
}

#[test]
fn raw_file_source_needs_path_and_geometry() {
    let report = validate(
        r#"
version: 1
source: { kind: raw_file }
pipeline:
  - stage: encode
"#,
    );
    let errors = report.errors.join("\n");
    assert!(errors.contains("requires 'path'"));
    assert!(errors.contains("requires 'width' and 'height'"));
}
