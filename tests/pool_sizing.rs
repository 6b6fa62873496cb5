use framepipe::error::PipelineError;
use framepipe::pipeline::{
    PipelineConfig, PipelineContext, Stage, StageKind, StageSpec, build_stages,
};
use framepipe::pts::CfrConfig;
use framepipe::sizing::{PlanInput, Producer, SizingOptions, StageRequirements, plan_pools};
use framepipe::stages::default_registry;

fn plan_input(name: &str, kind: StageKind, requirements: StageRequirements) -> PlanInput<'_> {
    PlanInput {
        name,
        kind,
        requirements,
    }
}

fn options(depth: u16) -> SizingOptions {
    SizingOptions {
        depth,
        cfr_window: None,
        max_pool_surfaces: None,
    }
}

#[test]
fn decoder_chain_sizes_each_boundary() {
    let stages = [
        plan_input("decode", StageKind::Decode, StageRequirements::new(0, 5)),
        plan_input("filter", StageKind::Filter, StageRequirements::new(4, 4)),
        plan_input("encode", StageKind::Encode, StageRequirements::new(4, 0)),
    ];
    let plan = plan_pools(&stages, &options(4)).unwrap();

    let sizes: Vec<_> = plan.boundaries.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![6, 5]);
    assert_eq!(plan.boundaries[0].name, "decode#0->filter#1");
    assert_eq!(plan.boundaries[0].producer, Producer::Stage(0));
    assert_eq!(plan.boundaries[1].consumer, 2);
    assert_eq!(plan.input_pool(), None);
    assert_eq!(plan.total_surfaces(), 11);
}

#[test]
fn resequencer_reserve_lands_on_first_boundary() {
    let stages = [
        plan_input("decode", StageKind::Decode, StageRequirements::new(0, 5)),
        plan_input("filter", StageKind::Filter, StageRequirements::new(4, 4)),
        plan_input("encode", StageKind::Encode, StageRequirements::new(4, 0)),
    ];
    let plan = plan_pools(
        &stages,
        &SizingOptions {
            cfr_window: Some(17),
            ..options(4)
        },
    )
    .unwrap();

    assert_eq!(plan.boundaries[0].reserve, 19);
    assert_eq!(plan.boundaries[0].size, 25);
    assert_eq!(plan.boundaries[1].reserve, 0);
    assert_eq!(plan.boundaries[1].size, 5);
}

#[test]
fn frame_multiplier_carries_downstream() {
    let stages = [
        plan_input(
            "double_rate",
            StageKind::Filter,
            StageRequirements::new(2, 3).with_multiplier(2),
        ),
        plan_input("encode", StageKind::Encode, StageRequirements::new(2, 0)),
    ];
    let plan = plan_pools(&stages, &options(2)).unwrap();

    assert_eq!(plan.boundaries[0].name, "source->double_rate#0");
    assert_eq!(plan.boundaries[0].producer, Producer::Source);
    assert_eq!(plan.boundaries[0].size, 2);
    assert_eq!(plan.boundaries[1].size, 5);
    assert_eq!(plan.input_pool(), Some(0));
    assert_eq!(plan.output_pool_of(0), Some(1));
    assert_eq!(plan.output_pool_of(1), None);
}

#[test]
fn decoder_with_too_few_outputs_is_rejected() {
    let stages = [
        plan_input("decode", StageKind::Decode, StageRequirements::new(0, 2)),
        plan_input("encode", StageKind::Encode, StageRequirements::new(4, 0)),
    ];
    let err = plan_pools(&stages, &options(4)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Allocation {
            required: 4,
            available: 2,
            ..
        }
    ));
}

#[test]
fn pool_above_limit_is_rejected() {
    let stages = [
        plan_input("filter", StageKind::Filter, StageRequirements::new(8, 8)),
        plan_input("encode", StageKind::Encode, StageRequirements::new(8, 0)),
    ];
    let err = plan_pools(
        &stages,
        &SizingOptions {
            max_pool_surfaces: Some(4),
            ..options(2)
        },
    )
    .unwrap_err();
    assert!(err.is_setup_error());
    assert!(matches!(err, PipelineError::Allocation { available: 4, .. }));
}

#[test]
fn builtin_stage_pools_grow_with_depth() {
    let specs = vec![
        StageSpec::named("decode").with_param("delay", 2),
        StageSpec::named("filter").with_param("delay", 1),
        StageSpec::named("resize")
            .with_param("width", 64)
            .with_param("height", 64),
        StageSpec::named("double_rate"),
        StageSpec::named("encode").with_param("lookahead", 3),
    ];
    let stages = build_stages(default_registry(), &specs).unwrap();

    let mut previous = 0;
    for depth in 1..=8u16 {
        let config = PipelineConfig {
            async_depth: Some(depth),
            cfr: Some(CfrConfig::new(3000)),
            ..PipelineConfig::default()
        };
        let ctx = PipelineContext::prepare(&stages, &config).unwrap();
        for boundary in &ctx.plan.boundaries {
            let consumer = stages[boundary.consumer].requirements(depth);
            let floor = (consumer.input_frames as usize + 1).saturating_sub(depth as usize - 1);
            assert!(
                boundary.size >= floor.max(1),
                "{} too small at depth {depth}",
                boundary.name
            );
        }
        let total = ctx.plan.total_surfaces();
        assert!(total >= previous, "total shrank at depth {depth}");
        previous = total;
    }
}

#[test]
fn lower_depth_never_shrinks_pools_for_fixed_requirements() {
    let stages = [
        plan_input("decode", StageKind::Decode, StageRequirements::new(0, 8)),
        plan_input("filter", StageKind::Filter, StageRequirements::new(6, 6)),
        plan_input("resize", StageKind::Convert, StageRequirements::new(3, 3)),
        plan_input(
            "double_rate",
            StageKind::Filter,
            StageRequirements::new(4, 5).with_multiplier(2),
        ),
        plan_input("encode", StageKind::Encode, StageRequirements::new(5, 0)),
    ];

    let mut previous: Option<Vec<usize>> = None;
    for depth in (1..=8u16).rev() {
        let plan = plan_pools(&stages, &options(depth)).unwrap();
        let sizes: Vec<_> = plan.boundaries.iter().map(|b| b.size).collect();

        for boundary in &plan.boundaries {
            let producer = match boundary.producer {
                Producer::Stage(idx) => stages[idx].requirements.output_frames as usize,
                Producer::Source => 1,
            };
            let consumer = stages[boundary.consumer].requirements.input_frames as usize;
            let floor = (producer + consumer + 1).saturating_sub(depth as usize).max(1);
            assert!(
                boundary.size >= floor,
                "{} holds {} < {floor} at depth {depth}",
                boundary.name,
                boundary.size
            );
        }
        if let Some(previous) = &previous {
            for (before, after) in previous.iter().zip(&sizes) {
                assert!(after >= before, "pool shrank at depth {depth}: {sizes:?}");
            }
        }
        previous = Some(sizes);
    }
}
