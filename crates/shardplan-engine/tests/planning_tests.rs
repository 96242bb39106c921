//! End-to-end planning of the reference model across mesh layouts

mod common;

use common::{init_test_env, local_values, tiny_config};
use shardplan_engine::model::llama::{build_llama, ModelOptions};
use shardplan_engine::parallel::{Collective, ParallelizePlan, PipelineConfig};
use shardplan_engine::{
    plan_rank, DeviceMesh, MeshContext, ParallelizeConfig, PlacementReport, PlanRule, Planner,
    SplitPoint, SplitSpec,
};
use shardplan_types::{Placement, ShardplanError};

const R: Placement = Placement::Replicate;

#[test]
fn test_gathered_q_proj_on_dp2_mp2() {
    init_test_env();
    let config = tiny_config(2, 1, 2);
    for rank in 0..4 {
        let (_, planned) = plan_rank(&config, rank).unwrap();
        for layer in 0..config.model.num_hidden_layers {
            let path = format!("llama.layers.{}.self_attn.q_proj", layer);
            let weight = planned.root.find_param(&format!("{}.weight", path)).unwrap();
            assert_eq!(weight.placements(), &[R, Placement::Shard(1)], "rank {}", rank);
            assert_eq!(weight.local_shape(), &[16, 8]);

            let activation = &planned.layers[&path];
            assert_eq!(activation.output, vec![Placement::Shard(0), R]);
        }
    }
}

#[test]
fn test_column_and_row_shard_dims() {
    init_test_env();
    let (_, planned) = plan_rank(&tiny_config(1, 1, 2), 1).unwrap();
    let placement = |path: &str| planned.root.find_param(path).unwrap().placements().to_vec();

    assert_eq!(placement("llama.layers.0.mlp.gate_proj.weight"), vec![R, Placement::Shard(1)]);
    assert_eq!(placement("llama.layers.0.mlp.down_proj.weight"), vec![R, Placement::Shard(0)]);
    assert_eq!(placement("llama.layers.0.self_attn.o_proj.weight"), vec![R, Placement::Shard(0)]);
    assert_eq!(placement("llama.norm.weight"), vec![R, R]);
}

#[test]
fn test_lora_factors_follow_base_split() {
    init_test_env();
    let mut config = tiny_config(1, 1, 2);
    config.enable_lora = true;
    let (_, planned) = plan_rank(&config, 0).unwrap();
    let param = |path: &str| planned.root.find_param(path).unwrap();

    let q = "model.llama.layers.0.self_attn.q_proj";
    assert!(!param(&format!("{}.weight", q)).trainable);
    assert!(!param(&format!("{}.bias", q)).trainable);
    assert!(param(&format!("{}.lora_A", q)).trainable);
    assert!(param(&format!("{}.lora_B", q)).trainable);
    // column-wise: the output side is split
    assert_eq!(param(&format!("{}.weight", q)).placements(), &[R, Placement::Shard(1)]);
    assert_eq!(param(&format!("{}.lora_B", q)).placements(), &[R, Placement::Shard(1)]);
    assert_eq!(param(&format!("{}.lora_A", q)).placements(), &[R, R]);

    // row-wise: the input side is split
    let down = "model.llama.layers.1.mlp.down_proj";
    assert_eq!(param(&format!("{}.weight", down)).placements(), &[R, Placement::Shard(0)]);
    assert_eq!(param(&format!("{}.lora_A", down)).placements(), &[R, Placement::Shard(0)]);
    assert_eq!(param(&format!("{}.lora_B", down)).placements(), &[R, R]);
    assert_eq!(param(&format!("{}.lora_A", down)).local_shape(), &[16, 8]);

    assert!(!param("model.lm_head.weight").trainable);
    // the preset declares a position embedding this model does not build
    assert_eq!(
        planned.unresolved,
        vec!["model.llama.position_embedding".to_string()]
    );
}

#[test]
fn test_planning_is_idempotent() {
    init_test_env();
    let mut config = tiny_config(2, 2, 2);
    config.parallel.sequence_parallel = true;
    for rank in [0, 5] {
        let (_, first) = plan_rank(&config, rank).unwrap();
        let (_, second) = plan_rank(&config, rank).unwrap();
        assert_eq!(
            PlacementReport::from_planned(&first, rank),
            PlacementReport::from_planned(&second, rank)
        );
        assert_eq!(local_values(&first), local_values(&second));
    }
}

#[test]
fn test_sub_mesh_round_trip() {
    let mesh = DeviceMesh::new([("dp", 2), ("pp", 2), ("mp", 2)], 8).unwrap();
    let stage = mesh.sub_mesh("pp", 1).unwrap();
    assert_eq!(stage.axis_names(), vec!["dp", "mp"]);
    assert_eq!(stage.ranks(), &[2, 3, 6, 7]);
    assert!(matches!(
        mesh.sub_mesh("tp", 0),
        Err(ShardplanError::UnknownAxis { .. })
    ));
    assert!(matches!(
        DeviceMesh::new([("dp", 3)], 4),
        Err(ShardplanError::InvalidTopology { .. })
    ));
}

#[test]
fn test_pipeline_stages_with_pinned_global_layer() {
    init_test_env();
    let mut config = tiny_config(1, 2, 1);
    config.model.num_hidden_layers = 4;
    let (_, first) = plan_rank(&config, 0).unwrap();
    let (_, last) = plan_rank(&config, 1).unwrap();

    assert_eq!(first.stage, 0);
    assert_eq!(last.stage, 1);
    assert_eq!(first.stage_of("llama.layers.1.mlp.down_proj"), Some(0));
    assert_eq!(first.stage_of("llama.layers.2.self_attn.q_proj"), Some(1));
    assert_eq!(first.stage_of("llama.global_layer"), Some(1));
    assert_eq!(first.split_points.len(), 1);
    assert_eq!(first.split_points[0].path, "llama.layers.1");

    let first_local = first.local_parameters();
    assert!(first_local.contains(&"llama.embed_tokens.weight".to_string()));
    assert!(!first_local.contains(&"lm_head.weight".to_string()));
    assert!(last.local_parameters().contains(&"lm_head.weight".to_string()));
}

#[test]
fn test_conflicting_split_names_the_leaf() {
    init_test_env();
    let config = tiny_config(1, 3, 1);
    let context = MeshContext::from_parallel_config(0, &config.parallel).unwrap();
    let model = build_llama(&config.model, ModelOptions::from_training(&config));
    let request = ParallelizeConfig {
        pp_config: Some(PipelineConfig {
            split_spec: SplitSpec::Points(vec![
                ("llama.layers.0".to_string(), SplitPoint::End),
                ("llama.layers.1".to_string(), SplitPoint::Beginning),
            ]),
            global_spec: None,
        }),
        ..Default::default()
    };
    let err = Planner::new(&context).apply(model, &request, config.seed).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("llama.layers.1.input_layernorm"));
}

#[test]
fn test_unresolved_rule_is_reported_not_fatal() {
    init_test_env();
    let config = tiny_config(1, 1, 2);
    let context = MeshContext::from_parallel_config(0, &config.parallel).unwrap();
    let model = build_llama(&config.model, ModelOptions::from_training(&config));
    let request = ParallelizeConfig {
        mp_config: Some(
            ParallelizePlan::new()
                .rule("llama.layers.*.self_attn.q_proj", PlanRule::col_wise())
                .rule("llama.layers.*.mlp.fused_proj", PlanRule::row_wise()),
        ),
        ..Default::default()
    };
    let planned = Planner::new(&context).apply(model, &request, config.seed).unwrap();
    assert_eq!(planned.unresolved, vec!["llama.layers.*.mlp.fused_proj".to_string()]);
    assert_eq!(
        planned
            .root
            .find_param("llama.layers.0.self_attn.q_proj.weight")
            .unwrap()
            .placements(),
        &[R, Placement::Shard(1)]
    );
}

#[test]
fn test_lazy_init_matches_eager_shards() {
    init_test_env();
    let mut eager = tiny_config(2, 1, 2);
    eager.parallel.sharding_stage = shardplan_types::ShardingStage::Stage3;
    eager.enable_lora = true;
    let mut lazy = eager.clone();
    lazy.use_lazy_init = true;

    for rank in 0..4 {
        let (_, a) = plan_rank(&eager, rank).unwrap();
        let (_, b) = plan_rank(&lazy, rank).unwrap();
        assert_eq!(local_values(&a), local_values(&b), "rank {}", rank);
    }
}

#[test]
fn test_shared_embedding_spans_stages() {
    init_test_env();
    let mut config = tiny_config(1, 2, 1);
    config.share_embedding = true;
    let (_, planned) = plan_rank(&config, 0).unwrap();
    assert_eq!(planned.shared_weights.len(), 1);
    let shared = &planned.shared_weights[0];
    assert_eq!(shared.source, "llama.embed_tokens.weight");
    assert_eq!(shared.tied, "lm_head.weight");
    assert_eq!((shared.source_stage, shared.tied_stage), (0, 1));
}

#[test]
fn test_shared_embedding_under_lora() {
    init_test_env();
    let mut config = tiny_config(1, 2, 2);
    config.enable_lora = true;
    config.share_embedding = true;
    for rank in 0..4 {
        let (_, planned) = plan_rank(&config, rank).unwrap();
        assert_eq!(planned.shared_weights.len(), 1);
        let shared = &planned.shared_weights[0];
        assert_eq!(shared.source, "model.llama.embed_tokens.weight");
        assert_eq!(shared.tied, "model.lm_head.weight");
        assert_eq!((shared.source_stage, shared.tied_stage), (0, 1));
    }
}

#[test]
fn test_sequence_parallel_layouts() {
    init_test_env();
    let mut config = tiny_config(1, 1, 2);
    config.parallel.sequence_parallel = true;
    let (_, planned) = plan_rank(&config, 0).unwrap();
    let layer = |path: &str| &planned.layers[path];
    let seq = vec![Placement::Shard(0), Placement::Shard(1)];

    // begin: sequence-sharded after the embedding
    let embed = layer("llama.embed_tokens");
    assert_eq!(embed.output, seq);
    assert_eq!(
        embed.collectives,
        vec![Collective::AllGather { dim: 2 }, Collective::Split { dim: 1 }]
    );

    let norm = layer("llama.layers.0.input_layernorm");
    assert!(norm.sequence_parallel);
    assert_eq!(norm.output, seq);
    assert!(norm.collectives.is_empty());

    // disable: gather the full sequence, scatter it again afterwards
    for block in ["self_attn", "mlp"] {
        let plan = layer(&format!("llama.layers.1.{}", block));
        assert!(!plan.sequence_parallel);
        assert_eq!(plan.input, vec![Placement::Shard(0), R]);
        assert_eq!(plan.output, seq);
        assert_eq!(
            plan.collectives,
            vec![Collective::AllGather { dim: 1 }, Collective::Split { dim: 1 }]
        );
    }
    assert!(layer("llama.layers.1.post_attention_layernorm").sequence_parallel);
    assert!(layer("llama.norm").sequence_parallel);

    // end: gathered before the head and off from then on
    let head = layer("lm_head");
    assert!(!head.sequence_parallel);
    assert_eq!(head.collectives, vec![Collective::AllGather { dim: 1 }]);
    assert_eq!(head.input, vec![Placement::Shard(0), R]);
}

#[test]
fn test_prepare_input_output_layouts() {
    init_test_env();
    let mut config = tiny_config(1, 1, 2);
    config.parallel.sequence_parallel = true;
    config.parallel.prepare_input_output = true;
    let (_, planned) = plan_rank(&config, 0).unwrap();
    let layer = |path: &str| &planned.layers[path];
    let seq = vec![Placement::Shard(0), Placement::Shard(1)];

    // only the norms run sequence-sharded
    assert!(!layer("llama.embed_tokens").sequence_parallel);
    for norm in ["input_layernorm", "post_attention_layernorm"] {
        let plan = layer(&format!("llama.layers.0.{}", norm));
        assert!(plan.sequence_parallel);
        assert_eq!(plan.output, seq);
        assert_eq!(plan.collectives, vec![Collective::Split { dim: 1 }]);
    }
    assert!(layer("llama.norm").sequence_parallel);

    let q = layer("llama.layers.0.self_attn.q_proj");
    assert!(!q.sequence_parallel);
    assert_eq!(q.input, vec![Placement::Shard(0), R]);
    assert_eq!(q.collectives, vec![Collective::AllGather { dim: 1 }]);

    let head = layer("lm_head");
    assert!(!head.sequence_parallel);
    assert_eq!(head.collectives, vec![Collective::AllGather { dim: 1 }]);
}
