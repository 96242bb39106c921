use shardplan_types::*;
use std::io::Write;

#[test]
fn training_config_default_sane() {
    let cfg = TrainingConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.model.hidden_size, 512);
    assert_eq!(cfg.lora.r, 8);
    assert_eq!(cfg.amp.init_loss_scaling, 1024.0);
    assert_eq!(cfg.optimizer.grad_clip_norm, Some(1.0));
}

#[test]
fn lora_config_targets_projections() {
    let cfg = LoraConfig::default();
    assert!(cfg.target_modules.iter().any(|t| t == ".*q_proj.*"));
    assert!(cfg.target_modules.iter().any(|t| t == ".*down_proj.*"));
    assert!((cfg.scaling() - 1.0).abs() < 1e-6);
}

#[test]
fn config_loads_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
acc_step = 4
seed = 7

[parallel]
dp = 2
mp = 2
sharding_stage = "Stage1"

[amp]
enable = true
dtype = "Bfloat16"
"#
    )
    .unwrap();

    let cfg = TrainingConfig::from_file(file.path()).unwrap();
    assert_eq!(cfg.acc_step, 4);
    assert_eq!(cfg.seed, 7);
    assert_eq!(cfg.parallel.dp, 2);
    assert_eq!(cfg.parallel.pp, 1);
    assert_eq!(cfg.parallel.sharding_stage, ShardingStage::Stage1);
    assert_eq!(cfg.amp.dtype, AmpDtype::Bfloat16);
    assert!(!cfg.amp.uses_loss_scaler());
}

#[test]
fn config_file_rejects_zero_degree() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[parallel]\nmp = 0").unwrap();
    assert!(TrainingConfig::from_file(file.path()).is_err());
}

#[test]
fn missing_config_file_is_config_error() {
    match TrainingConfig::from_file("/nonexistent/shardplan.toml") {
        Err(ShardplanError::Config { .. }) => {}
        other => panic!("unexpected: {:?}", other),
    }
}
