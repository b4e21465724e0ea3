use std::path::Path;

use pol::{parameter_distance, prove, spoof, Metric, ProofDir, ProveConfig, SpoofConfig};

fn recorded(dir: &Path) -> ProveConfig {
    let config = ProveConfig {
        model_dir: dir.join("proof"),
        batch_size: 8,
        lr: 0.05,
        epochs: 1,
        save_freq: 40,
        samples: Some(80),
        seed: 5,
        ..ProveConfig::default()
    };
    prove(&config).unwrap();
    config
}

fn attack(dir: &Path, proof: &ProveConfig) -> SpoofConfig {
    SpoofConfig {
        proof_dir: proof.model_dir.clone(),
        start_step: 0,
        iter: 80,
        dataset: proof.dataset,
        architecture: proof.architecture,
        output_root: dir.join("spoof"),
        t: 2,
        k: 2,
        batch_size: 4,
        cut: 2,
        retry: 2,
        gd: 1e9,
        nd: 1e9,
        init_threshold: 1e-6,
        ..SpoofConfig::default()
    }
}

#[test]
fn forged_trajectory_lands_on_the_genuine_end() {
    let dir = tempfile::tempdir().unwrap();
    let proof_config = recorded(dir.path());
    let config = attack(dir.path(), &proof_config);

    let outcome = spoof(&config).unwrap();
    assert!(outcome.init_valid());
    assert_eq!(outcome.total_steps, 2);
    assert_eq!(outcome.valid_count, 2);
    assert_eq!(outcome.degraded_cuts, 0);

    let forged = ProofDir::open(config.output_dir()).unwrap();
    for step in [0, 2, 4] {
        assert!(forged.checkpoint_path(step).exists(), "model_step_{step}");
    }
    let genuine_end = ProofDir::open(&proof_config.model_dir).unwrap().load_checkpoint(80).unwrap();
    let last = forged.load_checkpoint(4).unwrap();
    let d = parameter_distance(&last.net, &genuine_end.net, &[Metric::Linf]).unwrap();
    assert!(d.get(Metric::Linf).unwrap() < 1e-5);

    // two steps, two cuts each, four samples per cut
    let log = std::fs::read_to_string(config.output_dir().join("dataset.txt")).unwrap();
    assert_eq!(log.lines().count(), 16);
    assert!(config.output_dir().join("dataset").join("15.png").exists());
}

#[test]
fn without_overwrite_no_forged_checkpoints_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let proof_config = recorded(dir.path());
    let config = SpoofConfig { verify: false, ..attack(dir.path(), &proof_config) };

    let outcome = spoof(&config).unwrap();
    assert_eq!(outcome.valid_count, 0);
    assert!(outcome.overwrite_stats.is_empty());
    assert!(outcome.steps.iter().all(|s| s.checkpoint.is_none()));
    assert!(!config.output_dir().join("model_step_2").exists());
}

#[test]
fn missing_end_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let proof_config = recorded(dir.path());
    let config = SpoofConfig { iter: 200, ..attack(dir.path(), &proof_config) };
    assert!(matches!(spoof(&config), Err(pol::PolError::MissingResource { kind: "checkpoint", .. })));
}
