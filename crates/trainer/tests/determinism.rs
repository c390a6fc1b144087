use std::path::PathBuf;

use tinylm_core::ModelType;
use trainer::{Corpus, DeviceSelector, ExperimentConfig, Sweep, SweepGrid};

fn run_sweep(work_dir: PathBuf, num_workers: usize) -> (usize, f64, String) {
    let mut config = ExperimentConfig::profile(ModelType::Feedforward);
    config.run.system.work_dir = work_dir;
    config.run.trainer.device = DeviceSelector::Cpu;
    config.run.trainer.num_workers = num_workers;
    config.run.trainer.max_iters = 15;
    config.run.trainer.batch_size = 16;
    config.run.trainer.validation_interval = 5;
    config.report.sample_interval = 0;
    config.grid = SweepGrid {
        learning_rates: vec![1e-2, 2e-3],
        hidden_dims: vec![24],
        n_embds: vec![4, 8],
    };

    let text = "to be, or not to be, that is the question. ".repeat(6);
    let corpus = Corpus::from_text(&text, 0.7, config.data.block_size).unwrap();
    let outcome = Sweep::new(config, corpus).unwrap().run().unwrap();
    let best = outcome.best;
    (best.run_idx, best.val_loss, best.hyperparameters.to_string())
}

// Kept alone in this binary: libtorch's generator is process-wide.
#[test]
fn fixed_seed_gives_identical_sweeps_for_any_worker_count() {
    let dir = std::env::temp_dir().join(format!("tinylm-determinism-{}", std::process::id()));
    let first = run_sweep(dir.join("a"), 0);
    let second = run_sweep(dir.join("b"), 3);

    assert_eq!(first.0, second.0);
    assert_eq!(first.1.to_bits(), second.1.to_bits());
    assert_eq!(first.2, second.2);

    std::fs::remove_dir_all(dir).unwrap();
}
