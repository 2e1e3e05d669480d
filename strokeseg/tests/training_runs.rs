mod common;

use common::{synthetic_samples, tiny_training, TestAutodiffBackend, TRAINING_LOCK};
use strokeseg::{
    training::{train_on_samples, TerminationReason, TrainingHistory},
    StrokeSegError,
};

#[test]
fn same_seed_gives_identical_loss_trajectory() {
    let _guard = TRAINING_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();

    let first = train_on_samples::<TestAutodiffBackend>(
        tiny_training(first_dir.path()),
        synthetic_samples(4),
        synthetic_samples(2),
        Default::default(),
    )
    .unwrap();
    let second = train_on_samples::<TestAutodiffBackend>(
        tiny_training(second_dir.path()),
        synthetic_samples(4),
        synthetic_samples(2),
        Default::default(),
    )
    .unwrap();

    let trajectory = first.history.loss_trajectory();
    assert_eq!(trajectory.len(), 2);
    assert!(trajectory.iter().all(|loss| loss.is_finite()));
    assert_eq!(trajectory, second.history.loss_trajectory());
    assert_eq!(first.termination, TerminationReason::EpochsExhausted);
}

#[test]
fn first_epoch_writes_checkpoint_and_history() {
    let _guard = TRAINING_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();

    let summary = train_on_samples::<TestAutodiffBackend>(
        tiny_training(dir.path()),
        synthetic_samples(4),
        synthetic_samples(2),
        Default::default(),
    )
    .unwrap();

    let best = summary.best.expect("first validation always improves");
    assert_eq!(best.epoch, 1);
    assert!(best.dir.join("checkpoint.json").is_file());
    assert!(dir.path().join("config.json").is_file());

    let history = TrainingHistory::load(&dir.path().join("history.json")).unwrap();
    assert_eq!(history.epochs.len(), 1);
    assert!(history.epochs[0].improved);
}

#[test]
fn exploding_updates_abort_with_numeric_divergence() {
    let _guard = TRAINING_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_training(dir.path())
        .with_learning_rate(1e30)
        .with_batch_size(1)
        .with_num_epochs(3)
        .with_max_consecutive_nonfinite(2);

    let result = train_on_samples::<TestAutodiffBackend>(
        config,
        synthetic_samples(8),
        synthetic_samples(2),
        Default::default(),
    );

    match result {
        Err(StrokeSegError::NumericDivergence { consecutive, .. }) => {
            assert_eq!(consecutive, 2);
        }
        other => panic!("Expected NumericDivergence, got {:?}", other.map(|s| s.epochs_run)),
    }
    assert!(!dir.path().join("history.json").exists());
}
