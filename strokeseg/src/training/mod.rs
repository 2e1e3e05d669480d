//! Training: configuration, the epoch loop, checkpoints and history.

pub mod checkpoint;
pub mod config;
pub mod history;
pub mod orchestrator;
pub mod scheduler;

pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use config::TrainingConfig;
pub use history::{EpochRecord, TrainingHistory};
pub use orchestrator::{
    train, train_on_samples, BestCheckpoint, CheckpointDecision, CheckpointPolicy,
    NonFiniteGuard, Orchestrator, StepDecision, TerminationReason, TrainingState,
    TrainingSummary,
};
pub use scheduler::{PlateauScheduler, PlateauSchedulerConfig};
