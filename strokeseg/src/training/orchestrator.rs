//! The training loop.
//!
//! ```text
//! Init -> TrainEpoch -> ValidateEpoch -> CheckpointDecision -+-> TrainEpoch
//!                                                            +-> Terminated
//! ```
//!
//! Validation always runs on `model.valid()`, a snapshot on the inner backend,
//! so the optimiser's live module is never observed mid-update. The best
//! checkpoint is tracked here and nowhere else.

use std::{fs, path::PathBuf, sync::atomic::Ordering, sync::Arc};

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{activation::sigmoid, backend::AutodiffBackend, cast::ToElement},
};

use super::{
    checkpoint::Checkpoint,
    config::TrainingConfig,
    history::{EpochRecord, TrainingHistory},
    scheduler::PlateauScheduler,
};
use crate::{
    config::MonitoredMetric,
    data::{
        scan_dataset, split_samples, Augmentor, Sample, StrokeBatch, StrokeBatcher,
        StrokeDataset, TransformMode,
    },
    error::{StrokeSegError, StrokeSegResult},
    export::{self, ArtifactStore, ExportConfig},
    losses::CompositeLoss,
    metrics::{batch_metrics, MetricsAccumulator, SegmentationMetrics},
    models::StrokeUNet,
};

/// Where the orchestrator currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Init,
    TrainEpoch { epoch: usize },
    ValidateEpoch { epoch: usize },
    CheckpointDecision { epoch: usize },
    Terminated(TerminationReason),
}

/// Why training stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// All configured epochs ran.
    EpochsExhausted,
    /// `patience` consecutive validations failed to improve.
    EarlyStopped { epochs_without_improvement: usize },
}

/// Whether a batch's update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Apply,
    Skip,
}

/// Counts consecutive non-finite training losses.
#[derive(Debug, Clone)]
pub struct NonFiniteGuard {
    limit: usize,
    consecutive: usize,
}

impl NonFiniteGuard {
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::NumericDivergence)` once `limit`
    /// consecutive losses were non-finite.
    pub fn observe(&mut self, loss: f64, epoch: usize, batch: usize) -> StrokeSegResult<StepDecision> {
        if loss.is_finite() {
            self.consecutive = 0;
            return Ok(StepDecision::Apply);
        }

        self.consecutive += 1;
        tracing::warn!(
            epoch,
            batch,
            loss,
            consecutive = self.consecutive,
            limit = self.limit,
            "non-finite loss, skipping update"
        );

        if self.consecutive >= self.limit {
            return Err(StrokeSegError::NumericDivergence {
                epoch,
                batch,
                consecutive: self.consecutive,
            });
        }
        Ok(StepDecision::Skip)
    }
}

/// Outcome of comparing a validation value against the best so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckpointDecision {
    Improved { previous: Option<f64> },
    NotImproved { epochs_without_improvement: usize },
    Stop { epochs_without_improvement: usize },
}

/// Best-so-far tracking and early stopping.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    metric: MonitoredMetric,
    patience: usize,
    best: Option<(usize, f64)>,
    epochs_without_improvement: usize,
}

impl CheckpointPolicy {
    pub const fn new(metric: MonitoredMetric, patience: usize) -> Self {
        Self {
            metric,
            patience,
            best: None,
            epochs_without_improvement: 0,
        }
    }

    /// `(epoch, value)` of the best validation so far.
    pub const fn best(&self) -> Option<(usize, f64)> {
        self.best
    }

    /// The first finite value is always an improvement; afterwards only a
    /// strict improvement is. Non-finite values never improve.
    pub fn decide(&mut self, epoch: usize, value: f64) -> CheckpointDecision {
        let previous = self.best.map(|(_, v)| v);
        let improved = value.is_finite()
            && previous.is_none_or(|best| self.metric.improves(value, best));

        if improved {
            self.best = Some((epoch, value));
            self.epochs_without_improvement = 0;
            return CheckpointDecision::Improved { previous };
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            CheckpointDecision::Stop {
                epochs_without_improvement: self.epochs_without_improvement,
            }
        } else {
            CheckpointDecision::NotImproved {
                epochs_without_improvement: self.epochs_without_improvement,
            }
        }
    }
}

/// The best checkpoint written by a run.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    pub epoch: usize,
    pub value: f64,
    pub dir: PathBuf,
    pub content_hash: String,
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub termination: TerminationReason,
    pub monitored_metric: MonitoredMetric,
    pub best: Option<BestCheckpoint>,
    pub history: TrainingHistory,
    /// Graph exported from the best checkpoint, if requested.
    pub graph: Option<PathBuf>,
}

/// Scans `config.dataset_root`, splits it and trains.
///
/// # Errors
///
/// Returns configuration, dataset and I/O errors, and
/// `Err(StrokeSegError::NumericDivergence)` if training diverges.
pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
) -> StrokeSegResult<TrainingSummary> {
    config.validate()?;
    let Some(root) = config.dataset_root.clone() else {
        return Err(StrokeSegError::InvalidConfiguration {
            reason: "dataset_root is required to train from disk".to_owned(),
        });
    };

    let samples = scan_dataset(&root)?;
    let (train_samples, valid_samples) =
        split_samples(samples, config.test_size, config.random_state)?;
    tracing::info!(
        train = train_samples.len(),
        valid = valid_samples.len(),
        random_state = config.random_state,
        "dataset split"
    );

    train_on_samples::<B>(config, train_samples, valid_samples, device)
}

/// Trains on explicit train and validation samples.
///
/// # Errors
///
/// See [`train`].
pub fn train_on_samples<B: AutodiffBackend>(
    config: TrainingConfig,
    train_samples: Vec<Sample>,
    valid_samples: Vec<Sample>,
    device: B::Device,
) -> StrokeSegResult<TrainingSummary> {
    config.validate()?;

    let train_augmentor = Augmentor::new(
        &config.model,
        config.preprocess.clone(),
        config.augmentation.clone(),
    );
    let valid_augmentor = Augmentor::for_eval(&config.model, config.preprocess.clone());

    let train_dataset =
        StrokeDataset::new(train_samples, train_augmentor, TransformMode::Train, config.seed);
    let valid_dataset =
        StrokeDataset::new(valid_samples, valid_augmentor, TransformMode::Eval, config.seed);

    if train_dataset.is_empty() || valid_dataset.is_empty() {
        return Err(StrokeSegError::InvalidConfiguration {
            reason: format!(
                "need at least one usable training and validation sample, got {} and {}",
                train_dataset.len(),
                valid_dataset.len()
            ),
        });
    }

    Orchestrator::<B>::new(config, device).run(train_dataset, valid_dataset)
}

/// Drives one training run through its states.
pub struct Orchestrator<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    state: TrainingState,
    loss: CompositeLoss<B>,
    valid_loss: CompositeLoss<B::InnerBackend>,
    policy: CheckpointPolicy,
    scheduler: PlateauScheduler,
    guard: NonFiniteGuard,
    history: TrainingHistory,
    best: Option<BestCheckpoint>,
}

/// Values carried from validation into the checkpoint decision.
#[derive(Default)]
struct ValidationOutcome {
    loss: f64,
    metrics: SegmentationMetrics,
}

/// Values carried from the training epoch into its history record.
#[derive(Default)]
struct TrainOutcome {
    batch_losses: Vec<f32>,
    loss: f64,
    metrics: SegmentationMetrics,
    skipped: usize,
}

impl<B: AutodiffBackend> Orchestrator<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        let loss = config.loss.init();
        let valid_loss = config.loss.init();
        let policy = CheckpointPolicy::new(config.monitored_metric, config.patience);
        let scheduler = config
            .scheduler
            .init(config.learning_rate, config.monitored_metric);
        let guard = NonFiniteGuard::new(config.max_consecutive_nonfinite);

        Self {
            config,
            device,
            state: TrainingState::Init,
            loss,
            valid_loss,
            policy,
            scheduler,
            guard,
            history: TrainingHistory::default(),
            best: None,
        }
    }

    pub const fn state(&self) -> TrainingState {
        self.state
    }

    /// Runs to termination.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::NumericDivergence)` on divergence, in which
    /// case no checkpoint is written for the diverged epoch, and I/O or record
    /// errors from persisting results.
    pub fn run(
        mut self,
        train_dataset: StrokeDataset,
        valid_dataset: StrokeDataset,
    ) -> StrokeSegResult<TrainingSummary> {
        let output_dir = self.config.output_dir.clone();
        fs::create_dir_all(&output_dir).map_err(|e| StrokeSegError::io(&output_dir, e))?;
        self.config.save(output_dir.join("config.json"))?;

        B::seed(self.config.seed);
        let mut model: StrokeUNet<B> = self.config.model.init(&self.device)?;
        let mut optim = AdamConfig::new().init::<B, StrokeUNet<B>>();

        let epoch_handle = train_dataset.epoch_handle();
        let train_loader: Arc<dyn DataLoader<B, StrokeBatch<B>>> =
            DataLoaderBuilder::new(StrokeBatcher::<B>::new())
                .batch_size(self.config.batch_size)
                .shuffle(self.config.seed)
                .num_workers(self.config.num_workers)
                .build(train_dataset);
        let valid_loader: Arc<
            dyn DataLoader<B::InnerBackend, StrokeBatch<B::InnerBackend>>,
        > = DataLoaderBuilder::new(StrokeBatcher::<B::InnerBackend>::new())
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers)
            .build(valid_dataset);

        let mut train_outcome = None;
        let mut valid_outcome = None;

        let termination = loop {
            let state = self.state;
            self.state = match state {
                TrainingState::Init => {
                    tracing::info!(
                        epochs = self.config.num_epochs,
                        batch_size = self.config.batch_size,
                        learning_rate = self.config.learning_rate,
                        monitored = %self.config.monitored_metric,
                        "starting training"
                    );
                    TrainingState::TrainEpoch { epoch: 1 }
                }
                TrainingState::TrainEpoch { epoch } => {
                    epoch_handle.store(epoch, Ordering::Relaxed);
                    let (updated, outcome) =
                        self.train_epoch(model, &mut optim, train_loader.as_ref(), epoch)?;
                    model = updated;
                    train_outcome = Some(outcome);
                    TrainingState::ValidateEpoch { epoch }
                }
                TrainingState::ValidateEpoch { epoch } => {
                    let snapshot = model.valid();
                    valid_outcome = Some(self.validate_epoch(&snapshot, valid_loader.as_ref()));
                    TrainingState::CheckpointDecision { epoch }
                }
                TrainingState::CheckpointDecision { epoch } => {
                    let train = train_outcome.take().unwrap_or_default();
                    let valid = valid_outcome.take().unwrap_or_default();
                    self.decide(&model, epoch, train, valid)?
                }
                TrainingState::Terminated(reason) => break reason,
            };
        };

        self.history.save(&output_dir.join("history.json"))?;

        let graph = match (&self.best, self.config.export_graph_on_finish) {
            (Some(best), true) => Some(self.export_best(best)?),
            _ => None,
        };

        let summary = TrainingSummary {
            epochs_run: self.history.epochs.len(),
            termination,
            monitored_metric: self.config.monitored_metric,
            best: self.best,
            history: self.history,
            graph,
        };
        tracing::info!(
            epochs = summary.epochs_run,
            termination = ?summary.termination,
            best_epoch = summary.best.as_ref().map(|b| b.epoch),
            best_value = summary.best.as_ref().map(|b| b.value),
            "training finished"
        );
        Ok(summary)
    }

    fn train_epoch<O: Optimizer<StrokeUNet<B>, B>>(
        &mut self,
        mut model: StrokeUNet<B>,
        optim: &mut O,
        loader: &dyn DataLoader<B, StrokeBatch<B>>,
        epoch: usize,
    ) -> StrokeSegResult<(StrokeUNet<B>, TrainOutcome)> {
        let lr = self.scheduler.lr();
        let mut metrics = MetricsAccumulator::new();
        let mut batch_losses = Vec::new();
        let mut skipped = 0;

        for (batch_index, batch) in loader.iter().enumerate() {
            let batch_size = batch.len();
            let logits = model.forward(batch.images);
            let loss = self.loss.forward(logits.clone(), batch.masks.clone());
            let loss_value = loss.clone().into_scalar().to_f64();

            match self.guard.observe(loss_value, epoch, batch_index)? {
                StepDecision::Skip => {
                    skipped += 1;
                    continue;
                }
                StepDecision::Apply => {}
            }

            let probabilities = sigmoid(logits.detach());
            metrics.extend(&batch_metrics(
                probabilities,
                batch.masks,
                self.config.threshold,
            ));
            metrics.update_loss(loss_value, batch_size);
            batch_losses.push(loss_value as f32);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            tracing::debug!(epoch, batch = batch_index, loss = loss_value, "train step");
        }

        let outcome = TrainOutcome {
            batch_losses,
            loss: metrics.loss(),
            metrics: metrics.value(),
            skipped,
        };
        tracing::info!(
            epoch,
            loss = outcome.loss,
            dice = outcome.metrics.dice,
            iou = outcome.metrics.iou,
            skipped,
            lr,
            "train epoch done"
        );
        Ok((model, outcome))
    }

    fn validate_epoch(
        &self,
        model: &StrokeUNet<B::InnerBackend>,
        loader: &dyn DataLoader<B::InnerBackend, StrokeBatch<B::InnerBackend>>,
    ) -> ValidationOutcome {
        let mut metrics = MetricsAccumulator::new();

        for batch in loader.iter() {
            let batch_size = batch.len();
            let logits = model.forward(batch.images);
            let loss = self
                .valid_loss
                .forward(logits.clone(), batch.masks.clone())
                .into_scalar()
                .to_f64();

            metrics.update_loss(loss, batch_size);
            metrics.extend(&batch_metrics(
                sigmoid(logits),
                batch.masks,
                self.config.threshold,
            ));
        }

        let outcome = ValidationOutcome {
            loss: metrics.loss(),
            metrics: metrics.value(),
        };
        tracing::info!(
            loss = outcome.loss,
            dice = outcome.metrics.dice,
            iou = outcome.metrics.iou,
            sensitivity = outcome.metrics.sensitivity,
            specificity = outcome.metrics.specificity,
            "validation done"
        );
        outcome
    }

    fn decide(
        &mut self,
        model: &StrokeUNet<B>,
        epoch: usize,
        train: TrainOutcome,
        valid: ValidationOutcome,
    ) -> StrokeSegResult<TrainingState> {
        let value = match self.config.monitored_metric {
            MonitoredMetric::Dice => valid.metrics.dice,
            MonitoredMetric::Iou => valid.metrics.iou,
            MonitoredMetric::ValLoss => valid.loss,
        };
        let lr = self.scheduler.lr();
        self.scheduler.step(value);

        let decision = self.policy.decide(epoch, value);
        let improved = matches!(decision, CheckpointDecision::Improved { .. });

        if improved {
            let dir = self.config.checkpoint_dir();
            let checkpoint = Checkpoint::save(
                &dir,
                &model.valid(),
                &self.config.model,
                &self.config.preprocess,
                epoch,
                self.config.monitored_metric,
                value,
            )?;
            self.best = Some(BestCheckpoint {
                epoch,
                value,
                dir,
                content_hash: checkpoint.content_hash().to_owned(),
            });
        }

        self.history.push(EpochRecord {
            epoch,
            learning_rate: lr,
            train_batch_losses: train.batch_losses,
            train_loss: train.loss,
            train_dice: train.metrics.dice,
            train_iou: train.metrics.iou,
            skipped_batches: train.skipped,
            val_loss: valid.loss,
            val: valid.metrics,
            improved,
        });

        let next = match decision {
            CheckpointDecision::Improved { previous } => {
                tracing::info!(epoch, metric = %self.config.monitored_metric, value, ?previous, "new best");
                None
            }
            CheckpointDecision::NotImproved {
                epochs_without_improvement,
            } => {
                tracing::info!(
                    epoch,
                    value,
                    epochs_without_improvement,
                    patience = self.config.patience,
                    "no improvement"
                );
                None
            }
            CheckpointDecision::Stop {
                epochs_without_improvement,
            } => {
                tracing::info!(epoch, epochs_without_improvement, "early stopping");
                Some(TerminationReason::EarlyStopped {
                    epochs_without_improvement,
                })
            }
        };

        Ok(match next {
            Some(reason) => TrainingState::Terminated(reason),
            None if epoch >= self.config.num_epochs => {
                TrainingState::Terminated(TerminationReason::EpochsExhausted)
            }
            None => TrainingState::TrainEpoch { epoch: epoch + 1 },
        })
    }

    fn export_best(&self, best: &BestCheckpoint) -> StrokeSegResult<PathBuf> {
        let checkpoint = Checkpoint::open(&best.dir)?;
        let store = match &self.config.artifact_store {
            Some(root) => ArtifactStore::open(root)?,
            None => ArtifactStore::open_default()?,
        };
        export::export_graph::<B::InnerBackend>(
            &checkpoint,
            &store,
            &ExportConfig::new(),
            &self.device,
        )
    }
}
