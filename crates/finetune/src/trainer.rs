use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use candle_core::DType;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::{self, CheckpointDescriptor, CheckpointStore, PRETRAINED_FILENAME},
    codec::TextCodec,
    config::RestoreFrom,
    data::ChunkSampler,
    logging::{Logger, LoggingSettings},
    metrics::LossAverage,
    model::{GenerationOptions, LanguageModel},
    optimizer::{Adafactor, AdafactorConfig, ParameterSet, ParameterStore},
    samples::SampleStore,
    FinetuneConfig, FinetuneError, Result,
};

const DEFAULT_SAMPLE_LENGTH: usize = 1023;

/// Why [`TrainingController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetReached,
    EarlyStop,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    Save,
    Miss,
    /// Not a checkpoint opportunity.
    Skip,
}

/// Validation-gated checkpointing with bounded tolerance for regressions.
///
/// Every `save_every` iterations (from `save_every` on) the averaged
/// validation loss either beats the best seen so far, which earns a
/// checkpoint, or counts as a miss. `patience` consecutive misses stop
/// training.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    save_every: usize,
    patience: usize,
    best: f64,
    missed: usize,
}

impl CheckpointPolicy {
    pub fn new(save_every: usize, patience: usize) -> Self {
        Self {
            save_every: save_every.max(1),
            patience: patience.max(1),
            best: f64::INFINITY,
            missed: 0,
        }
    }

    pub fn observe(&mut self, counter: usize, average_val_loss: f64) -> CheckpointDecision {
        if counter < self.save_every || counter % self.save_every != 0 {
            return CheckpointDecision::Skip;
        }
        if average_val_loss < self.best {
            self.best = average_val_loss;
            self.missed = 0;
            CheckpointDecision::Save
        } else {
            self.missed += 1;
            CheckpointDecision::Miss
        }
    }

    pub fn should_stop(&self) -> bool {
        self.missed >= self.patience
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn missed(&self) -> usize {
        self.missed
    }
}

#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Iteration about to run, or the one that ended the run.
    pub counter: usize,
    pub train_loss: LossAverage,
    pub val_loss: LossAverage,
    pub checkpoints: CheckpointPolicy,
}

impl TrainingState {
    fn new(save_every: usize, patience: usize) -> Self {
        Self {
            counter: 1,
            train_loss: LossAverage::new(),
            val_loss: LossAverage::new(),
            checkpoints: CheckpointPolicy::new(save_every, patience),
        }
    }

    pub fn best_val_loss(&self) -> f64 {
        self.checkpoints.best()
    }

    pub fn missed_val_checkpoints(&self) -> usize {
        self.checkpoints.missed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoredWeights {
    Checkpoint(PathBuf),
    Pretrained(PathBuf),
    /// Nothing found on disk; the model keeps its own initial weights.
    Initial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOutcome {
    pub start_counter: usize,
    pub restored: RestoredWeights,
}

pub struct TrainingController<M: LanguageModel> {
    config: FinetuneConfig,
    model: M,
    codec: Box<dyn TextCodec>,
    train_sampler: ChunkSampler,
    val_sampler: ChunkSampler,
    trainable: ParameterSet,
    optimizer: Adafactor,
    checkpoints: CheckpointStore,
    samples: SampleStore,
    logger: Logger,
    rng: StdRng,
    state: TrainingState,
    sample_length: usize,
    start_time: Instant,
}

impl<M: LanguageModel> TrainingController<M> {
    pub fn new(
        config: FinetuneConfig,
        model: M,
        codec: Box<dyn TextCodec>,
        train_sampler: ChunkSampler,
        val_sampler: ChunkSampler,
    ) -> Result<Self> {
        config.validate()?;

        let window = model.context_window();
        let sample_length = config.sampling.sample_length.unwrap_or_else(|| {
            window
                .map(|window| window / 2)
                .unwrap_or(DEFAULT_SAMPLE_LENGTH)
        });
        if let Some(window) = window {
            if sample_length > window {
                return Err(FinetuneError::initialization(format!(
                    "Can't get samples longer than window size: {window}"
                )));
            }
            if config.training.batch_length - 1 > window {
                return Err(FinetuneError::initialization(format!(
                    "training.batch_length {} does not fit the model window of {window} tokens",
                    config.training.batch_length
                )));
            }
        }

        let batch_length = config.training.batch_length;
        for (label, sampler) in [("dataset", &train_sampler), ("valset", &val_sampler)] {
            if sampler.max_sample_length().map_or(true, |max| batch_length > max) {
                log::error!(
                    "{label} has {} tokens in {} chunks",
                    sampler.total_size(),
                    sampler.num_chunks()
                );
                return Err(FinetuneError::SampleTooLong {
                    length: batch_length,
                    average: sampler.total_size() / sampler.num_chunks(),
                });
            }
        }

        let all_parameters = model.parameters();
        let total = all_parameters.len();
        let trainable = ParameterSet::trailing(all_parameters, config.model.layers_to_train);
        log::info!(
            "training {} parameter tensors out of {} ({} values)",
            trainable.len(),
            total,
            trainable.element_count()
        );
        let optimizer = Adafactor::new(AdafactorConfig::from(&config.optimizer), &trainable)?;

        let checkpoints =
            CheckpointStore::new(config.run_checkpoint_dir(), config.runtime.max_keep)
                .with_config(&config)?;
        let samples = SampleStore::new(config.run_sample_dir());
        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let rng = StdRng::seed_from_u64(config.training.seed);
        let state = TrainingState::new(config.training.save_every, config.training.patience);

        Ok(Self {
            config,
            model,
            codec,
            train_sampler,
            val_sampler,
            trainable,
            optimizer,
            checkpoints,
            samples,
            logger,
            rng,
            state,
            sample_length,
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &FinetuneConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &Adafactor {
        &self.optimizer
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn sample_length(&self) -> usize {
        self.sample_length
    }

    /// Loads weights per `training.restore_from` and continues numbering
    /// after the persisted counter.
    pub fn resume(&mut self) -> Result<ResumeOutcome> {
        let restored = match self.config.training.restore_from.clone() {
            RestoreFrom::Latest => match self.checkpoints.latest()? {
                Some(descriptor) => self.restore_checkpoint(&descriptor)?,
                None => self.restore_pretrained()?,
            },
            RestoreFrom::Fresh => self.restore_pretrained()?,
            RestoreFrom::Path(path) => {
                let descriptor = checkpoint::resolve_checkpoint(&path)?.ok_or_else(|| {
                    FinetuneError::initialization(format!(
                        "no checkpoint found at {}",
                        path.display()
                    ))
                })?;
                self.restore_checkpoint(&descriptor)?
            }
        };

        if let Some(counter) = self.checkpoints.read_counter()? {
            self.state.counter = counter + 1;
        }
        log::info!("starting at iteration {}", self.state.counter);

        Ok(ResumeOutcome {
            start_counter: self.state.counter,
            restored,
        })
    }

    fn restore_checkpoint(&mut self, descriptor: &CheckpointDescriptor) -> Result<RestoredWeights> {
        log::info!("loading checkpoint {}", descriptor.directory.display());
        if descriptor.manifest.config_sha256.as_deref() != self.checkpoints.config_sha256() {
            log::info!("configuration changed since this checkpoint was written");
        }
        let outcome = checkpoint::load_checkpoint(&descriptor.directory, self.model.device())?;
        checkpoint::apply_weights(&self.model.parameters(), &outcome.model_weights_path)?;
        if let Some(state) = outcome.optimizer_state {
            let loaded = self.optimizer.load_state_tensors(&state)?;
            log::debug!("restored {loaded} optimizer slot tensors");
        }
        Ok(RestoredWeights::Checkpoint(descriptor.directory.clone()))
    }

    fn restore_pretrained(&mut self) -> Result<RestoredWeights> {
        let path = self.config.pretrained_dir().join(PRETRAINED_FILENAME);
        if !path.is_file() {
            log::warn!(
                "no pretrained weights at {}, starting from the model's initial weights",
                path.display()
            );
            return Ok(RestoredWeights::Initial);
        }
        log::info!("loading pretrained weights {}", path.display());
        checkpoint::apply_weights(&self.model.parameters(), &path)?;
        Ok(RestoredWeights::Pretrained(path))
    }

    pub fn run(&mut self) -> Result<StopReason> {
        self.run_with_shutdown(|| false)
    }

    /// Trains until the budget is spent, validation stops improving, or
    /// `should_stop` returns true. `should_stop` is polled between iterations.
    pub fn run_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<StopReason>
    where
        F: FnMut() -> bool,
    {
        log::info!(
            "dataset has {} tokens, valset has {} tokens",
            self.train_sampler.total_size(),
            self.val_sampler.total_size()
        );
        self.start_time = Instant::now();

        let reason = loop {
            if let Some(limit) = self.config.training.stop_after {
                if self.state.counter >= limit {
                    break StopReason::BudgetReached;
                }
            }
            if should_stop() {
                log::info!("interrupted at iteration {}", self.state.counter);
                let last_completed = self.state.counter.saturating_sub(1);
                if self.config.training.save_on_interrupt && last_completed > 0 {
                    self.save(last_completed)?;
                }
                break StopReason::Interrupted;
            }
            if self.iterate()? {
                break StopReason::EarlyStop;
            }
            self.state.counter += 1;
        };

        self.logger.flush();
        Ok(reason)
    }

    /// Runs iteration `state.counter`; returns true when training should stop early.
    fn iterate(&mut self) -> Result<bool> {
        let counter = self.state.counter;

        let sample_every = self.config.sampling.sample_every;
        if sample_every > 0 && counter % sample_every == 0 {
            self.generate_samples(counter)?;
        }

        let loss = self.train_step(counter)?;
        let average = self.state.train_loss.update(loss);
        self.logger
            .log_training_step(counter, self.elapsed(), loss, average);

        if counter % self.config.training.validate_every != 0 {
            return Ok(false);
        }

        let val_loss = self.validation_loss()?;
        let val_average = self.state.val_loss.update(val_loss);
        self.logger.log_validation(
            counter,
            self.elapsed(),
            val_loss,
            val_average,
            self.state.best_val_loss(),
        );

        match self.state.checkpoints.observe(counter, val_average) {
            CheckpointDecision::Save => self.save(counter)?,
            CheckpointDecision::Miss => log::info!(
                "validation average {:.4} did not beat {:.4} ({} missed)",
                val_average,
                self.state.best_val_loss(),
                self.state.missed_val_checkpoints()
            ),
            CheckpointDecision::Skip => {}
        }

        if self.state.checkpoints.should_stop() {
            log::info!(
                "stopping early after {} checkpoints without improvement",
                self.state.missed_val_checkpoints()
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn train_step(&mut self, counter: usize) -> Result<f64> {
        let batch_length = self.config.training.batch_length;
        let batch = (0..self.config.training.batch_size)
            .map(|_| {
                self.train_sampler
                    .sample(&mut self.rng, batch_length)
                    .map(|sample| sample.tokens)
            })
            .collect::<Result<Vec<_>>>()?;

        let loss = self.model.loss(&batch)?;
        let value = scalar(&loss)?;
        let grads = loss.backward()?;
        // Iteration `counter` applies update number `counter - 1`.
        let report = self.optimizer.step(&self.trainable, &grads, counter - 1)?;
        if report.updated == 0 {
            log::warn!("iteration {counter}: no trainable parameter received a gradient");
        }
        Ok(value)
    }

    fn validation_loss(&mut self) -> Result<f64> {
        let batch_length = self.config.training.batch_length;
        let batch = (0..self.config.training.batch_size)
            .map(|_| {
                self.val_sampler
                    .sample(&mut self.rng, batch_length)
                    .map(|sample| sample.tokens)
            })
            .collect::<Result<Vec<_>>>()?;
        scalar(&self.model.loss(&batch)?.detach())
    }

    fn generate_samples(&mut self, counter: usize) -> Result<()> {
        let context = self.train_sampler.sample(&mut self.rng, 1)?.tokens.to_vec();
        let options = GenerationOptions {
            length: self.sample_length,
            temperature: self.config.sampling.temperature,
            top_k: self.config.sampling.top_k,
        };

        let mut texts = Vec::with_capacity(self.config.sampling.sample_num);
        for _ in 0..self.config.sampling.sample_num {
            let tokens = self.model.generate(&context, &options, &mut self.rng)?;
            texts.push(self.codec.decode(&tokens)?);
        }

        if let Some(last) = texts.last() {
            self.logger.log_sample(last);
        }
        let path = self.samples.write(counter, &texts)?;
        log::info!("wrote {} samples to {}", texts.len(), path.display());
        Ok(())
    }

    fn save(&mut self, counter: usize) -> Result<()> {
        let optimizer_state = self.optimizer.state_tensors();
        let descriptor =
            self.checkpoints
                .save(counter, &self.model.parameters(), Some(&optimizer_state))?;
        log::info!("saved {}", descriptor.directory.display());
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

fn scalar(loss: &candle_core::Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F32)?.to_vec0::<f32>()? as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_skips_before_first_save_point() {
        let mut policy = CheckpointPolicy::new(100, 10);
        assert_eq!(policy.observe(5, 1.0), CheckpointDecision::Skip);
        assert_eq!(policy.observe(95, 1.0), CheckpointDecision::Skip);
        assert_eq!(policy.observe(150, 1.0), CheckpointDecision::Skip);
        assert_eq!(policy.observe(100, 1.0), CheckpointDecision::Save);
        assert_eq!(policy.best(), 1.0);
    }

    #[test]
    fn improvement_resets_missed_count() {
        let mut policy = CheckpointPolicy::new(10, 3);
        assert_eq!(policy.observe(10, 5.0), CheckpointDecision::Save);
        assert_eq!(policy.observe(20, 5.0), CheckpointDecision::Miss);
        assert_eq!(policy.observe(30, 6.0), CheckpointDecision::Miss);
        assert_eq!(policy.missed(), 2);
        assert_eq!(policy.observe(40, 4.0), CheckpointDecision::Save);
        assert_eq!(policy.missed(), 0);
        assert!(!policy.should_stop());
    }

    #[test]
    fn tenth_miss_stops_with_default_patience() {
        let mut policy = CheckpointPolicy::new(1, 10);
        policy.observe(1, 1.0);
        for counter in 2..=10 {
            assert_eq!(policy.observe(counter, 2.0), CheckpointDecision::Miss);
            assert!(!policy.should_stop());
        }
        assert_eq!(policy.observe(11, 2.0), CheckpointDecision::Miss);
        assert!(policy.should_stop());
    }
}
