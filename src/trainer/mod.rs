// Copyright 2021 The rust-pretrain Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! # Training loop
//!
//! `Trainer` drives the pretraining of any `PretrainingModel`:
//! - checkpoint resumption (model, optimizer, epoch, global step and loss history)
//! - gradient accumulation over micro-batches
//! - periodic loss reporting, checkpointing and per-epoch evaluation
//! - data parallelism over one model replica per device (`DataParallel`)
//!
//! Results are written to the log directory: `{name}_train_results.json` holds the loss of every
//! micro-batch, `{name}_eval_results.txt` one line per evaluation batch with the running mean loss
//! and perplexity.

mod checkpoint;
mod parallel;
mod scalars;

pub use checkpoint::{Checkpoint, TrainingState};
pub use parallel::{DataParallel, Replica};
pub use scalars::ScalarWriter;

use crate::common::error::PretrainError;
use crate::data::{random_split, Batch, DataLoader, Dataset};
use crate::optimizer::{LearningRateScheduler, Optimizer};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tch::Tensor;
use tracing::{info, warn};

/// # Model trained by the `Trainer`
pub trait PretrainingModel {
    /// Scalar training loss for a batch
    ///
    /// # Arguments
    ///
    /// * `batch` - batch located on the device of the model
    /// * `train` - boolean flag to turn on/off the dropout layers in the model
    fn forward_loss(&self, batch: &Batch, train: bool) -> Result<Tensor, PretrainError>;
}

fn default_true() -> bool {
    true
}

/// # Trainer settings independent of the training schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Run name, used to name the checkpoint, log and result files
    pub model_name: String,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Directory of the scalar summary log, disabled if not set
    #[serde(default)]
    pub scalar_dir: Option<PathBuf>,
    pub train_batch_size: usize,
    /// Defaults to the training batch size
    #[serde(default)]
    pub eval_batch_size: Option<usize>,
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

impl TrainerConfig {
    pub fn eval_batch_size(&self) -> usize {
        self.eval_batch_size.unwrap_or(self.train_batch_size)
    }

    pub fn validate(&self) -> Result<(), PretrainError> {
        if self.train_batch_size == 0 || self.eval_batch_size() == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "batch sizes must be strictly positive".to_string(),
            ));
        }
        if self.model_name.is_empty() {
            return Err(PretrainError::InvalidConfigurationError(
                "the model name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_accumulation() -> usize {
    1
}

/// # Training schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub epochs: usize,
    /// Number of micro-batches between two loss reports
    pub log_steps: usize,
    /// Number of micro-batches between two checkpoints
    pub ckpt_steps: usize,
    /// Number of micro-batches accumulated per optimizer update
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

impl TrainingArguments {
    pub fn validate(&self) -> Result<(), PretrainError> {
        for (name, value) in &[
            ("log_steps", self.log_steps),
            ("ckpt_steps", self.ckpt_steps),
            (
                "gradient_accumulation_steps",
                self.gradient_accumulation_steps,
            ),
        ] {
            if *value == 0 {
                return Err(PretrainError::InvalidConfigurationError(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        if let Some(max_grad_norm) = self.max_grad_norm {
            if max_grad_norm <= 0.0 {
                return Err(PretrainError::InvalidConfigurationError(format!(
                    "max_grad_norm must be strictly positive, got {}",
                    max_grad_norm
                )));
            }
        }
        Ok(())
    }

    /// Number of optimizer updates for a training loader of `batches_per_epoch` batches
    pub fn optimization_steps(&self, batches_per_epoch: usize) -> usize {
        let accumulation = self.gradient_accumulation_steps.max(1);
        (batches_per_epoch + accumulation - 1) / accumulation * self.epochs
    }
}

/// # Evaluation metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub loss: f64,
    /// Mean of the per-batch perplexities
    pub perplexity: f64,
    pub num_batches: usize,
}

/// # Outcome of `Trainer::train`
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub train_steps: usize,
    pub optimizer_steps: i64,
    /// Epoch and global step the run was resumed from
    pub resumed_from: Option<(usize, usize)>,
    /// Evaluation after the last epoch
    pub eval: Option<EvalResult>,
}

fn progress_bar(len: usize, enabled: bool, prefix: &str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_prefix(prefix.to_string());
    bar
}

/// # Pretraining driver
pub struct Trainer<M: PretrainingModel> {
    config: TrainerConfig,
    dataset: Arc<dyn Dataset>,
    model: DataParallel<M>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LearningRateScheduler>>,
    checkpoint: Checkpoint,
    scalars: Option<ScalarWriter>,
    train_step: usize,
}

impl<M: PretrainingModel> Trainer<M> {
    /// Creates a trainer for `model`, whose primary replica parameters are the ones handled by `optimizer`.
    pub fn new(
        config: TrainerConfig,
        dataset: Arc<dyn Dataset>,
        model: DataParallel<M>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<Trainer<M>, PretrainError> {
        config.validate()?;
        fs::create_dir_all(&config.log_dir)?;
        let checkpoint = Checkpoint::new(&config.checkpoint_dir, &config.model_name);
        let scalars = match &config.scalar_dir {
            Some(dir) => Some(ScalarWriter::new(dir, &config.model_name)?),
            None => None,
        };
        Ok(Trainer {
            config,
            dataset,
            model,
            optimizer,
            scheduler: None,
            checkpoint,
            scalars,
            train_step: 0,
        })
    }

    /// Sets the learning rate schedule, evaluated before every optimizer update.
    pub fn with_scheduler(mut self, scheduler: Box<dyn LearningRateScheduler>) -> Trainer<M> {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn model(&self) -> &DataParallel<M> {
        &self.model
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn train_results_path(&self) -> PathBuf {
        self.config
            .log_dir
            .join(format!("{}_train_results.json", self.config.model_name))
    }

    pub fn eval_results_path(&self) -> PathBuf {
        self.config
            .log_dir
            .join(format!("{}_eval_results.txt", self.config.model_name))
    }

    /// Splits the dataset into a training and an evaluation loader.
    ///
    /// # Arguments
    ///
    /// * `train_test_split` - fraction of the samples used for evaluation
    /// * `train_shuffle` - shuffle the training samples every epoch
    /// * `eval_shuffle` - shuffle the evaluation samples
    /// * `seed` - seed of the split and of the shuffling
    pub fn build_dataloaders(
        &self,
        train_test_split: f64,
        train_shuffle: bool,
        eval_shuffle: bool,
        seed: u64,
    ) -> Result<(DataLoader, DataLoader), PretrainError> {
        let (train_indices, eval_indices) =
            random_split(self.dataset.len(), train_test_split, seed)?;
        let train_loader = DataLoader::new(
            self.dataset.clone(),
            train_indices,
            self.config.train_batch_size,
            train_shuffle,
            seed,
        )?;
        let eval_loader = DataLoader::new(
            self.dataset.clone(),
            eval_indices,
            self.config.eval_batch_size(),
            eval_shuffle,
            seed,
        )?;
        info!(
            "train loader: {} batches ({} samples), eval loader: {} batches ({} samples)",
            train_loader.len(),
            train_loader.num_samples(),
            eval_loader.len(),
            eval_loader.num_samples()
        );
        Ok((train_loader, eval_loader))
    }

    fn save_checkpoint(&self, state: &TrainingState) -> Result<(), PretrainError> {
        self.checkpoint.save(
            self.model.primary_var_store(),
            self.optimizer.as_ref(),
            state,
        )?;
        info!(
            epoch = state.epoch,
            step = state.train_step,
            "saved checkpoint to {}",
            self.checkpoint.model_path().display()
        );
        Ok(())
    }

    fn write_train_results(&self, losses: &BTreeMap<usize, f64>) -> Result<(), PretrainError> {
        let writer = BufWriter::new(File::create(self.train_results_path())?);
        serde_json::to_writer(writer, losses)?;
        Ok(())
    }

    fn optimization_step(&mut self, args: &TrainingArguments) -> Result<(), PretrainError> {
        if let Some(scheduler) = &self.scheduler {
            let step = self.optimizer.step_count() as usize + 1;
            self.optimizer.set_learning_rate(scheduler.get_lr(step));
        }
        self.model.reduce_gradients();
        if let Some(max_grad_norm) = args.max_grad_norm {
            self.optimizer.clip_grad_norm(max_grad_norm);
        }
        self.optimizer.step()?;
        self.model.zero_grad();
        self.model.broadcast_parameters();
        Ok(())
    }

    /// Trains the model, resuming from the last checkpoint if one exists.
    ///
    /// # Arguments
    ///
    /// * `args` - epochs, reporting and checkpointing intervals, gradient accumulation
    /// * `train_loader` - training batches
    /// * `eval_loader` - evaluation batches, evaluated after every epoch
    ///
    /// # Returns
    ///
    /// * `TrainingSummary` of the run
    pub fn train(
        &mut self,
        args: &TrainingArguments,
        train_loader: &DataLoader,
        eval_loader: &DataLoader,
    ) -> Result<TrainingSummary, PretrainError> {
        args.validate()?;
        let batches_per_epoch = train_loader.len();
        if batches_per_epoch == 0 {
            return Err(PretrainError::DataError(
                "the training loader is empty".to_string(),
            ));
        }

        let resumed = self.checkpoint.load(
            self.model.primary_var_store_mut(),
            self.optimizer.as_mut(),
        )?;
        let mut state = match resumed {
            Some(state) => {
                info!(
                    "resuming from {} at epoch {}, step {}",
                    self.checkpoint.model_path().display(),
                    state.epoch,
                    state.train_step
                );
                self.model.broadcast_parameters();
                state
            }
            None => TrainingState::default(),
        };
        let resumed_from = if state.train_step > 0 || state.epoch > 0 {
            Some((state.epoch, state.train_step))
        } else {
            None
        };
        let mut skip = state.steps_to_skip(batches_per_epoch);
        self.train_step = state.train_step;

        info!("devices: {:?}", self.model.devices());
        info!(
            "train batch size: {}, eval batch size: {}",
            self.config.train_batch_size,
            self.config.eval_batch_size()
        );
        info!(
            "epochs: {}, log steps: {}, checkpoint steps: {}, gradient accumulation steps: {}",
            args.epochs, args.log_steps, args.ckpt_steps, args.gradient_accumulation_steps
        );

        let scale = 1.0 / args.gradient_accumulation_steps as f64;
        let mut running_loss = 0.0;
        let mut running_count = 0usize;
        let mut eval = None;
        self.model.zero_grad();

        for epoch in state.epoch..args.epochs {
            state.epoch = epoch;
            let batches = train_loader.iter_from(epoch, skip);
            skip = 0;
            let progress = progress_bar(
                batches.len(),
                self.config.progress_bar,
                &format!("Epoch {}", epoch),
            );
            for batch in batches {
                let batch = batch?;
                let loss = self.model.forward_backward(&batch, scale)?;
                if !loss.is_finite() {
                    warn!(step = state.train_step, "non-finite training loss {}", loss);
                }
                state.losses.insert(state.train_step, loss);
                state.train_step += 1;
                self.train_step = state.train_step;
                running_loss += loss;
                running_count += 1;

                if state.train_step % args.gradient_accumulation_steps == 0 {
                    self.optimization_step(args)?;
                }

                if state.train_step % args.log_steps == 0 {
                    let mean_loss = running_loss / running_count as f64;
                    progress.set_message(format!("loss {:.4}", mean_loss));
                    info!(
                        epoch,
                        step = state.train_step,
                        learning_rate = self.optimizer.learning_rate(),
                        "train loss {:.6}",
                        mean_loss
                    );
                    if let Some(scalars) = self.scalars.as_mut() {
                        scalars.add_scalar("Train/Loss", mean_loss, state.train_step)?;
                    }
                    self.write_train_results(&state.losses)?;
                    running_loss = 0.0;
                    running_count = 0;
                }

                if state.train_step % args.ckpt_steps == 0 {
                    self.save_checkpoint(&state)?;
                }
                progress.inc(1);
            }
            progress.finish();
            eval = self.evaluate(eval_loader)?;
        }

        state.epoch = args.epochs;
        self.save_checkpoint(&state)?;
        Ok(TrainingSummary {
            train_steps: state.train_step,
            optimizer_steps: self.optimizer.step_count(),
            resumed_from,
            eval,
        })
    }

    /// Evaluates the model on `eval_loader` without gradient tracking.
    ///
    /// Every batch appends the running mean loss and perplexity to the evaluation results file.
    /// Returns `None` for an empty loader.
    pub fn evaluate(&mut self, eval_loader: &DataLoader) -> Result<Option<EvalResult>, PretrainError> {
        if eval_loader.is_empty() {
            warn!("the evaluation loader is empty, skipping evaluation");
            return Ok(None);
        }
        info!("evaluating at step {}", self.train_step);
        let mut results_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.eval_results_path())?;
        let progress = progress_bar(eval_loader.len(), self.config.progress_bar, "Evaluating");

        let mut eval_loss = 0.0;
        let mut perplexity = 0.0;
        let mut eval_steps = 0usize;
        for (step, batch) in eval_loader.iter(0).enumerate() {
            let loss = self.model.evaluate(&batch?)?;
            eval_loss += loss;
            perplexity += loss.exp();
            eval_steps += 1;

            let mean_loss = eval_loss / eval_steps as f64;
            let mean_perplexity = perplexity / eval_steps as f64;
            let line = format!(
                "{} | Step: {} | Eval Loss: {} | Perplexity: {}",
                chrono::Local::now(),
                step,
                mean_loss,
                mean_perplexity
            );
            info!("{}", line);
            writeln!(results_file, "{}", line)?;
            progress.inc(1);
        }
        progress.finish();

        let result = EvalResult {
            loss: eval_loss / eval_steps as f64,
            perplexity: perplexity / eval_steps as f64,
            num_batches: eval_steps,
        };
        if let Some(scalars) = self.scalars.as_mut() {
            scalars.add_scalar("Eval/Loss", result.loss, self.train_step)?;
            scalars.add_scalar("Perplexity", result.perplexity, self.train_step)?;
        }
        Ok(Some(result))
    }
}
