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


//! # Pretraining drivers
//!
//! JSON configurations and end-to-end runs behind the `pretrain-autoregressive` and
//! `pretrain-electra` binaries: tokenizer, dataset, model replicas, optimizer and trainer.

use crate::common::error::PretrainError;
use crate::common::Config;
use crate::data::{DatasetForAutoRegressive, ElectraDataset, SpecialTokens};
use crate::electra::{ElectraMaskingConfig, ReformerElectra};
use crate::optimizer::{
    parameters_with_weight_decay, Adafactor, AdafactorConfig, AdamW, AdamWConfig,
    LinearWarmupDecay, NO_DECAY,
};
use crate::reformer::{ReformerAutoRegressiveModel, ReformerHyperparameters};
use crate::trainer::{
    DataParallel, PretrainingModel, Trainer, TrainerConfig, TrainingArguments, TrainingSummary,
};
use rust_tokenizers::tokenizer::{BertTokenizer, Tokenizer};
use rust_tokenizers::vocab::Vocab;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::Device;
use tracing::info;

/// Default seed of the drivers
pub const DEFAULT_SEED: u64 = 9;

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_accumulation() -> usize {
    1
}

fn default_train_test_split() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_adam_epsilon() -> f64 {
    1e-8
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_warmup_ratio() -> f64 {
    0.1
}

fn default_electra_name() -> String {
    "electra".to_string()
}

/// # Causal language model pretraining configuration
/// The Reformer hyperparameters (`dim`, `depth`, `n_head`/`heads`, ...) are read from the top level
/// of the JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRegressiveConfig {
    pub vocab_path: PathBuf,
    pub data_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub model_name: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub scalar_dir: Option<PathBuf>,
    pub max_seq_len: usize,
    #[serde(flatten)]
    pub model: ReformerHyperparameters,
    pub batch_size: usize,
    pub epochs: usize,
    pub log_steps: usize,
    pub ckpt_steps: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_train_test_split")]
    pub train_test_split: f64,
    /// Shuffle the evaluation subset as well as the training one
    #[serde(default = "default_true")]
    pub shuffle_eval: bool,
    #[serde(default)]
    pub lower_case: bool,
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

impl Config for AutoRegressiveConfig {}

impl AutoRegressiveConfig {
    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            model_name: self.model_name.clone(),
            checkpoint_dir: self.checkpoint_path.clone(),
            log_dir: self.log_dir.clone(),
            scalar_dir: self.scalar_dir.clone(),
            train_batch_size: self.batch_size,
            eval_batch_size: None,
            progress_bar: self.progress_bar,
        }
    }

    pub fn training_arguments(&self) -> TrainingArguments {
        TrainingArguments {
            epochs: self.epochs,
            log_steps: self.log_steps,
            ckpt_steps: self.ckpt_steps,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            max_grad_norm: self.max_grad_norm,
        }
    }
}

/// # Data, schedule and optimizer section of the ELECTRA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectraTrainConfig {
    pub vocab_path: PathBuf,
    pub data_path: PathBuf,
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_electra_name")]
    pub model_name: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub scalar_dir: Option<PathBuf>,
    pub max_len: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub log_steps: usize,
    pub ckpt_steps: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Fraction of the optimization steps used for the learning rate warmup
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_train_test_split")]
    pub train_test_split: f64,
    /// Shuffle the evaluation subset as well as the training one
    #[serde(default = "default_true")]
    pub shuffle_eval: bool,
    #[serde(default)]
    pub lower_case: bool,
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

/// # ELECTRA pretraining configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectraTrainingConfig {
    pub train: ElectraTrainConfig,
    pub generator: ReformerHyperparameters,
    pub discriminator: ReformerHyperparameters,
    #[serde(default)]
    pub masking: ElectraMaskingConfig,
}

impl Config for ElectraTrainingConfig {}

impl ElectraTrainingConfig {
    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            model_name: self.train.model_name.clone(),
            checkpoint_dir: self.train.checkpoint_path.clone(),
            log_dir: self.train.log_dir.clone(),
            scalar_dir: self.train.scalar_dir.clone(),
            train_batch_size: self.train.batch_size,
            eval_batch_size: None,
            progress_bar: self.train.progress_bar,
        }
    }

    pub fn training_arguments(&self) -> TrainingArguments {
        TrainingArguments {
            epochs: self.train.epochs,
            log_steps: self.train.log_steps,
            ckpt_steps: self.train.ckpt_steps,
            gradient_accumulation_steps: self.train.gradient_accumulation_steps,
            max_grad_norm: self.train.max_grad_norm,
        }
    }
}

/// Loads a cased (unless `lower_case`) BERT WordPiece tokenizer.
pub fn load_tokenizer(vocab_path: &Path, lower_case: bool) -> Result<BertTokenizer, PretrainError> {
    let vocab_path = vocab_path.to_str().ok_or_else(|| {
        PretrainError::IOError(format!(
            "vocabulary path {} is not valid UTF-8",
            vocab_path.display()
        ))
    })?;
    Ok(BertTokenizer::from_file(vocab_path, lower_case, lower_case)?)
}

fn vocab_size(tokenizer: &BertTokenizer) -> i64 {
    tokenizer.vocab().values().len() as i64
}

fn parameter_count<M: PretrainingModel>(model: &DataParallel<M>) -> usize {
    model
        .primary_var_store()
        .trainable_variables()
        .iter()
        .map(|variable| variable.numel())
        .sum()
}

/// Trains a Reformer causal language model with Adafactor.
pub fn pretrain_autoregressive(
    config: &AutoRegressiveConfig,
    devices: &[Device],
    seed: u64,
) -> Result<TrainingSummary, PretrainError> {
    tch::manual_seed(seed as i64);
    let tokenizer = load_tokenizer(&config.vocab_path, config.lower_case)?;
    let special_tokens = SpecialTokens::from_vocab(tokenizer.vocab());
    let reformer_config = config.model.to_config(
        vocab_size(&tokenizer),
        config.max_seq_len as i64,
        &special_tokens,
        true,
    )?;
    let dataset = Arc::new(DatasetForAutoRegressive::from_directory(
        &tokenizer,
        config.max_seq_len,
        &config.data_path,
    )?);

    let model = DataParallel::new(devices, |p| {
        ReformerAutoRegressiveModel::new(p, &reformer_config)
    })?;
    let optimizer = Adafactor::new(
        parameters_with_weight_decay(model.primary_var_store(), 0.0, &[]),
        AdafactorConfig::default(),
    )?;
    info!(
        "Reformer language model with {} parameters",
        parameter_count(&model)
    );

    let mut trainer = Trainer::new(
        config.trainer_config(),
        dataset,
        model,
        Box::new(optimizer),
    )?;
    let (train_loader, eval_loader) = trainer.build_dataloaders(
        config.train_test_split,
        true,
        config.shuffle_eval,
        seed,
    )?;
    trainer.train(&config.training_arguments(), &train_loader, &eval_loader)
}

/// Trains an ELECTRA generator/discriminator pair with AdamW and a linear warmup/decay schedule.
pub fn pretrain_electra(
    config: &ElectraTrainingConfig,
    devices: &[Device],
    seed: u64,
) -> Result<TrainingSummary, PretrainError> {
    tch::manual_seed(seed as i64);
    let train_config = &config.train;
    let tokenizer = load_tokenizer(&train_config.vocab_path, train_config.lower_case)?;
    let special_tokens = SpecialTokens::from_vocab(tokenizer.vocab());
    let vocab_size = vocab_size(&tokenizer);
    let max_len = train_config.max_len as i64;
    let generator_config =
        config
            .generator
            .to_config(vocab_size, max_len, &special_tokens, false)?;
    let discriminator_config =
        config
            .discriminator
            .to_config(vocab_size, max_len, &special_tokens, false)?;
    let dataset = Arc::new(ElectraDataset::from_path(
        &tokenizer,
        train_config.max_len,
        &train_config.data_path,
    )?);

    let model = DataParallel::new(devices, |p| {
        ReformerElectra::new(
            p,
            &generator_config,
            &discriminator_config,
            special_tokens,
            config.masking.clone(),
        )
    })?;
    let optimizer = AdamW::new(
        parameters_with_weight_decay(
            model.primary_var_store(),
            train_config.weight_decay,
            &NO_DECAY,
        ),
        AdamWConfig {
            lr: train_config.learning_rate,
            eps: train_config.adam_epsilon,
            ..Default::default()
        },
    )?;

    info!(
        "ELECTRA generator and discriminator with {} parameters",
        parameter_count(&model)
    );
    let trainer = Trainer::new(
        config.trainer_config(),
        dataset,
        model,
        Box::new(optimizer),
    )?;
    let (train_loader, eval_loader) = trainer.build_dataloaders(
        train_config.train_test_split,
        true,
        train_config.shuffle_eval,
        seed,
    )?;

    let args = config.training_arguments();
    let total_steps = args.optimization_steps(train_loader.len());
    let scheduler = LinearWarmupDecay::with_warmup_ratio(
        train_config.learning_rate,
        train_config.warmup_ratio,
        total_steps,
    )?;
    info!(
        "{} optimization steps, {} warmup steps",
        total_steps,
        scheduler.warmup_steps()
    );
    let mut trainer = trainer.with_scheduler(Box::new(scheduler));
    trainer.train(&args, &train_loader, &eval_loader)
}
