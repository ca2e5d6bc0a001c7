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

//! # Optimizers and learning rate schedules
//!
//! The optimizers operate directly on the `tch` variables of a `VarStore` so that their
//! state can be written to and restored from a checkpoint alongside the model weights.
//! - `Adafactor`: factored second-moment optimizer with relative step sizes, used for the
//!   Reformer causal language model
//! - `AdamW`: Adam with decoupled weight decay and per-parameter decay groups, used for ELECTRA

mod adafactor;
mod adamw;
mod scheduler;

pub use adafactor::{Adafactor, AdafactorConfig};
pub use adamw::{AdamW, AdamWConfig};
pub use scheduler::{LearningRateScheduler, LinearWarmupDecay};

use crate::common::error::PretrainError;
use std::collections::HashMap;
use tch::{nn, Kind, Tensor};

/// Parameter name patterns excluded from weight decay
pub const NO_DECAY: [&str; 3] = ["bias", "LayerNorm.weight", "layer_norm.weight"];

/// # Trainable variable with its weight decay
#[derive(Debug)]
pub struct Parameter {
    pub name: String,
    pub tensor: Tensor,
    pub weight_decay: f64,
}

/// Collects the trainable variables of a `VarStore`, sorted by name.
///
/// Variables whose name contains any of the `no_decay` patterns get a weight decay of 0,
/// all others `weight_decay`.
pub fn parameters_with_weight_decay(
    var_store: &nn::VarStore,
    weight_decay: f64,
    no_decay: &[&str],
) -> Vec<Parameter> {
    let mut parameters = var_store
        .variables()
        .into_iter()
        .filter(|(_, tensor)| tensor.requires_grad())
        .map(|(name, tensor)| {
            let weight_decay = if no_decay.iter().any(|pattern| name.contains(pattern)) {
                0.0
            } else {
                weight_decay
            };
            Parameter {
                name,
                tensor,
                weight_decay,
            }
        })
        .collect::<Vec<Parameter>>();
    parameters.sort_by(|a, b| a.name.cmp(&b.name));
    parameters
}

/// Root mean square of a tensor
pub(crate) fn rms(tensor: &Tensor) -> f64 {
    let numel = tensor.numel() as f64;
    if numel == 0.0 {
        return 0.0;
    }
    tensor.to_kind(Kind::Float).norm().double_value(&[]) / numel.sqrt()
}

/// Indexes named state tensors loaded from a checkpoint.
pub(crate) fn index_state(tensors: Vec<(String, Tensor)>) -> HashMap<String, Tensor> {
    tensors.into_iter().collect()
}

pub(crate) fn missing_state(name: &str) -> PretrainError {
    PretrainError::SerializationError(format!("optimizer state entry `{}` is missing", name))
}

/// # Optimizer over a fixed set of parameters
pub trait Optimizer {
    fn parameters(&self) -> &[Parameter];

    /// Applies one update to every parameter with a defined gradient.
    fn step(&mut self) -> Result<(), PretrainError>;

    /// Learning rate used by the last (or next, before any step) update
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    /// Number of updates applied so far
    fn step_count(&self) -> i64;

    /// Named tensors holding the complete optimizer state
    fn state_tensors(&self) -> Vec<(String, Tensor)>;

    fn load_state_tensors(&mut self, tensors: Vec<(String, Tensor)>) -> Result<(), PretrainError>;

    fn zero_grad(&mut self) {
        for parameter in self.parameters() {
            let mut grad = parameter.tensor.grad();
            if grad.defined() {
                let _ = grad.detach_();
                let _ = grad.zero_();
            }
        }
    }

    /// Rescales the gradients so that their global L2 norm does not exceed `max_norm`.
    /// Returns the norm before clipping.
    fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let grads = self
            .parameters()
            .iter()
            .map(|parameter| parameter.tensor.grad())
            .filter(Tensor::defined)
            .collect::<Vec<Tensor>>();
        let total_norm = grads
            .iter()
            .map(|grad| {
                let norm = grad.to_kind(Kind::Float).norm().double_value(&[]);
                norm * norm
            })
            .sum::<f64>()
            .sqrt();
        let clip_coefficient = max_norm / (total_norm + 1e-6);
        if clip_coefficient < 1.0 {
            tch::no_grad(|| {
                for grad in &grads {
                    let mut target = grad.shallow_clone();
                    target.copy_(&(grad * clip_coefficient));
                }
            });
        }
        total_norm
    }
}
