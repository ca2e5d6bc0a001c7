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

use crate::common::error::PretrainError;
use crate::optimizer::{index_state, missing_state, Optimizer, Parameter};
use tch::{Kind, Tensor};

/// # AdamW configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            lr: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct ParamState {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// # AdamW optimizer
/// Adam with bias correction and decoupled weight decay (Loshchilov & Hutter, 2019).
/// The weight decay of each parameter comes from its `Parameter` group, the decay step is applied
/// after the Adam update and scaled by the learning rate.
pub struct AdamW {
    config: AdamWConfig,
    parameters: Vec<Parameter>,
    state: Vec<Option<ParamState>>,
    steps: i64,
}

impl AdamW {
    pub fn new(parameters: Vec<Parameter>, config: AdamWConfig) -> Result<AdamW, PretrainError> {
        if config.lr < 0.0 || config.eps < 0.0 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "invalid AdamW learning rate {} or epsilon {}",
                config.lr, config.eps
            )));
        }
        if !(0.0..1.0).contains(&config.beta1) || !(0.0..1.0).contains(&config.beta2) {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "AdamW betas must be in [0, 1), got ({}, {})",
                config.beta1, config.beta2
            )));
        }
        let state = parameters.iter().map(|_| None).collect();
        Ok(AdamW {
            config,
            parameters,
            state,
            steps: 0,
        })
    }
}

impl Optimizer for AdamW {
    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn step(&mut self) -> Result<(), PretrainError> {
        self.steps += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.steps as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.steps as i32);
        let step_size = lr * bias_correction2.sqrt() / bias_correction1;

        let parameters = &self.parameters;
        let states = &mut self.state;
        tch::no_grad(|| {
            for (parameter, state) in parameters.iter().zip(states.iter_mut()) {
                let grad = parameter.tensor.grad();
                if !grad.defined() {
                    continue;
                }
                let grad = grad.to_kind(Kind::Float);
                let previous = state.take().unwrap_or_else(|| ParamState {
                    exp_avg: grad.zeros_like(),
                    exp_avg_sq: grad.zeros_like(),
                });
                let exp_avg = previous.exp_avg * beta1 + &grad * (1.0 - beta1);
                let exp_avg_sq = previous.exp_avg_sq * beta2 + &grad * &grad * (1.0 - beta2);
                let denominator = exp_avg_sq.sqrt() + eps;

                let mut new_param = parameter.tensor.to_kind(Kind::Float)
                    - (&exp_avg / denominator) * step_size;
                if parameter.weight_decay > 0.0 {
                    new_param = &new_param - &new_param * (lr * parameter.weight_decay);
                }
                let mut target = parameter.tensor.shallow_clone();
                target.copy_(&new_param.to_kind(parameter.tensor.kind()));
                *state = Some(ParamState {
                    exp_avg,
                    exp_avg_sq,
                });
            }
        });
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.config.lr = learning_rate;
    }

    fn step_count(&self) -> i64 {
        self.steps
    }

    fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = vec![("step".to_string(), Tensor::of_slice(&[self.steps]))];
        for (parameter, state) in self.parameters.iter().zip(self.state.iter()) {
            if let Some(state) = state {
                tensors.push((
                    format!("{}.exp_avg", parameter.name),
                    state.exp_avg.shallow_clone(),
                ));
                tensors.push((
                    format!("{}.exp_avg_sq", parameter.name),
                    state.exp_avg_sq.shallow_clone(),
                ));
            }
        }
        tensors
    }

    fn load_state_tensors(&mut self, tensors: Vec<(String, Tensor)>) -> Result<(), PretrainError> {
        let mut tensors = index_state(tensors);
        self.steps = tensors
            .remove("step")
            .ok_or_else(|| missing_state("step"))?
            .int64_value(&[0]);
        for (parameter, state) in self.parameters.iter().zip(self.state.iter_mut()) {
            let device = parameter.tensor.device();
            let exp_avg = tensors.remove(&format!("{}.exp_avg", parameter.name));
            let exp_avg_sq = tensors.remove(&format!("{}.exp_avg_sq", parameter.name));
            *state = match (exp_avg, exp_avg_sq) {
                (Some(exp_avg), Some(exp_avg_sq)) => Some(ParamState {
                    exp_avg: exp_avg.to_device(device),
                    exp_avg_sq: exp_avg_sq.to_device(device),
                }),
                (None, None) => None,
                _ => {
                    return Err(missing_state(&format!(
                        "{}.exp_avg / {}.exp_avg_sq",
                        parameter.name, parameter.name
                    )))
                }
            };
        }
        Ok(())
    }
}
