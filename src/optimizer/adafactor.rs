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
use crate::optimizer::{index_state, missing_state, rms, Optimizer, Parameter};
use tch::{Kind, Tensor};

/// # Adafactor configuration
/// Defaults reproduce the relative-step variant of Adafactor (Shazeer & Stern, 2018):
/// the learning rate is `min(1e-2, 1/sqrt(t))` scaled by the parameter RMS.
#[derive(Debug, Clone)]
pub struct AdafactorConfig {
    /// External learning rate, only valid when `relative_step` is false
    pub lr: Option<f64>,
    /// Regularization constants for the squared gradient and the parameter scale
    pub eps: (f64, f64),
    /// Threshold of the root mean square of the final update
    pub clip_threshold: f64,
    /// Coefficient used to compute the running average of the squared gradient
    pub decay_rate: f64,
    /// Coefficient of the running average of the gradient, disables the first moment if `None`
    pub beta1: Option<f64>,
    pub weight_decay: f64,
    /// Scale the learning rate by the root mean square of the parameter
    pub scale_parameter: bool,
    /// Compute a time-dependent learning rate instead of using `lr`
    pub relative_step: bool,
    /// Time-dependent learning rate warm-up
    pub warmup_init: bool,
}

impl Default for AdafactorConfig {
    fn default() -> Self {
        AdafactorConfig {
            lr: None,
            eps: (1e-30, 1e-3),
            clip_threshold: 1.0,
            decay_rate: -0.8,
            beta1: None,
            weight_decay: 0.0,
            scale_parameter: true,
            relative_step: true,
            warmup_init: false,
        }
    }
}

impl AdafactorConfig {
    fn validate(&self) -> Result<(), PretrainError> {
        if self.lr.is_some() && self.relative_step {
            return Err(PretrainError::InvalidConfigurationError(
                "cannot combine a manual learning rate with relative_step".to_string(),
            ));
        }
        if self.warmup_init && !self.relative_step {
            return Err(PretrainError::InvalidConfigurationError(
                "warmup_init requires relative_step".to_string(),
            ));
        }
        if !self.relative_step && self.lr.is_none() {
            return Err(PretrainError::InvalidConfigurationError(
                "a learning rate is required when relative_step is disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn step_size(&self, step: i64, parameter_rms: f64) -> f64 {
        let mut learning_rate = self.lr.unwrap_or(0.0);
        if self.relative_step {
            let min_step = if self.warmup_init {
                1e-6 * step as f64
            } else {
                1e-2
            };
            learning_rate = min_step.min(1.0 / (step as f64).sqrt());
        }
        let parameter_scale = if self.scale_parameter {
            self.eps.1.max(parameter_rms)
        } else {
            1.0
        };
        parameter_scale * learning_rate
    }
}

#[derive(Default)]
struct ParamState {
    step: i64,
    exp_avg: Option<Tensor>,
    exp_avg_sq: Option<Tensor>,
    exp_avg_sq_row: Option<Tensor>,
    exp_avg_sq_col: Option<Tensor>,
}

/// # Adafactor optimizer
/// Second moments of parameters of rank 2 or more are factored into row and column
/// statistics, other parameters keep a full second-moment estimate.
pub struct Adafactor {
    config: AdafactorConfig,
    parameters: Vec<Parameter>,
    state: Vec<ParamState>,
    steps: i64,
    last_lr: f64,
}

fn approx_sq_grad(exp_avg_sq_row: &Tensor, exp_avg_sq_col: &Tensor) -> Tensor {
    let r_factor = (exp_avg_sq_row / exp_avg_sq_row.mean_dim(&[-1], true, Kind::Float))
        .rsqrt()
        .unsqueeze(-1);
    let c_factor = exp_avg_sq_col.unsqueeze(-2).rsqrt();
    r_factor * c_factor
}

impl Adafactor {
    pub fn new(
        parameters: Vec<Parameter>,
        config: AdafactorConfig,
    ) -> Result<Adafactor, PretrainError> {
        config.validate()?;
        let state = parameters.iter().map(|_| ParamState::default()).collect();
        let last_lr = config.lr.unwrap_or(0.0);
        Ok(Adafactor {
            config,
            parameters,
            state,
            steps: 0,
            last_lr,
        })
    }

    pub fn config(&self) -> &AdafactorConfig {
        &self.config
    }

    fn update_parameter(
        config: &AdafactorConfig,
        parameter: &Parameter,
        state: &mut ParamState,
    ) -> Option<f64> {
        let grad = parameter.tensor.grad();
        if !grad.defined() {
            return None;
        }
        let grad = grad.to_kind(Kind::Float);
        let param = parameter.tensor.to_kind(Kind::Float);
        let shape = grad.size();
        let factored = shape.len() >= 2;

        state.step += 1;
        let learning_rate = config.step_size(state.step, rms(&param));
        let beta2t = 1.0 - (state.step as f64).powf(config.decay_rate);
        let squared_grad = &grad * &grad + config.eps.0;

        let update = if factored {
            let row_shape = &shape[..shape.len() - 1];
            let mut col_shape = shape[..shape.len() - 2].to_vec();
            col_shape.push(shape[shape.len() - 1]);

            let row = state
                .exp_avg_sq_row
                .take()
                .unwrap_or_else(|| Tensor::zeros(row_shape, (Kind::Float, grad.device())));
            let col = state
                .exp_avg_sq_col
                .take()
                .unwrap_or_else(|| Tensor::zeros(&col_shape, (Kind::Float, grad.device())));
            let row = row * beta2t
                + squared_grad.mean_dim(&[-1], false, Kind::Float) * (1.0 - beta2t);
            let col = col * beta2t
                + squared_grad.mean_dim(&[-2], false, Kind::Float) * (1.0 - beta2t);
            let update = approx_sq_grad(&row, &col) * &grad;
            state.exp_avg_sq_row = Some(row);
            state.exp_avg_sq_col = Some(col);
            update
        } else {
            let exp_avg_sq = state
                .exp_avg_sq
                .take()
                .unwrap_or_else(|| grad.zeros_like());
            let exp_avg_sq = exp_avg_sq * beta2t + squared_grad * (1.0 - beta2t);
            let update = exp_avg_sq.rsqrt() * &grad;
            state.exp_avg_sq = Some(exp_avg_sq);
            update
        };

        let clip_divisor = (rms(&update) / config.clip_threshold).max(1.0);
        let mut update = update * (learning_rate / clip_divisor);

        if let Some(beta1) = config.beta1 {
            let exp_avg = state
                .exp_avg
                .take()
                .unwrap_or_else(|| grad.zeros_like());
            let exp_avg = exp_avg * beta1 + update * (1.0 - beta1);
            update = exp_avg.shallow_clone();
            state.exp_avg = Some(exp_avg);
        }

        let mut new_param = param;
        if config.weight_decay != 0.0 {
            new_param = &new_param - &new_param * (config.weight_decay * learning_rate);
        }
        new_param = new_param - update;

        let mut target = parameter.tensor.shallow_clone();
        target.copy_(&new_param.to_kind(parameter.tensor.kind()));
        Some(learning_rate)
    }
}

impl Optimizer for Adafactor {
    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn step(&mut self) -> Result<(), PretrainError> {
        let config = &self.config;
        let parameters = &self.parameters;
        let states = &mut self.state;
        let mut last_lr = None;
        tch::no_grad(|| {
            for (parameter, state) in parameters.iter().zip(states.iter_mut()) {
                if let Some(learning_rate) = Adafactor::update_parameter(config, parameter, state)
                {
                    last_lr = Some(learning_rate);
                }
            }
        });
        if let Some(learning_rate) = last_lr {
            self.last_lr = learning_rate;
        }
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.last_lr
    }

    /// Overrides the external learning rate. Ignored with relative step sizes.
    fn set_learning_rate(&mut self, learning_rate: f64) {
        if !self.config.relative_step {
            self.config.lr = Some(learning_rate);
            self.last_lr = learning_rate;
        }
    }

    fn step_count(&self) -> i64 {
        self.steps
    }

    fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = vec![("step".to_string(), Tensor::of_slice(&[self.steps]))];
        for (parameter, state) in self.parameters.iter().zip(self.state.iter()) {
            if state.step == 0 {
                continue;
            }
            let name = &parameter.name;
            tensors.push((format!("{}.step", name), Tensor::of_slice(&[state.step])));
            let moments = [
                ("exp_avg", &state.exp_avg),
                ("exp_avg_sq", &state.exp_avg_sq),
                ("exp_avg_sq_row", &state.exp_avg_sq_row),
                ("exp_avg_sq_col", &state.exp_avg_sq_col),
            ];
            for (moment_name, moment) in moments.iter() {
                if let Some(moment) = moment {
                    tensors.push((format!("{}.{}", name, moment_name), moment.shallow_clone()));
                }
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
            let name = &parameter.name;
            let mut moment = |moment_name: &str| {
                tensors
                    .remove(&format!("{}.{}", name, moment_name))
                    .map(|tensor| tensor.to_device(device))
            };
            *state = ParamState {
                step: moment("step").map_or(0, |step| step.int64_value(&[0])),
                exp_avg: moment("exp_avg"),
                exp_avg_sq: moment("exp_avg_sq"),
                exp_avg_sq_row: moment("exp_avg_sq_row"),
                exp_avg_sq_col: moment("exp_avg_sq_col"),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::parameters_with_weight_decay;
    use tch::{nn, Device};

    #[test]
    fn relative_step_size() {
        let config = AdafactorConfig::default();
        // min(1e-2, 1/sqrt(t)) for t >= 10_000 becomes 1/sqrt(t)
        assert!((config.step_size(1, 0.0) - 1e-3 * 1e-2).abs() < 1e-12);
        assert!((config.step_size(40_000, 2.0) - 2.0 / 200.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let with_lr = AdafactorConfig {
            lr: Some(1e-3),
            ..Default::default()
        };
        assert!(Adafactor::new(vec![], with_lr).is_err());
        let warmup_without_relative = AdafactorConfig {
            lr: Some(1e-3),
            relative_step: false,
            warmup_init: true,
            ..Default::default()
        };
        assert!(Adafactor::new(vec![], warmup_without_relative).is_err());
    }

    #[test]
    fn factored_state_for_matrices() {
        let vs = nn::VarStore::new(Device::Cpu);
        let linear = nn::linear(&vs.root() / "dense", 3, 2, Default::default());
        let mut optimizer = Adafactor::new(
            parameters_with_weight_decay(&vs, 0.0, &[]),
            AdafactorConfig::default(),
        )
        .unwrap();

        let loss = Tensor::ones(&[1, 3], (Kind::Float, Device::Cpu))
            .apply(&linear)
            .sum(Kind::Float);
        loss.backward();
        optimizer.step().unwrap();

        let names = optimizer
            .state_tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<String>>();
        assert!(names.contains(&"dense.weight.exp_avg_sq_row".to_string()));
        assert!(names.contains(&"dense.weight.exp_avg_sq_col".to_string()));
        assert!(names.contains(&"dense.bias.exp_avg_sq".to_string()));
        assert!(!names.contains(&"dense.bias.exp_avg".to_string()));
        assert_eq!(optimizer.step_count(), 1);
    }
}
