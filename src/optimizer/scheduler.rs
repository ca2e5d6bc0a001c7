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

/// # Learning rate as a function of the optimization step
pub trait LearningRateScheduler: Send + Sync {
    /// Learning rate for the (1-based) optimization step `step`
    fn get_lr(&self, step: usize) -> f64;
}

/// # Linear warmup followed by linear decay to 0
/// `lr(t) = base_lr * max(0, 1 - t / total_steps) * min(1, t / warmup_steps)`.
/// A warmup of 0 steps starts directly at `base_lr`.
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmupDecay {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearWarmupDecay {
    pub fn new(
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Result<LinearWarmupDecay, PretrainError> {
        if total_steps == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "the schedule needs at least one optimization step".to_string(),
            ));
        }
        if warmup_steps > total_steps {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "warmup steps ({}) exceed the total number of steps ({})",
                warmup_steps, total_steps
            )));
        }
        Ok(LinearWarmupDecay {
            base_lr,
            warmup_steps,
            total_steps,
        })
    }

    /// Builds the schedule with `warmup_ratio * total_steps` warmup steps (rounded down).
    pub fn with_warmup_ratio(
        base_lr: f64,
        warmup_ratio: f64,
        total_steps: usize,
    ) -> Result<LinearWarmupDecay, PretrainError> {
        if !(0.0..=1.0).contains(&warmup_ratio) {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "warmup ratio must be in [0, 1], got {}",
                warmup_ratio
            )));
        }
        let warmup_steps = (total_steps as f64 * warmup_ratio) as usize;
        LinearWarmupDecay::new(base_lr, warmup_steps, total_steps)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn factor(&self, step: usize) -> f64 {
        let step = step as f64;
        let decay = (1.0 - step / self.total_steps as f64).max(0.0);
        let warmup = if self.warmup_steps == 0 {
            1.0
        } else {
            (step / self.warmup_steps as f64).min(1.0)
        };
        decay * warmup
    }
}

impl LearningRateScheduler for LinearWarmupDecay {
    fn get_lr(&self, step: usize) -> f64 {
        self.base_lr * self.factor(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_then_decay() {
        let schedule = LinearWarmupDecay::new(1.0, 10, 100).unwrap();
        assert!((schedule.get_lr(5) - 0.5 * 0.95).abs() < 1e-12);
        assert!((schedule.get_lr(10) - 0.9).abs() < 1e-12);
        assert!((schedule.get_lr(55) - 0.45).abs() < 1e-12);
        assert_eq!(schedule.get_lr(100), 0.0);
        assert_eq!(schedule.get_lr(150), 0.0);
    }

    #[test]
    fn no_warmup_starts_at_base_rate() {
        let schedule = LinearWarmupDecay::new(2e-4, 0, 4).unwrap();
        assert!((schedule.get_lr(1) - 1.5e-4).abs() < 1e-12);
        assert!(schedule.get_lr(0) > 0.0);
    }

    #[test]
    fn warmup_ratio() {
        let schedule = LinearWarmupDecay::with_warmup_ratio(1.0, 0.1, 35).unwrap();
        assert_eq!(schedule.warmup_steps(), 3);
        assert!(LinearWarmupDecay::new(1.0, 5, 0).is_err());
        assert!(LinearWarmupDecay::with_warmup_ratio(1.0, 1.5, 10).is_err());
    }
}
