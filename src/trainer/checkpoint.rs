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
use crate::optimizer::Optimizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tch::{nn, Tensor};

/// # Progress of a training run
/// Saved next to the model and optimizer state of every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epoch the checkpoint was taken in (the number of epochs for the final checkpoint)
    pub epoch: usize,
    /// Number of micro-batches processed since the start of training
    pub train_step: usize,
    /// Loss of every micro-batch, keyed by the global step it was processed at (0-based)
    #[serde(default)]
    pub losses: BTreeMap<usize, f64>,
}

impl TrainingState {
    /// Number of batches of the resumed epoch that were already processed
    pub fn steps_to_skip(&self, batches_per_epoch: usize) -> usize {
        self.train_step
            .saturating_sub(self.epoch.saturating_mul(batches_per_epoch))
    }
}

/// # Checkpoint files of a named model
/// - `{dir}/{name}.ot`: model variables
/// - `{dir}/{name}_optimizer.ot`: optimizer state
/// - `{dir}/{name}_state.json`: `TrainingState`
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    name: String,
}

impl Checkpoint {
    pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Checkpoint {
        Checkpoint {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(format!("{}.ot", self.name))
    }

    pub fn optimizer_path(&self) -> PathBuf {
        self.dir.join(format!("{}_optimizer.ot", self.name))
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{}_state.json", self.name))
    }

    pub fn exists(&self) -> bool {
        self.model_path().is_file() && self.state_path().is_file()
    }

    pub fn save(
        &self,
        var_store: &nn::VarStore,
        optimizer: &dyn Optimizer,
        state: &TrainingState,
    ) -> Result<(), PretrainError> {
        fs::create_dir_all(&self.dir)?;
        var_store.save(self.model_path())?;
        Tensor::save_multi(&optimizer.state_tensors(), self.optimizer_path())?;
        let writer = BufWriter::new(File::create(self.state_path())?);
        serde_json::to_writer_pretty(writer, state)?;
        Ok(())
    }

    /// Restores the model variables and optimizer state.
    /// Returns `None` if no checkpoint was saved under this name.
    pub fn load(
        &self,
        var_store: &mut nn::VarStore,
        optimizer: &mut dyn Optimizer,
    ) -> Result<Option<TrainingState>, PretrainError> {
        if !self.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(self.state_path())?);
        let state: TrainingState = serde_json::from_reader(reader)?;
        var_store.load(self.model_path())?;
        if self.optimizer_path().is_file() {
            optimizer.load_state_tensors(Tensor::load_multi(self.optimizer_path())?)?;
        }
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_counts_batches_of_resumed_epoch() {
        let state = TrainingState {
            epoch: 2,
            train_step: 23,
            losses: BTreeMap::new(),
        };
        assert_eq!(state.steps_to_skip(10), 3);
        assert_eq!(state.steps_to_skip(12), 0);
        assert_eq!(TrainingState::default().steps_to_skip(10), 0);
    }

    #[test]
    fn state_serializes_loss_history() {
        let mut losses = BTreeMap::new();
        losses.insert(1, 2.5);
        losses.insert(2, 2.25);
        let state = TrainingState {
            epoch: 0,
            train_step: 2,
            losses,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"losses\":{\"1\":2.5,\"2\":2.25}"));
        let restored: TrainingState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
