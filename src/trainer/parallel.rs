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
use crate::data::Batch;
use crate::trainer::PretrainingModel;
use std::collections::HashMap;
use tch::{nn, Device, Tensor};

/// # Model copy hosted on one device
pub struct Replica<M> {
    pub var_store: nn::VarStore,
    pub model: M,
}

impl<M> Replica<M> {
    pub fn device(&self) -> Device {
        self.var_store.device()
    }
}

/// # Single-process data parallelism
/// Holds one replica of the model per device. Batches are split along the batch dimension and
/// dispatched to the replicas; gradients are summed into the first (primary) replica, which
/// is the one updated by the optimizer, and its parameters are copied back to the other replicas.
pub struct DataParallel<M> {
    replicas: Vec<Replica<M>>,
}

impl<M: PretrainingModel> DataParallel<M> {
    /// Builds one replica per device with `builder` and synchronizes them with the primary.
    ///
    /// # Arguments
    ///
    /// * `devices` - devices hosting the replicas, the first one holds the primary
    /// * `builder` - creates the model under the root path of a fresh `VarStore`
    pub fn new<F>(devices: &[Device], builder: F) -> Result<DataParallel<M>, PretrainError>
    where
        F: Fn(&nn::Path) -> Result<M, PretrainError>,
    {
        if devices.is_empty() {
            return Err(PretrainError::InvalidConfigurationError(
                "data parallelism requires at least one device".to_string(),
            ));
        }
        let mut replicas = Vec::with_capacity(devices.len());
        for &device in devices {
            let var_store = nn::VarStore::new(device);
            let model = builder(&var_store.root())?;
            replicas.push(Replica { var_store, model });
        }
        let mut data_parallel = DataParallel { replicas };
        data_parallel.broadcast_parameters();
        Ok(data_parallel)
    }

    pub fn primary_var_store(&self) -> &nn::VarStore {
        &self.replicas[0].var_store
    }

    pub fn primary_var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.replicas[0].var_store
    }

    pub fn devices(&self) -> Vec<Device> {
        self.replicas.iter().map(Replica::device).collect()
    }

    /// Runs forward and backward passes for `batch` on the replicas.
    ///
    /// Every chunk loss is weighted by the share of the batch it covers and by `scale` before
    /// the backward pass. Returns the unscaled batch loss.
    pub fn forward_backward(&self, batch: &Batch, scale: f64) -> Result<f64, PretrainError> {
        let total = batch.batch_size() as f64;
        let mut batch_loss = 0.0;
        for (replica, chunk) in self.replicas.iter().zip(batch.split(self.replicas.len())) {
            let chunk = chunk.to_device(replica.device());
            let weight = chunk.batch_size() as f64 / total;
            let loss = replica.model.forward_loss(&chunk, true)?;
            (&loss * (weight * scale)).backward();
            batch_loss += loss.double_value(&[]) * weight;
        }
        Ok(batch_loss)
    }

    /// Batch loss in evaluation mode, without gradient tracking.
    pub fn evaluate(&self, batch: &Batch) -> Result<f64, PretrainError> {
        let total = batch.batch_size() as f64;
        tch::no_grad(|| -> Result<f64, PretrainError> {
            let mut batch_loss = 0.0;
            for (replica, chunk) in self.replicas.iter().zip(batch.split(self.replicas.len())) {
                let chunk = chunk.to_device(replica.device());
                let weight = chunk.batch_size() as f64 / total;
                let loss = replica.model.forward_loss(&chunk, false)?;
                batch_loss += loss.double_value(&[]) * weight;
            }
            Ok(batch_loss)
        })
    }

    /// Adds the gradients of every replica to the gradients of the primary.
    pub fn reduce_gradients(&self) {
        let (primary, others) = match self.replicas.split_first() {
            Some(split) => split,
            None => return,
        };
        if others.is_empty() {
            return;
        }
        let primary_variables = primary.var_store.variables();
        tch::no_grad(|| {
            for replica in others {
                let variables = replica.var_store.variables();
                for (name, primary_variable) in primary_variables.iter() {
                    let mut primary_grad = primary_variable.grad();
                    let grad = match variables.get(name) {
                        Some(variable) => variable.grad(),
                        None => continue,
                    };
                    if primary_grad.defined() && grad.defined() {
                        let _ = primary_grad.g_add_(&grad.to_device(primary_grad.device()));
                    }
                }
            }
        });
    }

    /// Copies the parameters of the primary to the other replicas.
    pub fn broadcast_parameters(&mut self) {
        let (primary, others) = match self.replicas.split_first_mut() {
            Some(split) => split,
            None => return,
        };
        if others.is_empty() {
            return;
        }
        let primary_variables: HashMap<String, Tensor> = primary.var_store.variables();
        tch::no_grad(|| {
            for replica in others.iter_mut() {
                for (name, mut variable) in replica.var_store.variables() {
                    if let Some(source) = primary_variables.get(&name) {
                        variable.copy_(&source.to_device(variable.device()));
                    }
                }
            }
        });
    }

    /// Clears the gradients of all replicas.
    pub fn zero_grad(&mut self) {
        for replica in self.replicas.iter_mut() {
            for (_, variable) in replica.var_store.variables() {
                let mut grad = variable.grad();
                if grad.defined() {
                    let _ = grad.detach_();
                    let _ = grad.zero_();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Kind, Tensor};

    struct MeanModel {
        weight: Tensor,
    }

    impl PretrainingModel for MeanModel {
        fn forward_loss(&self, batch: &Batch, _train: bool) -> Result<Tensor, PretrainError> {
            Ok((batch.input_ids.to_kind(Kind::Float) * &self.weight).mean(Kind::Float))
        }
    }

    fn build(p: &nn::Path) -> Result<MeanModel, PretrainError> {
        Ok(MeanModel {
            weight: p.var("weight", &[1], nn::Init::Const(2.0)),
        })
    }

    fn batch() -> Batch {
        Batch {
            input_ids: Tensor::of_slice(&[1i64, 2, 3, 4, 5, 6]).view((3, 2)),
            labels: None,
        }
    }

    #[test]
    fn single_replica_matches_plain_loss() {
        let mut model = DataParallel::new(&[Device::Cpu], build).unwrap();
        let loss = model.forward_backward(&batch(), 1.0).unwrap();
        assert!((loss - 7.0).abs() < 1e-6);
        let variables = model.primary_var_store().variables();
        let weight = &variables["weight"];
        // d(mean(x * w)) / dw = mean(x)
        assert!((weight.grad().double_value(&[0]) - 3.5).abs() < 1e-6);
        model.zero_grad();
        assert_eq!(weight.grad().double_value(&[0]), 0.0);
    }

    #[test]
    fn replicas_weight_chunks_by_size() {
        let model = DataParallel::new(&[Device::Cpu, Device::Cpu], build).unwrap();
        let loss = model.forward_backward(&batch(), 0.5).unwrap();
        assert!((loss - 7.0).abs() < 1e-6);
        model.reduce_gradients();
        let variables = model.primary_var_store().variables();
        let weight = &variables["weight"];
        assert!((weight.grad().double_value(&[0]) - 1.75).abs() < 1e-6);
        assert!((model.evaluate(&batch()).unwrap() - 7.0).abs() < 1e-6);
    }

    #[test]
    fn broadcast_copies_primary_parameters() {
        let mut model = DataParallel::new(&[Device::Cpu, Device::Cpu], build).unwrap();
        tch::no_grad(|| {
            let mut weight = model.primary_var_store().variables()["weight"].shallow_clone();
            let _ = weight.fill_(5.0);
        });
        model.broadcast_parameters();
        let replica_variables = model.replicas[1].var_store.variables();
        assert_eq!(replica_variables["weight"].double_value(&[0]), 5.0);
    }
}
