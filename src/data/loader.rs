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
use crate::data::dataset::{Dataset, Example};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tch::{Device, Tensor};

/// # Collated mini-batch
/// `input_ids` has shape (*batch size*, *sequence_length*). `labels`, if present, has the same shape.
#[derive(Debug)]
pub struct Batch {
    pub input_ids: Tensor,
    pub labels: Option<Tensor>,
}

fn stack_rows(rows: &[Vec<i64>]) -> Result<Tensor, PretrainError> {
    let sequence_length = rows.first().map_or(0, |row| row.len());
    if rows.iter().any(|row| row.len() != sequence_length) {
        return Err(PretrainError::DataError(
            "all sequences of a batch must have the same length".to_string(),
        ));
    }
    let flat = rows.concat();
    Ok(Tensor::of_slice(&flat).view((rows.len() as i64, sequence_length as i64)))
}

impl Batch {
    /// Stacks examples of the same variant into a batch.
    pub fn collate(examples: Vec<Example>) -> Result<Batch, PretrainError> {
        if examples.is_empty() {
            return Err(PretrainError::DataError(
                "cannot collate an empty batch".to_string(),
            ));
        }
        let mut inputs = Vec::with_capacity(examples.len());
        let mut labels = Vec::with_capacity(examples.len());
        for example in examples {
            match example {
                Example::Sequence(input) => inputs.push(input),
                Example::Pair { input, label } => {
                    inputs.push(input);
                    labels.push(label);
                }
            }
        }
        let labels = match labels.len() {
            0 => None,
            n if n == inputs.len() => Some(stack_rows(&labels)?),
            _ => {
                return Err(PretrainError::DataError(
                    "a batch cannot mix labelled and unlabelled examples".to_string(),
                ))
            }
        };
        Ok(Batch {
            input_ids: stack_rows(&inputs)?,
            labels,
        })
    }

    pub fn batch_size(&self) -> i64 {
        self.input_ids.size()[0]
    }

    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            input_ids: self.input_ids.to_device(device),
            labels: self.labels.as_ref().map(|labels| labels.to_device(device)),
        }
    }

    /// Splits the batch along the batch dimension in at most `chunks` parts.
    /// Fewer parts are returned when the batch holds fewer rows than requested.
    pub fn split(&self, chunks: usize) -> Vec<Batch> {
        let chunks = (chunks as i64).min(self.batch_size()).max(1);
        let input_chunks = self.input_ids.chunk(chunks, 0);
        let label_chunks = self.labels.as_ref().map(|labels| labels.chunk(chunks, 0));
        input_chunks
            .into_iter()
            .enumerate()
            .map(|(index, input_ids)| Batch {
                input_ids,
                labels: label_chunks
                    .as_ref()
                    .map(|labels| labels[index].shallow_clone()),
            })
            .collect()
    }

    pub fn shallow_clone(&self) -> Batch {
        Batch {
            input_ids: self.input_ids.shallow_clone(),
            labels: self.labels.as_ref().map(Tensor::shallow_clone),
        }
    }
}

/// Splits `len` dataset indices into `(train, eval)` subsets.
///
/// `eval_len = floor(len * eval_ratio)`, the assignment follows a permutation seeded by `seed`.
pub fn random_split(
    len: usize,
    eval_ratio: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), PretrainError> {
    if !(0.0..1.0).contains(&eval_ratio) {
        return Err(PretrainError::InvalidConfigurationError(format!(
            "train/test split ratio must be in [0, 1), got {}",
            eval_ratio
        )));
    }
    let eval_len = (len as f64 * eval_ratio).floor() as usize;
    let train_len = len - eval_len;
    let mut indices = (0..len).collect::<Vec<usize>>();
    indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let eval_indices = indices.split_off(train_len);
    Ok((indices, eval_indices))
}

/// # Mini-batch loader over a subset of a dataset
/// Shuffled loaders draw a new permutation per epoch from a stream seeded by `(seed, epoch)`,
/// so that a run resumed mid-epoch sees the same order.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        indices: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<DataLoader, PretrainError> {
        if batch_size == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "batch size must be strictly positive".to_string(),
            ));
        }
        if let Some(index) = indices.iter().find(|&&index| index >= dataset.len()) {
            return Err(PretrainError::DataError(format!(
                "index {} is out of bounds, the dataset has {} samples",
                index,
                dataset.len()
            )));
        }
        Ok(DataLoader {
            dataset,
            indices,
            batch_size,
            shuffle,
            seed,
        })
    }

    /// Loader over the whole dataset
    pub fn full(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<DataLoader, PretrainError> {
        let indices = (0..dataset.len()).collect();
        DataLoader::new(dataset, indices, batch_size, shuffle, seed)
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    /// Order in which the subset indices are visited during `epoch`
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.indices.clone();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            rng.set_stream(epoch as u64);
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn iter(&self, epoch: usize) -> BatchIter<'_> {
        self.iter_from(epoch, 0)
    }

    /// Iterates over the batches of `epoch`, starting at batch `first_batch`.
    /// Skipped batches are not loaded.
    pub fn iter_from(&self, epoch: usize, first_batch: usize) -> BatchIter<'_> {
        let order = self.epoch_order(epoch);
        let position = first_batch.saturating_mul(self.batch_size).min(order.len());
        BatchIter {
            loader: self,
            order,
            position,
        }
    }
}

pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    position: usize,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<Batch, PretrainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let examples = self.order[self.position..end]
            .iter()
            .map(|&index| self.loader.dataset.get(index))
            .collect::<Result<Vec<Example>, PretrainError>>();
        self.position = end;
        Some(examples.and_then(Batch::collate))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining_samples = self.order.len() - self.position;
        let remaining = (remaining_samples + self.loader.batch_size - 1) / self.loader.batch_size;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for BatchIter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::ElectraDataset;
    use std::collections::HashSet;

    fn toy_dataset(len: usize) -> Arc<dyn Dataset> {
        Arc::new(ElectraDataset::from_sequences(
            (0..len as i64).map(|i| vec![i, i + 1, i + 2]).collect(),
        ))
    }

    #[test]
    fn split_sizes_follow_ratio() {
        let (train, eval) = random_split(105, 0.1, 9).unwrap();
        assert_eq!(eval.len(), 10);
        assert_eq!(train.len(), 95);
        let all = train.iter().chain(eval.iter()).collect::<HashSet<_>>();
        assert_eq!(all.len(), 105);
    }

    #[test]
    fn split_rejects_invalid_ratio() {
        assert!(random_split(10, 1.0, 0).is_err());
        assert!(random_split(10, -0.1, 0).is_err());
    }

    #[test]
    fn loader_counts_partial_batches() {
        let loader = DataLoader::full(toy_dataset(10), 4, false, 0).unwrap();
        assert_eq!(loader.len(), 3);
        let sizes = loader
            .iter(0)
            .map(|batch| batch.unwrap().batch_size())
            .collect::<Vec<i64>>();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn shuffled_order_depends_on_epoch_only() {
        let loader = DataLoader::full(toy_dataset(32), 4, true, 3).unwrap();
        assert_eq!(loader.epoch_order(1), loader.epoch_order(1));
        assert_ne!(loader.epoch_order(0), loader.epoch_order(1));
        let unshuffled = DataLoader::full(toy_dataset(32), 4, false, 3).unwrap();
        assert_eq!(unshuffled.epoch_order(5), (0..32).collect::<Vec<usize>>());
    }

    #[test]
    fn resumed_iteration_skips_leading_batches() {
        let loader = DataLoader::full(toy_dataset(10), 4, true, 1).unwrap();
        let full = loader
            .iter(2)
            .map(|batch| batch.unwrap().input_ids.int64_value(&[0, 0]))
            .collect::<Vec<i64>>();
        let resumed = loader.iter_from(2, 1);
        assert_eq!(resumed.len(), 2);
        let resumed = resumed
            .map(|batch| batch.unwrap().input_ids.int64_value(&[0, 0]))
            .collect::<Vec<i64>>();
        assert_eq!(resumed, full[1..].to_vec());
        assert_eq!(loader.iter_from(0, 7).len(), 0);
    }

    #[test]
    fn batch_split_keeps_rows() {
        let loader = DataLoader::full(toy_dataset(5), 5, false, 0).unwrap();
        let batch = loader.iter(0).next().unwrap().unwrap();
        let parts = batch.split(2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].batch_size() + parts[1].batch_size(), 5);
        assert_eq!(batch.split(8).len(), 5);
    }
}
