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

//! # Pretraining datasets and batch loading
//!
//! Datasets are built from plain `.txt` corpora with a BERT WordPiece tokenizer and
//! served as fixed-length examples. `DataLoader`s batch a subset of a dataset, optionally
//! shuffled with a per-epoch seeded permutation.

mod dataset;
mod loader;

pub use dataset::{
    corpus_files, Dataset, DatasetForAutoRegressive, ElectraDataset, Example, SpecialTokens,
    IGNORE_INDEX,
};
pub use loader::{random_split, Batch, BatchIter, DataLoader};
