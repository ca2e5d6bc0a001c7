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
use rust_tokenizers::tokenizer::{Tokenizer, TruncationStrategy};
use rust_tokenizers::vocab::{BertVocab, Vocab};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Label value ignored by the language modelling losses.
pub const IGNORE_INDEX: i64 = -100;

/// # Single training example
#[derive(Debug, Clone, PartialEq)]
pub enum Example {
    /// Token sequence used both as input and as the source of the training signal (ELECTRA)
    Sequence(Vec<i64>),
    /// Input tokens with aligned next-token labels (causal language modelling)
    Pair { input: Vec<i64>, label: Vec<i64> },
}

/// # Indexable collection of fixed-length examples
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Example, PretrainError>;
}

/// # Special token ids of a BERT vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: i64,
    pub mask: i64,
    pub cls: i64,
    pub sep: i64,
    pub unk: i64,
}

impl SpecialTokens {
    pub fn from_vocab(vocab: &BertVocab) -> SpecialTokens {
        SpecialTokens {
            pad: vocab.token_to_id(BertVocab::pad_value()),
            mask: vocab.token_to_id(BertVocab::mask_value()),
            cls: vocab.token_to_id(BertVocab::cls_value()),
            sep: vocab.token_to_id(BertVocab::sep_value()),
            unk: vocab.token_to_id(BertVocab::unknown_value()),
        }
    }

    /// Ids that must never be selected for masking.
    pub fn all_special_ids(&self) -> Vec<i64> {
        vec![self.pad, self.mask, self.cls, self.sep, self.unk]
    }
}

/// Lists the `.txt` corpus files under `path` (or `path` itself if it is a file), sorted by name.
pub fn corpus_files(path: &Path) -> Result<Vec<PathBuf>, PretrainError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let entries = fs::read_dir(path).map_err(|e| {
        PretrainError::DataError(format!(
            "couldn't load training data from {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut files = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|file| file.is_file() && file.extension().map_or(false, |ext| ext == "txt"))
        .collect::<Vec<PathBuf>>();
    files.sort();
    if files.is_empty() {
        return Err(PretrainError::DataError(format!(
            "no .txt training files in {}",
            path.display()
        )));
    }
    Ok(files)
}

fn read_documents(file: &Path) -> Result<Vec<String>, PretrainError> {
    Ok(fs::read_to_string(file)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// # Causal language modelling dataset
/// The corpus is tokenized into one token stream per file (documents separated by `[SEP]`),
/// cut into blocks of `max_len + 1` tokens. Inputs are the first `max_len` tokens of a block,
/// labels the last `max_len` (shifted by one). The trailing partial block of a file is padded,
/// padded label positions are set to `IGNORE_INDEX`.
pub struct DatasetForAutoRegressive {
    blocks: Vec<Vec<i64>>,
    max_len: usize,
    pad_token_id: i64,
}

impl DatasetForAutoRegressive {
    pub fn from_directory<T, P>(
        tokenizer: &T,
        max_len: usize,
        dir_path: P,
    ) -> Result<DatasetForAutoRegressive, PretrainError>
    where
        T: Tokenizer<BertVocab>,
        P: AsRef<Path>,
    {
        let special_tokens = SpecialTokens::from_vocab(tokenizer.vocab());
        let files = corpus_files(dir_path.as_ref())?;

        let mut streams = Vec::with_capacity(files.len());
        for file in &files {
            let mut stream = vec![];
            for document in read_documents(file)? {
                let tokens = tokenizer.tokenize(&document);
                stream.extend(tokenizer.convert_tokens_to_ids(tokens.as_slice()));
                stream.push(special_tokens.sep);
            }
            streams.push(stream);
        }
        let dataset = DatasetForAutoRegressive::from_token_streams(
            streams,
            max_len,
            special_tokens.pad,
        )?;
        info!(
            "Loaded {} blocks of {} tokens from {} file(s) in {}",
            dataset.len(),
            max_len + 1,
            files.len(),
            dir_path.as_ref().display()
        );
        Ok(dataset)
    }

    /// Builds the dataset from already tokenized streams.
    pub fn from_token_streams(
        streams: Vec<Vec<i64>>,
        max_len: usize,
        pad_token_id: i64,
    ) -> Result<DatasetForAutoRegressive, PretrainError> {
        if max_len == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "max_len must be strictly positive".to_string(),
            ));
        }
        let block_len = max_len + 1;
        let mut blocks = vec![];
        for stream in streams {
            // a block needs at least one (input, label) pair
            for chunk in stream.chunks(block_len).filter(|chunk| chunk.len() > 1) {
                let mut block = chunk.to_vec();
                block.resize(block_len, pad_token_id);
                blocks.push(block);
            }
        }
        if blocks.is_empty() {
            return Err(PretrainError::DataError(
                "the corpus does not contain any trainable token block".to_string(),
            ));
        }
        Ok(DatasetForAutoRegressive {
            blocks,
            max_len,
            pad_token_id,
        })
    }
}

impl Dataset for DatasetForAutoRegressive {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn get(&self, index: usize) -> Result<Example, PretrainError> {
        let block = self.blocks.get(index).ok_or_else(|| {
            PretrainError::DataError(format!(
                "index {} is out of bounds, the dataset has {} samples",
                index,
                self.blocks.len()
            ))
        })?;
        let input = block[..self.max_len].to_vec();
        let label = block[1..]
            .iter()
            .map(|&token| {
                if token == self.pad_token_id {
                    IGNORE_INDEX
                } else {
                    token
                }
            })
            .collect();
        Ok(Example::Pair { input, label })
    }
}

/// # ELECTRA pretraining dataset
/// One example per non-empty line, encoded as `[CLS] tokens [SEP]`, truncated and padded to `max_len`.
pub struct ElectraDataset {
    sequences: Vec<Vec<i64>>,
}

impl ElectraDataset {
    pub fn from_path<T, P>(
        tokenizer: &T,
        max_len: usize,
        data_path: P,
    ) -> Result<ElectraDataset, PretrainError>
    where
        T: Tokenizer<BertVocab>,
        P: AsRef<Path>,
    {
        if max_len < 3 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "max_len must leave room for [CLS] and [SEP] (got {})",
                max_len
            )));
        }
        let pad_token_id = SpecialTokens::from_vocab(tokenizer.vocab()).pad;
        let files = corpus_files(data_path.as_ref())?;

        let mut sequences = vec![];
        for file in &files {
            for document in read_documents(file)? {
                let mut token_ids = tokenizer
                    .encode(
                        &document,
                        None,
                        max_len,
                        &TruncationStrategy::LongestFirst,
                        0,
                    )
                    .token_ids;
                token_ids.resize(max_len, pad_token_id);
                sequences.push(token_ids);
            }
        }
        if sequences.is_empty() {
            return Err(PretrainError::DataError(format!(
                "no documents found in {}",
                data_path.as_ref().display()
            )));
        }
        info!(
            "Loaded {} sequences of {} tokens from {} file(s)",
            sequences.len(),
            max_len,
            files.len()
        );
        Ok(ElectraDataset { sequences })
    }

    pub fn from_sequences(sequences: Vec<Vec<i64>>) -> ElectraDataset {
        ElectraDataset { sequences }
    }
}

impl Dataset for ElectraDataset {
    fn len(&self) -> usize {
        self.sequences.len()
    }

    fn get(&self, index: usize) -> Result<Example, PretrainError> {
        self.sequences
            .get(index)
            .cloned()
            .map(Example::Sequence)
            .ok_or_else(|| {
                PretrainError::DataError(format!(
                    "index {} is out of bounds, the dataset has {} samples",
                    index,
                    self.sequences.len()
                ))
            })
    }
}
