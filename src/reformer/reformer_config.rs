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
use crate::data::SpecialTokens;
use rust_bert::reformer::ReformerConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// # Attention mechanism of a Reformer layer
pub enum AttentionKind {
    /// Chunked local self-attention
    local,
    /// Locality-sensitive hashing self-attention
    lsh,
}

fn default_dim() -> i64 {
    512
}

fn default_depth() -> i64 {
    6
}

fn default_heads() -> i64 {
    8
}

fn default_dim_head() -> i64 {
    64
}

fn default_ff_mult() -> i64 {
    4
}

fn default_bucket_size() -> i64 {
    64
}

fn default_num_hashes() -> i64 {
    4
}

fn default_attn_layers() -> Vec<AttentionKind> {
    vec![AttentionKind::local, AttentionKind::lsh]
}

fn default_dropout() -> f64 {
    0.05
}

/// # Reformer model size and attention layout
/// Read from the driver JSON configuration and turned into a rust-bert `ReformerConfig`
/// with `to_config`. `attn_layers` is repeated cyclically over the `depth` layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReformerHyperparameters {
    #[serde(default = "default_dim")]
    pub dim: i64,
    #[serde(default = "default_depth")]
    pub depth: i64,
    #[serde(default = "default_heads", alias = "n_head")]
    pub heads: i64,
    #[serde(default = "default_dim_head")]
    pub dim_head: i64,
    #[serde(default = "default_ff_mult")]
    pub ff_mult: i64,
    #[serde(default = "default_bucket_size")]
    pub bucket_size: i64,
    #[serde(default = "default_num_hashes")]
    pub num_hashes: i64,
    #[serde(default = "default_attn_layers")]
    pub attn_layers: Vec<AttentionKind>,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub attention_dropout_prob: f64,
    /// Factorization of the sequence length used by the axial position embeddings,
    /// `[bucket_size, max_seq_len / bucket_size]` if not set
    #[serde(default)]
    pub axial_position_shape: Option<Vec<i64>>,
}

impl Default for ReformerHyperparameters {
    fn default() -> Self {
        ReformerHyperparameters {
            dim: default_dim(),
            depth: default_depth(),
            heads: default_heads(),
            dim_head: default_dim_head(),
            ff_mult: default_ff_mult(),
            bucket_size: default_bucket_size(),
            num_hashes: default_num_hashes(),
            attn_layers: default_attn_layers(),
            hidden_dropout_prob: default_dropout(),
            attention_dropout_prob: default_dropout(),
            axial_position_shape: None,
        }
    }
}

fn invalid(message: String) -> PretrainError {
    PretrainError::InvalidConfigurationError(message)
}

impl ReformerHyperparameters {
    /// Checks the hyperparameters against the sequence length the model will be trained on.
    pub fn validate(&self, max_seq_len: i64) -> Result<(), PretrainError> {
        for (name, value) in &[
            ("dim", self.dim),
            ("depth", self.depth),
            ("heads", self.heads),
            ("dim_head", self.dim_head),
            ("ff_mult", self.ff_mult),
            ("bucket_size", self.bucket_size),
            ("num_hashes", self.num_hashes),
            ("max_seq_len", max_seq_len),
        ] {
            if *value <= 0 {
                return Err(invalid(format!(
                    "{} must be strictly positive, got {}",
                    name, value
                )));
            }
        }
        if self.dim < 2 {
            return Err(invalid(format!(
                "dim must be at least 2 to split the axial position embeddings, got {}",
                self.dim
            )));
        }
        if self.attn_layers.is_empty() {
            return Err(invalid("attn_layers cannot be empty".to_string()));
        }
        if max_seq_len % self.bucket_size != 0 {
            return Err(invalid(format!(
                "max_seq_len ({}) must be a multiple of bucket_size ({})",
                max_seq_len, self.bucket_size
            )));
        }
        let axial_shape = self.axial_shape(max_seq_len);
        if axial_shape.iter().product::<i64>() != max_seq_len {
            return Err(invalid(format!(
                "axial position shape {:?} does not multiply to max_seq_len ({})",
                axial_shape, max_seq_len
            )));
        }
        Ok(())
    }

    pub fn axial_shape(&self, max_seq_len: i64) -> Vec<i64> {
        match &self.axial_position_shape {
            Some(shape) => shape.clone(),
            None => vec![self.bucket_size, max_seq_len / self.bucket_size],
        }
    }

    /// Number of LSH buckets: two per chunk, at least 2 and always even.
    pub fn num_buckets(&self, max_seq_len: i64) -> i64 {
        let buckets = (2 * max_seq_len / self.bucket_size).max(2);
        buckets + buckets % 2
    }

    /// Attention kind of every layer
    pub fn layer_kinds(&self) -> Vec<AttentionKind> {
        self.attn_layers
            .iter()
            .cycle()
            .take(self.depth as usize)
            .copied()
            .collect()
    }

    /// Builds the rust-bert configuration.
    ///
    /// # Arguments
    ///
    /// * `vocab_size` - size of the tokenizer vocabulary
    /// * `max_seq_len` - training sequence length, also the number of position embeddings
    /// * `special_tokens` - special token ids of the vocabulary (padding and end of sequence)
    /// * `is_decoder` - causal attention (language model) or bidirectional (ELECTRA encoders)
    pub fn to_config(
        &self,
        vocab_size: i64,
        max_seq_len: i64,
        special_tokens: &SpecialTokens,
        is_decoder: bool,
    ) -> Result<ReformerConfig, PretrainError> {
        self.validate(max_seq_len)?;
        let first_embedding_dim = self.dim / 4;
        let axial_pos_embds_dim = vec![first_embedding_dim, self.dim - first_embedding_dim];
        let chunks_after = if is_decoder { 0 } else { 1 };

        let config = json!({
            "attention_head_size": self.dim_head,
            "attention_probs_dropout_prob": self.attention_dropout_prob,
            "attn_layers": self.layer_kinds(),
            "axial_norm_std": 1.0,
            "axial_pos_embds": true,
            "axial_pos_embds_dim": axial_pos_embds_dim,
            "axial_pos_shape": self.axial_shape(max_seq_len),
            "chunk_size_lm_head": 0,
            "chunk_size_feed_forward": null,
            "eos_token_id": special_tokens.sep,
            "pad_token_id": special_tokens.pad,
            "feed_forward_size": self.dim * self.ff_mult,
            "intermediate_size": self.dim * self.ff_mult,
            "hash_seed": null,
            "hidden_act": "relu",
            "hidden_dropout_prob": self.hidden_dropout_prob,
            "hidden_size": self.dim,
            "initializer_range": 0.02,
            "is_decoder": is_decoder,
            "layer_norm_eps": 1e-12,
            "max_position_embeddings": max_seq_len,
            "vocab_size": vocab_size,
            "num_attention_heads": self.heads,
            "num_buckets": self.num_buckets(max_seq_len),
            "local_attn_chunk_length": self.bucket_size,
            "local_num_chunks_after": chunks_after,
            "local_num_chunks_before": 1,
            "local_attention_probs_dropout_prob": self.attention_dropout_prob,
            "lsh_attn_chunk_length": self.bucket_size,
            "lsh_num_chunks_after": chunks_after,
            "lsh_num_chunks_before": 1,
            "lsh_attention_probs_dropout_prob": self.attention_dropout_prob,
            "num_hashes": self.num_hashes,
            "num_hidden_layers": self.depth,
            "use_cache": false,
            "output_attentions": false,
            "output_hidden_states": false
        });
        Ok(serde_json::from_value(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn special_tokens() -> SpecialTokens {
        SpecialTokens {
            pad: 0,
            mask: 4,
            cls: 2,
            sep: 3,
            unk: 1,
        }
    }

    #[test]
    fn builds_decoder_config() {
        let hyperparameters = ReformerHyperparameters {
            dim: 32,
            depth: 3,
            bucket_size: 8,
            ..Default::default()
        };
        let config = hyperparameters
            .to_config(100, 64, &special_tokens(), true)
            .unwrap();
        assert_eq!(config.hidden_size, 32);
        assert_eq!(config.axial_pos_shape, vec![8, 8]);
        assert_eq!(config.axial_pos_embds_dim, vec![8, 24]);
        assert_eq!(config.num_hidden_layers, 3);
        assert_eq!(config.attn_layers.len(), 3);
        assert_eq!(config.lsh_num_chunks_after, Some(0));
        assert_eq!(config.max_position_embeddings, 64);
    }

    #[test]
    fn bucket_count_is_even() {
        let hyperparameters = ReformerHyperparameters {
            bucket_size: 16,
            ..Default::default()
        };
        assert_eq!(hyperparameters.num_buckets(16), 2);
        assert_eq!(hyperparameters.num_buckets(48), 6);
        assert_eq!(hyperparameters.num_buckets(256), 32);
    }

    #[test]
    fn rejects_incompatible_sequence_length() {
        let hyperparameters = ReformerHyperparameters {
            bucket_size: 64,
            ..Default::default()
        };
        assert!(hyperparameters.validate(100).is_err());
        let hyperparameters = ReformerHyperparameters {
            bucket_size: 8,
            axial_position_shape: Some(vec![4, 4]),
            ..Default::default()
        };
        assert!(hyperparameters.validate(32).is_err());
        assert!(hyperparameters.validate(16).is_ok());
    }

    #[test]
    fn reads_driver_keys() {
        let hyperparameters: ReformerHyperparameters =
            serde_json::from_str(r#"{"dim": 128, "depth": 2, "n_head": 4}"#).unwrap();
        assert_eq!(hyperparameters.heads, 4);
        assert_eq!(hyperparameters.bucket_size, 64);
        assert_eq!(
            hyperparameters.layer_kinds(),
            vec![AttentionKind::local, AttentionKind::lsh]
        );
    }
}
