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
use crate::data::{Batch, IGNORE_INDEX};
use crate::trainer::PretrainingModel;
use rust_bert::reformer::{ReformerConfig, ReformerModelWithLMHead};
use std::borrow::Borrow;
use tch::Reduction;
use tch::{nn, Kind, Tensor};

/// # Reformer causal language model
/// Decoder-only Reformer with a language modelling head, trained with next token prediction.
/// Padding positions are excluded from attention, label positions equal to `-100` from the loss.
pub struct ReformerAutoRegressiveModel {
    model: ReformerModelWithLMHead,
    pad_token_id: i64,
    vocab_size: i64,
}

impl ReformerAutoRegressiveModel {
    /// Build a new `ReformerAutoRegressiveModel`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the model
    /// * `config` - `ReformerConfig` object defining the model architecture, must be a decoder
    pub fn new<'p, P>(
        p: P,
        config: &ReformerConfig,
    ) -> Result<ReformerAutoRegressiveModel, PretrainError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        if !config.is_decoder {
            return Err(PretrainError::InvalidConfigurationError(
                "the causal language model requires a decoder configuration".to_string(),
            ));
        }
        let model = ReformerModelWithLMHead::new(p, config)?;
        Ok(ReformerAutoRegressiveModel {
            model,
            pad_token_id: config.pad_token_id,
            vocab_size: config.vocab_size,
        })
    }

    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Input tensor of shape (*batch size*, *sequence_length*)
    /// * `labels` - Optional next token labels of the same shape, `-100` for ignored positions
    /// * `train` - boolean flag to turn on/off the dropout layers in the model
    ///
    /// # Returns
    ///
    /// * `logits` of shape (*batch size*, *sequence_length*, *vocab_size*)
    /// * token-level cross entropy, if labels are given
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>), PretrainError> {
        let attention_mask = input_ids.ne(self.pad_token_id).to_kind(Kind::Int64);
        let logits = self
            .model
            .forward_t(
                Some(input_ids),
                None,
                None,
                Some(&attention_mask),
                None,
                None,
                train,
            )?
            .logits;
        let loss = labels.map(|labels| language_modeling_loss(&logits, labels, self.vocab_size));
        Ok((logits, loss))
    }
}

/// Mean cross entropy over the positions whose label is not `-100`
pub fn language_modeling_loss(logits: &Tensor, labels: &Tensor, vocab_size: i64) -> Tensor {
    logits
        .view((-1, vocab_size))
        .log_softmax(-1, Kind::Float)
        .g_nll_loss(
            &labels.view(-1),
            None::<Tensor>,
            Reduction::Mean,
            IGNORE_INDEX,
        )
}

impl PretrainingModel for ReformerAutoRegressiveModel {
    fn forward_loss(&self, batch: &Batch, train: bool) -> Result<Tensor, PretrainError> {
        let labels = batch.labels.as_ref().ok_or_else(|| {
            PretrainError::DataError("causal language modelling requires labels".to_string())
        })?;
        let (_, loss) = self.forward_t(&batch.input_ids, Some(labels), train)?;
        loss.ok_or_else(|| PretrainError::DataError("no loss was computed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn ignored_positions_do_not_contribute() {
        let logits = Tensor::of_slice(&[0.0f32, 5.0, 0.0, 5.0, 0.0, 0.0]).view((1, 2, 3));
        let labels = Tensor::of_slice(&[1i64, IGNORE_INDEX]).view((1, 2));
        let loss = language_modeling_loss(&logits, &labels, 3).double_value(&[]);
        let expected = -(5f64.exp() / (2.0 + 5f64.exp())).ln();
        assert!((loss - expected).abs() < 1e-5);

        let uniform = Tensor::zeros(&[1, 2, 3], (Kind::Float, Device::Cpu));
        let labels = Tensor::of_slice(&[2i64, 0]).view((1, 2));
        let loss = language_modeling_loss(&uniform, &labels, 3).double_value(&[]);
        assert!((loss - 3f64.ln()).abs() < 1e-5);
    }
}
