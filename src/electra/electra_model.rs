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
use crate::data::{Batch, SpecialTokens, IGNORE_INDEX};
use crate::electra::masking::{
    gumbel_sample, mask_with_tokens, probability_mask_like, select_mask_subset,
};
use crate::reformer::language_modeling_loss;
use crate::trainer::PretrainingModel;
use rust_bert::reformer::{ReformerConfig, ReformerModel};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use tch::Reduction;
use tch::{nn, Kind, Tensor};
use tracing::debug;

fn default_mask_prob() -> f64 {
    0.15
}

fn default_replace_prob() -> f64 {
    0.85
}

fn default_one() -> f64 {
    1.0
}

fn default_disc_weight() -> f64 {
    50.0
}

/// # Replaced token detection settings
/// Masking probabilities, generator sampling temperature and loss weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectraMaskingConfig {
    /// Fraction of the maskable tokens selected in every sequence
    #[serde(default = "default_mask_prob")]
    pub mask_prob: f64,
    /// Probability for a selected token to be replaced by `[MASK]`
    #[serde(default = "default_replace_prob")]
    pub replace_prob: f64,
    /// Probability for a selected token that is not replaced by `[MASK]` to be replaced by a random token
    #[serde(default)]
    pub random_token_prob: f64,
    #[serde(default = "default_one")]
    pub temperature: f64,
    #[serde(default = "default_one")]
    pub gen_weight: f64,
    #[serde(default = "default_disc_weight")]
    pub disc_weight: f64,
}

impl Default for ElectraMaskingConfig {
    fn default() -> Self {
        ElectraMaskingConfig {
            mask_prob: default_mask_prob(),
            replace_prob: default_replace_prob(),
            random_token_prob: 0.0,
            temperature: default_one(),
            gen_weight: default_one(),
            disc_weight: default_disc_weight(),
        }
    }
}

impl ElectraMaskingConfig {
    pub fn validate(&self) -> Result<(), PretrainError> {
        for (name, value) in &[
            ("mask_prob", self.mask_prob),
            ("replace_prob", self.replace_prob),
            ("random_token_prob", self.random_token_prob),
        ] {
            if !(0.0..=1.0).contains(value) {
                return Err(PretrainError::InvalidConfigurationError(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.temperature <= 0.0 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "sampling temperature must be strictly positive, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// # Output of an ELECTRA forward pass
pub struct ElectraOutput {
    /// `gen_weight * mlm_loss + disc_weight * disc_loss`
    pub loss: Tensor,
    pub mlm_loss: Tensor,
    pub disc_loss: Tensor,
    /// Generator predictions matching the original token, over the masked positions.
    /// Only computed in evaluation mode.
    pub generator_accuracy: Option<f64>,
    /// Mean of the discriminator accuracies over masked and unmasked positions.
    /// Only computed in evaluation mode.
    pub discriminator_accuracy: Option<f64>,
}

/// Picks `if_true` where `condition` holds, `if_false` elsewhere (integer tensors).
fn select_tokens(condition: &Tensor, if_true: &Tensor, if_false: &Tensor) -> Tensor {
    if_false + (if_true - if_false) * condition.to_kind(Kind::Int64)
}

fn accuracy(correct: &Tensor, selection: &Tensor) -> Option<f64> {
    let count = selection.sum(Kind::Int64).int64_value(&[]);
    if count == 0 {
        return None;
    }
    let hits = correct.logical_and(selection).sum(Kind::Int64).int64_value(&[]);
    Some(hits as f64 / count as f64)
}

/// # ELECTRA with Reformer generator and discriminator
/// The generator is a bidirectional Reformer encoder with a projection to the vocabulary, trained with
/// masked language modelling. Its samples replace the masked tokens of the input given to the
/// discriminator, a Reformer encoder with a linear adapter predicting for every token whether it was replaced.
/// Both networks keep their own token and position embeddings: rust-bert's Reformer embeddings are sized
/// by each network's hidden size and cannot be shared between a generator and a discriminator of different widths.
pub struct ReformerElectra {
    generator: ReformerModel,
    generator_head: nn::Linear,
    discriminator: ReformerModel,
    discriminator_head: nn::Linear,
    masking: ElectraMaskingConfig,
    special_tokens: SpecialTokens,
    mask_ignore_ids: Vec<i64>,
    vocab_size: i64,
}

impl ReformerElectra {
    /// Build a new `ReformerElectra`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the model
    /// * `generator_config` - configuration of the generator encoder
    /// * `discriminator_config` - configuration of the discriminator encoder
    /// * `special_tokens` - special token ids, never masked
    /// * `masking` - masking probabilities and loss weights
    pub fn new<'p, P>(
        p: P,
        generator_config: &ReformerConfig,
        discriminator_config: &ReformerConfig,
        special_tokens: SpecialTokens,
        masking: ElectraMaskingConfig,
    ) -> Result<ReformerElectra, PretrainError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        masking.validate()?;
        if generator_config.vocab_size != discriminator_config.vocab_size {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "generator ({}) and discriminator ({}) vocabulary sizes differ",
                generator_config.vocab_size, discriminator_config.vocab_size
            )));
        }
        let generator = ReformerModel::new(p / "generator", generator_config)?;
        let generator_head = nn::linear(
            p / "generator_head",
            2 * generator_config.hidden_size,
            generator_config.vocab_size,
            Default::default(),
        );
        let discriminator = ReformerModel::new(p / "discriminator", discriminator_config)?;
        let discriminator_head = nn::linear(
            p / "discriminator_head",
            2 * discriminator_config.hidden_size,
            1,
            Default::default(),
        );
        Ok(ReformerElectra {
            generator,
            generator_head,
            discriminator,
            discriminator_head,
            masking,
            mask_ignore_ids: special_tokens.all_special_ids(),
            special_tokens,
            vocab_size: generator_config.vocab_size,
        })
    }

    /// Forward pass through the generator and the discriminator
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Input tensor of shape (*batch size*, *sequence_length*), padded with the pad token
    /// * `train` - boolean flag to turn on/off the dropout layers in the model
    ///
    /// # Returns
    ///
    /// * `ElectraOutput` with the weighted loss, its components and, when `train` is false, the accuracies
    pub fn forward_t(&self, input_ids: &Tensor, train: bool) -> Result<ElectraOutput, PretrainError> {
        let special = mask_with_tokens(input_ids, &self.mask_ignore_ids);
        let mask = select_mask_subset(&special.logical_not(), self.masking.mask_prob);
        let replace =
            probability_mask_like(input_ids, self.masking.replace_prob).logical_and(&mask);
        let mut masked_input = input_ids.masked_fill(&replace, self.special_tokens.mask);
        if self.masking.random_token_prob > 0.0 {
            let random_tokens = Tensor::randint(
                self.vocab_size,
                &input_ids.size(),
                (Kind::Int64, input_ids.device()),
            );
            let random = probability_mask_like(input_ids, self.masking.random_token_prob)
                .logical_and(&mask)
                .logical_and(&replace.logical_not())
                .logical_and(&mask_with_tokens(&random_tokens, &self.mask_ignore_ids).logical_not());
            masked_input = select_tokens(&random, &random_tokens, &masked_input);
        }
        let attention_mask = input_ids.ne(self.special_tokens.pad).to_kind(Kind::Int64);

        let generator_logits = self
            .generator
            .forward_t(
                Some(&masked_input),
                None,
                None,
                Some(&attention_mask),
                None,
                None,
                train,
            )?
            .hidden_states
            .apply(&self.generator_head);
        let generator_labels = input_ids.masked_fill(&mask.logical_not(), IGNORE_INDEX);
        let num_masked = mask.sum(Kind::Int64).int64_value(&[]);
        let mlm_loss = if num_masked > 0 {
            language_modeling_loss(&generator_logits, &generator_labels, self.vocab_size)
        } else {
            generator_logits.sum(Kind::Float) * 0.0
        };

        let sampled = tch::no_grad(|| {
            gumbel_sample(&generator_logits.detach(), self.masking.temperature)
        });
        let discriminator_input = select_tokens(&mask, &sampled, input_ids);
        let discriminator_labels = input_ids
            .ne_tensor(&discriminator_input)
            .to_kind(Kind::Float);

        let discriminator_logits = self
            .discriminator
            .forward_t(
                Some(&discriminator_input),
                None,
                None,
                Some(&attention_mask),
                None,
                None,
                train,
            )?
            .hidden_states
            .apply(&self.discriminator_head)
            .reshape(&input_ids.size());
        let non_padded = attention_mask.to_kind(Kind::Float);
        let disc_loss = (discriminator_logits.binary_cross_entropy_with_logits::<Tensor>(
            &discriminator_labels,
            None,
            None,
            Reduction::None,
        ) * &non_padded)
            .sum(Kind::Float)
            / non_padded.sum(Kind::Float).clamp_min(1.0);

        let (generator_accuracy, discriminator_accuracy) = if train {
            (None, None)
        } else {
            let (generator_accuracy, discriminator_accuracy) = tch::no_grad(|| {
                let generator_correct = generator_logits.argmax(-1, false).eq_tensor(input_ids);
                let generator_accuracy = accuracy(&generator_correct, &mask).unwrap_or(0.0);
                let discriminator_correct = discriminator_logits
                    .gt(0.0)
                    .eq_tensor(&discriminator_labels.to_kind(Kind::Bool));
                let discriminator_accuracy = match (
                    accuracy(&discriminator_correct, &mask),
                    accuracy(&discriminator_correct, &mask.logical_not()),
                ) {
                    (Some(masked), Some(unmasked)) => 0.5 * masked + 0.5 * unmasked,
                    (Some(accuracy), None) | (None, Some(accuracy)) => accuracy,
                    (None, None) => 0.0,
                };
                (generator_accuracy, discriminator_accuracy)
            });
            (Some(generator_accuracy), Some(discriminator_accuracy))
        };

        let loss = &mlm_loss * self.masking.gen_weight + &disc_loss * self.masking.disc_weight;
        Ok(ElectraOutput {
            loss,
            mlm_loss,
            disc_loss,
            generator_accuracy,
            discriminator_accuracy,
        })
    }
}

impl PretrainingModel for ReformerElectra {
    fn forward_loss(&self, batch: &Batch, train: bool) -> Result<Tensor, PretrainError> {
        let output = self.forward_t(&batch.input_ids, train)?;
        if let (Some(generator), Some(discriminator)) =
            (output.generator_accuracy, output.discriminator_accuracy)
        {
            debug!(
                generator_accuracy = generator,
                discriminator_accuracy = discriminator,
                "mlm loss {:.4}, discriminator loss {:.4}",
                output.mlm_loss.double_value(&[]),
                output.disc_loss.double_value(&[])
            );
        }
        Ok(output.loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_defaults() {
        let config: ElectraMaskingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.mask_prob, 0.15);
        assert_eq!(config.replace_prob, 0.85);
        assert_eq!(config.random_token_prob, 0.0);
        assert_eq!(config.disc_weight, 50.0);
        assert!(config.validate().is_ok());
        let invalid = ElectraMaskingConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn token_selection() {
        let condition = Tensor::of_slice(&[true, false, true]);
        let if_true = Tensor::of_slice(&[7i64, 8, 9]);
        let if_false = Tensor::of_slice(&[1i64, 2, 3]);
        let selected = select_tokens(&condition, &if_true, &if_false);
        assert_eq!(selected.int64_value(&[0]), 7);
        assert_eq!(selected.int64_value(&[1]), 2);
        assert_eq!(selected.int64_value(&[2]), 9);
    }
}
