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

use tch::{Kind, Tensor};

/// Boolean mask of the positions of `input_ids` holding any of the `token_ids`.
pub fn mask_with_tokens(input_ids: &Tensor, token_ids: &[i64]) -> Tensor {
    let mut mask = input_ids.zeros_like().to_kind(Kind::Bool);
    for &token_id in token_ids {
        mask = mask.logical_or(&input_ids.eq(token_id));
    }
    mask
}

/// Bernoulli mask with the shape and device of `reference`.
pub fn probability_mask_like(reference: &Tensor, probability: f64) -> Tensor {
    Tensor::rand(&reference.size(), (Kind::Float, reference.device())).lt(probability)
}

/// Selects, in every row, `ceil(allowed_count * probability)` of the allowed positions uniformly at random.
///
/// # Arguments
///
/// * `allowed` - Boolean tensor of shape (*batch size*, *sequence_length*), `true` where a position may be selected
/// * `probability` - fraction of the allowed positions to select
///
/// # Returns
///
/// * Boolean tensor of shape (*batch size*, *sequence_length*)
pub fn select_mask_subset(allowed: &Tensor, probability: f64) -> Tensor {
    let allowed_count = allowed.to_kind(Kind::Double).sum_dim_intlist(&[-1], true, Kind::Double);
    // the offset absorbs rounding noise such as 20 * 0.15 = 3.0000000000000004
    let num_selected = (allowed_count * probability - 1e-9).ceil().clamp_min(0.0);

    let scores = Tensor::rand(&allowed.size(), (Kind::Float, allowed.device()))
        .masked_fill(&allowed.logical_not(), -1.0);
    let ranks = scores.argsort(-1, true).argsort(-1, false);
    ranks
        .to_kind(Kind::Double)
        .lt_tensor(&num_selected)
        .logical_and(allowed)
}

/// Samples one token per position from `logits / temperature` with the Gumbel-max trick.
pub fn gumbel_sample(logits: &Tensor, temperature: f64) -> Tensor {
    let eps = 1e-9;
    let uniform = Tensor::rand(&logits.size(), (Kind::Float, logits.device()));
    let gumbel_noise = -(-(uniform + eps).log() + eps).log();
    (logits.to_kind(Kind::Float) / temperature + gumbel_noise).argmax(-1, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_tokens_are_flagged() {
        let input = Tensor::of_slice(&[2i64, 7, 8, 3, 0, 0]).view((1, 6));
        let mask = mask_with_tokens(&input, &[0, 2, 3]).to_kind(Kind::Int64);
        let flagged = (0..6)
            .map(|position| mask.int64_value(&[0, position]))
            .collect::<Vec<i64>>();
        assert_eq!(flagged, vec![1, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn selects_exact_count_among_allowed() {
        tch::manual_seed(0);
        let input = Tensor::of_slice(&[
            2i64, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 3, //
            2, 21, 22, 23, 3, 0, 0, 0, 0, 0, 0, 0,
        ])
        .view((2, 12));
        let allowed = mask_with_tokens(&input, &[0, 2, 3]).logical_not();
        for _ in 0..10 {
            let selected = select_mask_subset(&allowed, 0.15);
            let counts = selected.sum_dim_intlist(&[-1], false, Kind::Int64);
            let counts = vec![counts.int64_value(&[0]), counts.int64_value(&[1])];
            // ceil(10 * 0.15) = 2 and ceil(3 * 0.15) = 1
            assert_eq!(counts, vec![2, 1]);
            let outside = selected
                .logical_and(&allowed.logical_not())
                .sum(Kind::Int64)
                .int64_value(&[]);
            assert_eq!(outside, 0);
        }
    }

    #[test]
    fn rows_without_allowed_positions_select_nothing() {
        let allowed = Tensor::of_slice(&[false, false, false]).view((1, 3));
        let selected = select_mask_subset(&allowed, 0.5);
        assert_eq!(selected.sum(Kind::Int64).int64_value(&[]), 0);
    }

    #[test]
    fn gumbel_sample_follows_dominant_logit() {
        let logits = Tensor::of_slice(&[0.0f32, 100.0, 0.0, 100.0, 0.0, 0.0]).view((2, 3));
        let samples = gumbel_sample(&logits, 1.0);
        assert_eq!(samples.int64_value(&[0]), 1);
        assert_eq!(samples.int64_value(&[1]), 0);
    }
}
