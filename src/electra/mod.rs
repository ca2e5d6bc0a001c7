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


//! # ELECTRA replaced token detection (Clark et al., 2020)
//!
//! A small generator trained with masked language modelling proposes replacements for the masked
//! tokens; a discriminator learns to detect which tokens were replaced. Both networks are
//! Reformer encoders from rust-bert.

mod electra_model;
mod masking;

pub use electra_model::{ElectraMaskingConfig, ElectraOutput, ReformerElectra};
pub use masking::{gumbel_sample, mask_with_tokens, probability_mask_like, select_mask_subset};
