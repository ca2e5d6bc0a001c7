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


//! # Reformer models for pretraining
//!
//! Thin wrappers around the rust-bert Reformer implementation:
//! - `ReformerHyperparameters` maps the driver configuration (model width, depth, heads, bucket size)
//!   to a rust-bert `ReformerConfig`
//! - `ReformerAutoRegressiveModel` is a causal language model returning its cross-entropy loss

mod autoregressive;
mod reformer_config;

pub use autoregressive::{language_modeling_loss, ReformerAutoRegressiveModel};
pub use reformer_config::{AttentionKind, ReformerHyperparameters};
