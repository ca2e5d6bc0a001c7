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


//! # Pretraining of Reformer language models in Rust
//!
//! Training drivers for two pretraining regimes built on [tch-rs](https://github.com/LaurentMazare/tch-rs)
//! and the Reformer implementation of [rust-bert](https://github.com/guillaume-be/rust-bert):
//! - a causal (autoregressive) Reformer language model trained with Adafactor
//! - ELECTRA replaced token detection with a Reformer generator and a Reformer discriminator,
//!   trained with AdamW and a linear warmup/decay schedule
//!
//! The training loop (`trainer::Trainer`) resumes from checkpoints, accumulates gradients over
//! micro-batches, reports and evaluates periodically and spreads batches over every available GPU.
//!
//! ```no_run
//! use rust_pretrain::common::{Config, DeviceSpec};
//! use rust_pretrain::drivers::{pretrain_autoregressive, AutoRegressiveConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = AutoRegressiveConfig::from_file("config/autoregressive-pretrain.json")?;
//! let devices = DeviceSpec::Auto.devices()?;
//! let summary = pretrain_autoregressive(&config, &devices, 9)?;
//! println!("{:?}", summary.eval);
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod data;
pub mod drivers;
pub mod electra;
pub mod optimizer;
pub mod reformer;
pub mod trainer;

pub use common::{Config, DeviceSpec, PretrainError};
