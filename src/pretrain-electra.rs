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


use anyhow::Result;
use clap::Parser;
use rust_pretrain::common::{init_logging, Config, DeviceSpec};
use rust_pretrain::drivers::{pretrain_electra, ElectraTrainingConfig, DEFAULT_SEED};
use std::path::PathBuf;
use tracing::info;

/// Pretrains an ELECTRA replaced token detection model
#[derive(Parser, Debug, Clone)]
struct Args {
    /// JSON configuration file
    #[arg(long, default_value = "config/electra-train.json")]
    config: PathBuf,

    /// auto, cpu, cuda or cuda:N
    #[arg(long, default_value = "auto")]
    device: DeviceSpec,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = ElectraTrainingConfig::from_file(&args.config)?;
    let log_file = init_logging(&config.train.log_dir, &config.train.model_name)?;
    println!("logging to {}", log_file.display());
    info!("configuration: {:?}", config);

    let devices = args.device.devices()?;
    let summary = pretrain_electra(&config, &devices, args.seed)?;
    info!("training finished: {:?}", summary);
    if let Some(eval) = summary.eval {
        println!(
            "{} steps, eval loss {:.4}, perplexity {:.4}",
            summary.train_steps, eval.loss, eval.perplexity
        );
    }
    Ok(())
}
