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
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tch::{Cuda, Device};

/// # Utility to deserialize JSON config files
pub trait Config
where
    for<'de> Self: Deserialize<'de>,
{
    /// Loads a `Config` object from a JSON file.
    ///
    /// # Parameters
    ///
    /// * `path` - `Path` to the configuration JSON file.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use rust_pretrain::common::Config;
    /// use rust_pretrain::drivers::AutoRegressiveConfig;
    ///
    /// let config = AutoRegressiveConfig::from_file("config/autoregressive-pretrain.json").unwrap();
    /// ```
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PretrainError> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            PretrainError::IOError(format!(
                "could not open configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        let br = BufReader::new(f);
        let config: Self = serde_json::from_reader(br)?;
        Ok(config)
    }
}

/// # Device selection for training
/// `Auto` uses every visible CUDA device, falling back to the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Auto,
    Cpu,
    AllCuda,
    Cuda(usize),
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec::Auto
    }
}

impl DeviceSpec {
    /// Resolves the device selection into the devices hosting one model replica each.
    /// The first device holds the primary replica.
    pub fn devices(&self) -> Result<Vec<Device>, PretrainError> {
        let cuda_count = if Cuda::is_available() {
            Cuda::device_count() as usize
        } else {
            0
        };
        match *self {
            DeviceSpec::Cpu => Ok(vec![Device::Cpu]),
            DeviceSpec::Auto if cuda_count == 0 => Ok(vec![Device::Cpu]),
            DeviceSpec::Auto | DeviceSpec::AllCuda => {
                if cuda_count == 0 {
                    return Err(PretrainError::InvalidConfigurationError(
                        "CUDA devices were requested but none is available".to_string(),
                    ));
                }
                Ok((0..cuda_count).map(Device::Cuda).collect())
            }
            DeviceSpec::Cuda(index) => {
                if index >= cuda_count {
                    return Err(PretrainError::InvalidConfigurationError(format!(
                        "CUDA device {} requested but only {} device(s) available",
                        index, cuda_count
                    )));
                }
                Ok(vec![Device::Cuda(index)])
            }
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = PretrainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Ok(DeviceSpec::Auto),
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::AllCuda),
            other => match other.strip_prefix("cuda:") {
                Some(index) => index.parse::<usize>().map(DeviceSpec::Cuda).map_err(|_| {
                    PretrainError::InvalidConfigurationError(format!(
                        "invalid CUDA device index in `{}`",
                        value
                    ))
                }),
                None => Err(PretrainError::InvalidConfigurationError(format!(
                    "unknown device `{}` (expected auto, cpu, cuda or cuda:N)",
                    value
                ))),
            },
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Auto => write!(f, "auto"),
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::AllCuda => write!(f, "cuda"),
            DeviceSpec::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl Serialize for DeviceSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        DeviceSpec::from_str(&value).map_err(serde::de::Error::custom)
    }
}
