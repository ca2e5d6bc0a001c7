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


//! Error type, configuration loading, device selection and logging setup shared by the
//! training drivers.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, DeviceSpec};
pub use error::PretrainError;
pub use logging::{init_logging, log_file_path};
