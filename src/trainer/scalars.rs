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
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
    wall_time: f64,
}

/// # Scalar summary writer
/// Appends one JSON object per scalar (`tag`, `value`, `step`, `wall_time`) to
/// `{dir}/{run_name}_scalars.jsonl`.
pub struct ScalarWriter {
    path: PathBuf,
    file: File,
}

impl ScalarWriter {
    pub fn new(dir: &Path, run_name: &str) -> Result<ScalarWriter, PretrainError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_scalars.jsonl", run_name));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ScalarWriter { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<(), PretrainError> {
        let event = ScalarEvent {
            tag,
            value,
            step,
            wall_time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        serde_json::to_writer(&mut self.file, &event)?;
        writeln!(self.file)?;
        self.file.flush()?;
        Ok(())
    }
}
