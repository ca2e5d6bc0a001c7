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
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;

/// Path of the log file for a run started today: `{log_dir}/{run_name}-{YYYY-MM-DD}.log`
pub fn log_file_path(log_dir: &Path, run_name: &str) -> PathBuf {
    let date = chrono::Local::now().format("%Y-%m-%d");
    log_dir.join(format!("{}-{}.log", run_name, date))
}

/// Installs the global `tracing` subscriber, appending INFO-level events to the run log file.
///
/// Returns the path of the log file. If a global subscriber is already installed
/// (e.g. a second trainer in the same process) the existing one is kept.
pub fn init_logging(log_dir: &Path, run_name: &str) -> Result<PathBuf, PretrainError> {
    fs::create_dir_all(log_dir)?;
    let path = log_file_path(log_dir, run_name);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .try_init();
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_keeps_logging_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let first = init_logging(&log_dir, "electra").unwrap();
        let second = init_logging(&log_dir, "electra").unwrap();

        assert!(first.is_file());
        assert_eq!(first, second);
        assert_eq!(first, log_file_path(&log_dir, "electra"));
        let file_name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("electra-"));
        assert!(file_name.ends_with(".log"));
        // electra-YYYY-MM-DD.log
        assert_eq!(file_name.len(), "electra-".len() + 10 + ".log".len());
    }
}
