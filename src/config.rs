/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use pyunwind::unwind::python::{encode_version, load_offsets_file, scan_version};
use pyunwind::{PthreadConfig, PythonConfig, PythonInternalsOffsets, UnwinderConfig};

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_SAMPLE_COUNT: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("pid is not specified")]
    PidMissing,
    #[error("python config invalid: {0}")]
    PythonConfigInvalid(#[from] pyunwind::Error),
}

/// Where to find the interpreter internals of the sampled python binary.
///
/// Addresses are relative to the load address of the interpreter binary,
/// 0 means unknown.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PythonBinaryConfig {
    /// Free form version text such as `Python 3.11.4`. Taken from the
    /// offsets file name when absent.
    pub version: Option<String>,
    pub offsets_file: Option<PathBuf>,
    pub offsets: Option<PythonInternalsOffsets>,
    pub thread_state_tls_offset: u64,
    pub runtime_relative_address: u64,
    pub interp_head_relative_address: u64,
    pub auto_tss_key_relative_address: u64,
    pub unicode_type_size_log2: u8,
}

impl PythonBinaryConfig {
    pub fn build(&self) -> Result<PythonConfig, ConfigError> {
        let (file_version, offsets) = match (&self.offsets_file, self.offsets) {
            (Some(path), inline) => {
                if inline.is_some() {
                    warn!("both offsets and offsets-file configured, use {}", path.display());
                }
                load_offsets_file(path)?
            }
            (None, Some(offsets)) => (None, offsets),
            (None, None) => return Err(pyunwind::Error::NoOffsets.into()),
        };
        let version = match (&self.version, file_version) {
            (Some(text), _) => scan_version(text)?,
            (None, Some(v)) => v,
            (None, None) => return Err(pyunwind::Error::NoVersion(String::new()).into()),
        };

        let config = PythonConfig {
            thread_state_tls_offset: self.thread_state_tls_offset,
            runtime_relative_address: self.runtime_relative_address,
            interp_head_relative_address: self.interp_head_relative_address,
            auto_tss_key_relative_address: self.auto_tss_key_relative_address,
            version: encode_version(&version),
            unicode_type_size_log2: self.unicode_type_size_log2,
            offsets,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub pid: u32,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    pub sample_count: u32,
    pub log_file: String,
    pub log_level: String,
    pub unwinder: UnwinderConfig,
    pub python: PythonBinaryConfig,
    pub pthread: Option<PthreadConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pid: 0,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            sample_count: DEFAULT_SAMPLE_COUNT,
            log_file: String::new(),
            log_level: "info".to_owned(),
            unwinder: UnwinderConfig::default(),
            python: PythonBinaryConfig::default(),
            pthread: None,
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        let mut cfg: Self = if contents.is_empty() {
            // parsing empty string leads to EOF error
            Self::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?
        };

        if cfg.sample_interval < MIN_SAMPLE_INTERVAL {
            cfg.sample_interval = MIN_SAMPLE_INTERVAL;
        }
        if cfg.sample_count == 0 {
            cfg.sample_count = DEFAULT_SAMPLE_COUNT;
        }
        cfg.unwinder.normalize();
        Ok(cfg)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.pid == 0 {
            return Err(ConfigError::PidMissing);
        }
        Ok(())
    }
}
