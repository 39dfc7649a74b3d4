// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_INCARNATIONS: u32 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to sanitize the block executor config! Sanitizer: {0}, Error: {1}")]
    ConfigSanitizerFailed(String, String),
    #[error("Error (de)serializing {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockExecutorConfig {
    /// Number of workers participating in parallel execution. 1 selects sequential execution.
    pub concurrency_level: usize,
    /// An incarnation reaching this number halts parallel execution of the block.
    pub max_incarnations: u32,
    /// Re-run a block sequentially when parallel execution is halted by the incarnation limit.
    pub sequential_fallback: bool,
    /// Replay recorded scans on a helper thread while the point reads are validated.
    pub iterator_validation_helper: bool,
}

impl Default for BlockExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_level: num_cpus::get(),
            max_incarnations: DEFAULT_MAX_INCARNATIONS,
            sequential_fallback: true,
            iterator_validation_helper: true,
        }
    }
}

impl BlockExecutorConfig {
    pub fn sanitize(&self) -> Result<(), ConfigError> {
        let sanitizer_name = "BlockExecutorConfig".to_string();
        if self.concurrency_level == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                sanitizer_name,
                "concurrency_level must be at least 1".into(),
            ));
        }
        if self.max_incarnations == 0 {
            return Err(ConfigError::ConfigSanitizerFailed(
                sanitizer_name,
                "max_incarnations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|error| ConfigError::Yaml("BlockExecutorConfig".to_string(), error))?;
        config.sanitize()?;
        Ok(config)
    }
}
