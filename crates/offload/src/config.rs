use candle_core::DType;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::errors::{OffloadError, Result};

/// Settings for an [`OffloadParameterStore`](crate::store::OffloadParameterStore).
#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    /// Directory holding the per-rank backing files.
    pub directory: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Capacity of the flat buffer, in elements.
    pub buffer_capacity: usize,
    #[serde(default)]
    pub dtype: StorageDType,
    /// Drop the resident copy after a parameter is first written to file.
    #[serde(default = "default_true")]
    pub release_after_write: bool,
    /// Persist and evict every parameter when a step completes.
    #[serde(default = "default_true")]
    pub evict_after_step: bool,
    #[serde(default = "default_true")]
    pub check_overlaps: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageDType {
    #[default]
    F32,
    F16,
    Bf16,
    F64,
}

impl StorageDType {
    pub fn to_dtype(self) -> DType {
        match self {
            StorageDType::F32 => DType::F32,
            StorageDType::F16 => DType::F16,
            StorageDType::Bf16 => DType::BF16,
            StorageDType::F64 => DType::F64,
        }
    }
}

impl OffloadConfig {
    pub fn new(directory: impl Into<PathBuf>, buffer_capacity: usize) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: default_file_prefix(),
            buffer_capacity,
            dtype: StorageDType::default(),
            release_after_write: true,
            evict_after_step: true,
            check_overlaps: true,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| OffloadError::io(path, err))?;
        let mut config: OffloadConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(OffloadError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if config.directory.is_relative() {
            config.directory = base_dir.join(&config.directory);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.directory.as_os_str().is_empty() {
            errors.push("directory must not be empty".to_string());
        }
        if self.file_prefix.is_empty() {
            errors.push("file_prefix must not be empty".to_string());
        }
        if self
            .file_prefix
            .contains(|c| c == '/' || c == std::path::MAIN_SEPARATOR)
        {
            errors.push(format!(
                "file_prefix '{}' must not contain a path separator",
                self.file_prefix
            ));
        }
        if self.buffer_capacity == 0 {
            errors.push("buffer_capacity must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(OffloadError::Validation(errors));
        }
        Ok(())
    }

    /// Backing file of `rank`: `{directory}/{file_prefix}_rank{rank}`.
    pub fn rank_file(&self, rank: usize) -> PathBuf {
        self.directory
            .join(format!("{}_rank{}", self.file_prefix, rank))
    }
}

fn default_file_prefix() -> String {
    "offload".to_string()
}

fn default_true() -> bool {
    true
}
