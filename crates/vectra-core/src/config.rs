//! Service configuration.
//!
//! Loaded from an optional TOML file, then overridden field-by-field from
//! `VECTRA_*` environment variables so deployments can tweak a single knob
//! without shipping a file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Segments refuse to stay insertable beyond this many vectors; smaller
/// configured values are raised to the floor.
pub const SEGMENT_VECTOR_FLOOR: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub data_path: PathBuf,
    pub segment_vector_max_size: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8880,
            data_path: PathBuf::from("./data"),
            segment_vector_max_size: SEGMENT_VECTOR_FLOOR,
        }
    }
}

impl ServiceConfig {
    /// Read the config file if one exists, apply env overrides, clamp.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| Error::Serde(e.to_string()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.clamp();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("VECTRA_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("VECTRA_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(path) = std::env::var("VECTRA_DATA_PATH") {
            self.data_path = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("VECTRA_SEGMENT_VECTOR_MAX_SIZE") {
            if let Ok(size) = size.parse() {
                self.segment_vector_max_size = size;
            }
        }
    }

    fn clamp(&mut self) {
        if self.segment_vector_max_size < SEGMENT_VECTOR_FLOOR {
            warn!(
                configured = self.segment_vector_max_size,
                floor = SEGMENT_VECTOR_FLOOR,
                "segment_vector_max_size below floor, clamping"
            );
            self.segment_vector_max_size = SEGMENT_VECTOR_FLOOR;
        }
    }
}
