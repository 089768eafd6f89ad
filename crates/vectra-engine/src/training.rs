//! Child side of out-of-process training.
//!
//! Training allocates roughly `1.5 × vid_size × dim × 4` bytes at peak, so
//! it runs in a spawned copy of this executable: the parent keeps serving
//! searches on the pre-train index while the OS reclaims every byte the
//! trainer touched the moment it exits.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use vectra_core::{Error, Result};

use crate::segment::{Segment, SegmentConfig, CONFIG_FILE};

/// Trainer exit codes. The parent only distinguishes zero from non-zero;
/// the specific code lands in the logs.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_MISSING: i32 = -1;
    pub const NEW_SEGMENT_ERR: i32 = -2;
    pub const CONFIG_LOAD_ERR: i32 = -3;
    pub const TRAIN_ERR: i32 = -4;
    pub const DUMP_ERR: i32 = -5;
}

/// The executable to spawn for training: `VECTRA_TRAIN_EXE` when set (lets
/// a wrapper binary stand in), otherwise this process's own image.
pub fn trainer_exe() -> Result<PathBuf> {
    if let Ok(exe) = std::env::var("VECTRA_TRAIN_EXE") {
        return Ok(PathBuf::from(exe));
    }
    Ok(std::env::current_exe()?)
}

/// Child entry point: load the persisted segment config, rebuild the
/// segment against the given dir and train its index (which dumps on
/// success). Returns the process exit code.
pub fn run(segment_dir: &Path, n_threads: usize) -> i32 {
    let config_path = segment_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        error!(dir = %segment_dir.display(), "segment config missing");
        return exit_code::CONFIG_MISSING;
    }

    let config: SegmentConfig = match std::fs::read(&config_path)
        .map_err(Error::from)
        .and_then(|raw| bincode::deserialize(&raw).map_err(Error::from))
    {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load segment config: {e}");
            return exit_code::CONFIG_LOAD_ERR;
        }
    };

    let segment = match Segment::create(config.segment_id, segment_dir.to_path_buf(), config.dim)
    {
        Ok(segment) => segment,
        Err(e) => {
            error!(segment_id = config.segment_id, "failed to open segment: {e}");
            return exit_code::NEW_SEGMENT_ERR;
        }
    };

    let Some(index) = segment.index_handle() else {
        error!(segment_id = config.segment_id, "segment has no index handle");
        return exit_code::NEW_SEGMENT_ERR;
    };

    match index.train(n_threads) {
        Ok(()) => {
            info!(segment_id = config.segment_id, "training complete");
            exit_code::SUCCESS
        }
        Err(e @ (Error::Io(_) | Error::Serde(_))) => {
            error!(segment_id = config.segment_id, "index dump failed: {e}");
            exit_code::DUMP_ERR
        }
        Err(e) => {
            error!(segment_id = config.segment_id, "training failed: {e}");
            exit_code::TRAIN_ERR
        }
    }
}
