// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{MultiforkError, Result};

/// Environment variable overriding `[fork].jobs_per_fork`.
pub const JOBS_PER_FORK_ENV: &str = "JOBS_PER_FORK";

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = MultiforkError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Apply the `JOBS_PER_FORK` override, given the variable's value.
///
/// Blank values are ignored; anything else must be a non-negative integer.
pub fn apply_jobs_per_fork_override(
    mut raw: RawConfigFile,
    value: Option<String>,
) -> Result<RawConfigFile> {
    let Some(value) = value else {
        return Ok(raw);
    };
    let value = value.trim();
    if value.is_empty() {
        return Ok(raw);
    }

    raw.fork.jobs_per_fork = value.parse().map_err(|e| {
        MultiforkError::ConfigError(format!(
            "{JOBS_PER_FORK_ENV} must be a non-negative integer (got '{value}'): {e}"
        ))
    })?;
    Ok(raw)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_worker(cfg)?;
    validate_shutdown(cfg)?;
    Ok(())
}

fn validate_worker(cfg: &RawConfigFile) -> Result<()> {
    if cfg.worker.queue_dir.as_os_str().is_empty() {
        return Err(MultiforkError::ConfigError(
            "[worker].queue_dir must not be empty".to_string(),
        ));
    }
    if cfg.worker.max_fork_failures == 0 {
        return Err(MultiforkError::ConfigError(
            "[worker].max_fork_failures must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.worker.handshake_timeout.is_zero() {
        return Err(MultiforkError::ConfigError(
            "[worker].handshake_timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_shutdown(cfg: &RawConfigFile) -> Result<()> {
    if cfg.shutdown.term_child && cfg.shutdown.term_timeout.is_zero() {
        return Err(MultiforkError::ConfigError(
            "[shutdown].term_timeout must be greater than zero when term_child is set"
                .to_string(),
        ));
    }
    Ok(())
}
