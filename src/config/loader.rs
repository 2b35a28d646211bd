// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::config::validate::{JOBS_PER_FORK_ENV, apply_jobs_per_fork_override};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load, apply the `JOBS_PER_FORK` override, and validate.
///
/// A missing file at the default path is not an error: every setting has a
/// default, so `multifork work` runs without any config file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw_config = if !path.exists() && path == default_config_path() {
        RawConfigFile::default()
    } else {
        load_from_path(path)?
    };

    let raw_config =
        apply_jobs_per_fork_override(raw_config, std::env::var(JOBS_PER_FORK_ENV).ok())?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Multifork.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Multifork.toml")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nqueue_dir = \"/tmp/spool\"\nmax_fork_failures = 2").unwrap();

        let raw = load_from_path(file.path()).unwrap();
        assert_eq!(raw.worker.queue_dir, PathBuf::from("/tmp/spool"));
        assert_eq!(raw.worker.max_fork_failures, 2);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_and_validate(dir.path().join("nope.toml")).is_err());
    }
}
