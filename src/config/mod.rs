// src/config/mod.rs

//! Configuration loading.
//!
//! TOML is deserialised into [`RawConfigFile`], the `JOBS_PER_FORK`
//! override is applied, and `TryFrom` validates it into [`ConfigFile`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    ConfigFile, ForkSection, HooksConfig, RawConfigFile, ShutdownSection, WorkerSection,
    WorkerSettings,
};
pub use validate::{JOBS_PER_FORK_ENV, apply_jobs_per_fork_override};

/// Reads `humantime` strings (`"500ms"`, `"1m 30s"`) into `Duration` fields.
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
