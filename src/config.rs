// ⚙️ Config - Runtime settings from the environment
//
// ASSESSMENT_DB                      SQLite file (default assessment.db)
// ASSESSMENT_BIND                    server listen address (default 0.0.0.0:3000)
// ASSESSMENT_STAGNATION_MIN_HISTORY  prior records required before flagging (default 3)

use crate::stagnation::StagnationPolicy;
use anyhow::{Context, Result};
use std::path::PathBuf;

pub const DB_ENV: &str = "ASSESSMENT_DB";
pub const BIND_ENV: &str = "ASSESSMENT_BIND";
pub const MIN_HISTORY_ENV: &str = "ASSESSMENT_STAGNATION_MIN_HISTORY";

pub const DEFAULT_DB_PATH: &str = "assessment.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub stagnation: StagnationPolicy,
}

impl Config {
    pub fn new() -> Self {
        Config {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            stagnation: StagnationPolicy::default(),
        }
    }

    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset or blank values keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::new();

        if let Some(path) = value(DB_ENV) {
            config.db_path = PathBuf::from(path);
        }

        if let Some(addr) = value(BIND_ENV) {
            config.bind_addr = addr.trim().to_string();
        }

        if let Some(min) = value(MIN_HISTORY_ENV) {
            let min: usize = min
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number, got {:?}", MIN_HISTORY_ENV, min))?;
            config.stagnation = StagnationPolicy::with_min_history(min);
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
