//! Config command handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mnemo_core::config;

fn resolve(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => config::paths::config_path(),
    }
}

pub fn path(explicit: Option<&Path>) -> Result<()> {
    println!("{}", resolve(explicit)?.display());
    Ok(())
}

pub fn init(explicit: Option<&Path>) -> Result<()> {
    let config_path = resolve(explicit)?;
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}
