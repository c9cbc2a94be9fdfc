//! Exec command handler.

use std::path::Path;

use anyhow::{Context, Result};
use mnemo_core::config::Config;

use crate::modes;

pub struct ExecRunOptions<'a> {
    pub root: &'a Path,
    pub prompt: &'a str,
    pub config: &'a Config,
    pub model_override: Option<&'a str>,
}

pub async fn run(options: ExecRunOptions<'_>) -> Result<()> {
    let prompt = options.prompt.trim();
    if prompt.is_empty() {
        anyhow::bail!("--prompt must not be empty");
    }

    let config = {
        let mut c = options.config.clone();
        if let Some(model) = options.model_override {
            c.model = model.to_string();
        }
        c
    };

    modes::exec::run_exec(prompt, &config, options.root)
        .await
        .context("execute prompt")?;
    Ok(())
}
