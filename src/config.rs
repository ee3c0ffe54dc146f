use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    /// Equality selector for pods to watch, e.g. "envswitch=true,app=myapp".
    #[serde(rename = "labelSelector", default = "default_label_selector")]
    pub label_selector: String,
    /// Env var name -> replacement value, applied to every container of a
    /// crash-looping workload's pod template.
    #[serde(rename = "envPatch", default)]
    pub env_patch: BTreeMap<String, String>,
    /// Minimum restart count before a pod counts as crash-looping (inclusive).
    #[serde(rename = "minRestarts", default = "default_min_restarts")]
    pub min_restarts: i32,
    /// Container status reason that marks a crash-loop.
    #[serde(rename = "crashLoopReason", default = "default_crash_loop_reason")]
    pub crash_loop_reason: String,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

fn default_label_selector() -> String {
    "envswitch=true".to_string()
}

fn default_min_restarts() -> i32 {
    1
}

fn default_crash_loop_reason() -> String {
    "CrashLoopBackOff".to_string()
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.min_restarts < 0 {
        bail!("minRestarts must not be negative, got {}", config.min_restarts);
    }
    if config.crash_loop_reason.is_empty() {
        bail!("crashLoopReason must not be empty");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Returns an error listing every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variables: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
