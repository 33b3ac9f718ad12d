#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::media::DeliveryMode;
use crate::mirror::MirrorPolicy;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;
pub const MIN_CHUNK_BYTES: usize = 4096;
pub const MAX_RESOLVE_RETRIES: u32 = 3;
pub const DEFAULT_MIRROR_HOST: &str = "mbasic.facebook.com";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

/// Everything the backend needs at startup, resolved once and then shared
/// read-only with the handlers.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub host: String,
    pub port: u16,
    pub ytdlp_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub resolve_timeout: Duration,
    pub resolve_retries: u32,
    pub stream_timeout: Duration,
    pub chunk_size: usize,
    pub delivery_mode: DeliveryMode,
    pub mirror_policy: MirrorPolicy,
    pub mirror_host: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MEDIARELAY_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("MEDIARELAY_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let ytdlp_path = overrides
        .ytdlp_path
        .or_else(|| lookup("YTDLP_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let cookies_file = lookup("YTDLP_COOKIES").map(PathBuf::from);

    let resolve_timeout = Duration::from_secs(
        parsed("RESOLVE_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_RESOLVE_TIMEOUT_SECS),
    );
    let resolve_retries = parsed("RESOLVE_RETRIES")
        .map(|value| value.min(u64::from(MAX_RESOLVE_RETRIES)) as u32)
        .unwrap_or(0);
    let stream_timeout = Duration::from_secs(
        parsed("STREAM_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_STREAM_TIMEOUT_SECS),
    );
    let chunk_size = parsed("STREAM_CHUNK_BYTES")
        .map(|value| (value as usize).max(MIN_CHUNK_BYTES))
        .unwrap_or(DEFAULT_CHUNK_BYTES);

    let delivery_mode = lookup("DELIVERY_MODE")
        .as_deref()
        .and_then(DeliveryMode::parse)
        .unwrap_or_default();
    let mirror_policy = lookup("MIRROR_POLICY")
        .as_deref()
        .and_then(MirrorPolicy::parse)
        .unwrap_or_default();
    let mirror_host = lookup("MIRROR_HOST").unwrap_or_else(|| DEFAULT_MIRROR_HOST.to_string());
    let user_agent = lookup("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    RuntimeSettings {
        host,
        port,
        ytdlp_path,
        cookies_file,
        resolve_timeout,
        resolve_retries,
        stream_timeout,
        chunk_size,
        delivery_mode,
        mirror_policy,
        mirror_host,
        user_agent,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
