//! Persisted key configuration: a flat `KEY=VALUE` file at
//! `~/.syl-listing-pro/.env`. Updates preserve unrelated lines, comments,
//! and the trailing newline; values may be quoted.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::rules::APP_NAME;

pub const KEY_ENV_NAME: &str = "SYL_LISTING_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("syl_listing_key_not_configured")]
    KeyNotConfigured,
    #[error("读取用户目录失败")]
    NoHomeDir,
    #[error("读取 .env 失败: {0}")]
    ReadEnv(std::io::Error),
    #[error("写 .env 失败: {0}")]
    WriteEnv(std::io::Error),
    #[error("创建配置目录失败: {0}")]
    CreateDir(std::io::Error),
}

pub fn default_app_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(format!(".{APP_NAME}")))
}

pub fn default_env_path() -> Result<PathBuf, ConfigError> {
    Ok(default_app_dir()?.join(".env"))
}

pub fn load_listing_key() -> Result<String, ConfigError> {
    load_listing_key_from(&default_env_path()?)
}

pub fn save_listing_key(key: &str) -> Result<(), ConfigError> {
    save_listing_key_to(&default_env_path()?, key)
}

pub fn load_listing_key_from(path: &Path) -> Result<String, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::KeyNotConfigured)
        }
        Err(e) => return Err(ConfigError::ReadEnv(e)),
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.trim() != KEY_ENV_NAME {
            continue;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        if value.is_empty() {
            return Err(ConfigError::KeyNotConfigured);
        }
        return Ok(value.to_string());
    }
    Err(ConfigError::KeyNotConfigured)
}

pub fn save_listing_key_to(path: &Path, key: &str) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(ConfigError::CreateDir)?;
    }
    let entry = format!("{KEY_ENV_NAME}={key}");

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return std::fs::write(path, format!("{entry}\n")).map_err(ConfigError::WriteEnv);
        }
        Err(e) => return Err(ConfigError::ReadEnv(e)),
    };

    let mut lines: Vec<String> = raw.split('\n').map(str::to_string).collect();
    let mut replaced = false;
    for line in lines.iter_mut() {
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let Some((name, _)) = text.split_once('=') else {
            continue;
        };
        if name.trim() == KEY_ENV_NAME {
            *line = entry.clone();
            replaced = true;
        }
    }
    if !replaced {
        if let Some(last) = lines.last() {
            if !last.trim().is_empty() {
                lines.push(String::new());
            }
        }
        lines.push(entry);
    }
    let mut content = lines.join("\n");
    if !content.ends_with('\n') {
        content.push('\n');
    }
    std::fs::write(path, content).map_err(ConfigError::WriteEnv)
}
