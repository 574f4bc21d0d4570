//! Chat presets stored as JSON files in the cache directory.
//!
//! A preset names the roles, the system prompt and any stop sequences.
//! Files written by older tools may carry escaped sequences (`\n`) inside
//! string values and call stop sequences `antiprompt`; both are accepted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PresetError;

pub const DEFAULT_PRESET_FILE: &str = "default.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_user_role")]
    pub user_role: String,
    #[serde(default = "default_assistant_role")]
    pub assistant_role: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default, alias = "antiprompt")]
    pub stop_sequences: Vec<String>,
}

fn default_user_role() -> String {
    "user".into()
}

fn default_assistant_role() -> String {
    "assistant".into()
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            name: String::new(),
            user_role: default_user_role(),
            assistant_role: default_assistant_role(),
            system_prompt: String::new(),
            stop_sequences: Vec::new(),
        }
    }
}

impl Preset {
    /// Decode escapes and fill in blanks after reading from disk.
    fn normalize(mut self, path: &Path) -> Self {
        if self.name.is_empty() {
            self.name = file_name(path);
        }
        self.user_role = non_empty(decode_escapes(&self.user_role), default_user_role);
        self.assistant_role = non_empty(decode_escapes(&self.assistant_role), default_assistant_role);
        self.system_prompt = decode_escapes(&self.system_prompt);
        self.stop_sequences = self
            .stop_sequences
            .iter()
            .map(|s| decode_escapes(s))
            .filter(|s| !s.is_empty())
            .collect();
        self
    }
}

fn non_empty(value: String, fallback: fn() -> String) -> String {
    if value.is_empty() { fallback() } else { value }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Turn literal `\n`, `\t`, `\r`, `\\` and `\"` sequences into the characters
/// they stand for. Anything else after a backslash is kept as written.
pub fn decode_escapes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// `<cache>/lm-studio-tts/config-presets`.
pub fn default_preset_dir() -> Result<PathBuf, PresetError> {
    directories::BaseDirs::new()
        .map(|d| d.cache_dir().join("lm-studio-tts").join("config-presets"))
        .ok_or(PresetError::NoDirectory)
}

/// Preset file names in `dir`, sorted case-insensitively. Creates the
/// directory if needed.
pub fn list_presets(dir: &Path) -> Result<Vec<String>, PresetError> {
    std::fs::create_dir_all(dir)?;
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "json") {
            names.push(file_name(&path));
        }
    }
    names.sort_by_key(|n| n.to_lowercase());
    Ok(names)
}

/// Load a preset. A missing file yields the default preset named after it.
pub fn load_preset(path: &Path) -> Result<Preset, PresetError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("preset: {} not found, using defaults", path.display());
            return Ok(Preset {
                name: file_name(path),
                ..Preset::default()
            });
        }
        Err(e) => return Err(e.into()),
    };
    let preset: Preset = serde_json::from_str(&raw)?;
    Ok(preset.normalize(path))
}

pub fn save_preset(preset: &Preset, path: &Path) -> Result<(), PresetError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(preset)?;
    std::fs::write(path, json)?;
    debug!("preset: saved {}", path.display());
    Ok(())
}
