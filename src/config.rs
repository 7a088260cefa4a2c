//! Process-wide settings, read from a JSON file on boot.
//!
//! Unknown keys are ignored so that the admin layer can store its own
//! options in the same file. A missing file yields [`Settings::default`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`Settings::embedding_dir`].
pub const EMBEDDING_DIR_ENV: &str = "ASSISTANT_EMBEDDING_DIR";

const MIN_CTX: usize = 512;
const MAX_CTX: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_model_ctx")]
    pub model_ctx: usize,
    #[serde(default)]
    pub embedding_dir: Option<PathBuf>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Admin session lifetime; consumed by the admin layer, not by the core.
    #[serde(default = "default_ttl_admin_minutes")]
    pub ttl_admin_minutes: u64,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_note_chars")]
    pub note_chars: usize,
    #[serde(default = "default_rag_k")]
    pub rag_k: usize,
    #[serde(default = "default_rag_max_chars")]
    pub rag_max_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
}

fn default_model_ctx() -> usize {
    2048
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/index.sqlite")
}
fn default_ttl_admin_minutes() -> u64 {
    20
}
fn default_top_k() -> usize {
    5
}
fn default_note_chars() -> usize {
    240
}
fn default_rag_k() -> usize {
    4
}
fn default_rag_max_chars() -> usize {
    600
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> usize {
    256
}
fn default_assistant_name() -> String {
    "asistente".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: None,
            model_ctx: default_model_ctx(),
            embedding_dir: None,
            db_path: default_db_path(),
            ttl_admin_minutes: default_ttl_admin_minutes(),
            top_k: default_top_k(),
            note_chars: default_note_chars(),
            rag_k: default_rag_k(),
            rag_max_chars: default_rag_max_chars(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            assistant_name: default_assistant_name(),
        }
    }
}

impl Settings {
    /// Context window actually requested from the runtime.
    pub fn effective_ctx(&self) -> usize {
        self.model_ctx.clamp(MIN_CTX, MAX_CTX)
    }

    /// Encoder directory, with the environment override applied.
    pub fn resolved_embedding_dir(&self) -> Option<PathBuf> {
        match std::env::var_os(EMBEDDING_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => self.embedding_dir.clone(),
        }
    }

    /// File name of the index, used in listing footers.
    pub fn db_name(&self) -> String {
        self.db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.db_path.display().to_string())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::info!("settings file {} not found, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    parse_settings(&content)
}

pub fn parse_settings(content: &str) -> Result<Settings> {
    let settings: Settings =
        serde_json::from_str(content).with_context(|| "Failed to parse settings file")?;

    if settings.top_k == 0 {
        anyhow::bail!("top_k must be >= 1");
    }
    if settings.rag_max_chars == 0 {
        anyhow::bail!("rag_max_chars must be > 0");
    }
    if !(0.0..=2.0).contains(&settings.temperature) {
        anyhow::bail!("temperature must be in [0.0, 2.0]");
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_unknown_keys() {
        let s = parse_settings(r#"{"db_path": "/tmp/x.sqlite", "theme": "dark"}"#).unwrap();
        assert_eq!(s.db_path, PathBuf::from("/tmp/x.sqlite"));
        assert_eq!(s.model_ctx, 2048);
        assert_eq!(s.ttl_admin_minutes, 20);
        assert_eq!(s.top_k, 5);
        assert_eq!(s.db_name(), "x.sqlite");
    }

    #[test]
    fn test_ctx_clamp() {
        let s = parse_settings(r#"{"model_ctx": 32768}"#).unwrap();
        assert_eq!(s.effective_ctx(), 4096);
        let s = parse_settings(r#"{"model_ctx": 128}"#).unwrap();
        assert_eq!(s.effective_ctx(), 512);
        let s = parse_settings(r#"{"model_ctx": 3000}"#).unwrap();
        assert_eq!(s.effective_ctx(), 3000);
    }

    #[test]
    fn test_rejects_zero_top_k() {
        assert!(parse_settings(r#"{"top_k": 0}"#).is_err());
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conf").join("settings.json");
        let mut s = Settings::default();
        s.model_ctx = 4096;
        s.save(&path).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.model_ctx, 4096);
    }
}
