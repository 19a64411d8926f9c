use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ai::{AiConfig, DEFAULT_PROMPT};
use crate::engine::{EngineConfig, Tier};
use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            language: default_language(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_search_threshold")]
    pub search_threshold: f64,
    #[serde(default)]
    pub prompt_file: Option<String>,
    #[serde(default)]
    pub ai: AiSettings,
}

fn default_currency() -> String {
    "BRL".to_string()
}

fn default_search_threshold() -> f64 {
    0.8
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_language() -> String {
    "pt-br".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            currency: default_currency(),
            search_threshold: default_search_threshold(),
            prompt_file: None,
            ai: AiSettings::default(),
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand_path(&self.data_dir)).join("tally.db")
    }

    pub fn engine_config(&self, max_tier: Tier) -> EngineConfig {
        EngineConfig {
            search_threshold: self.search_threshold,
            max_tier,
            ..EngineConfig::default()
        }
    }

    /// Prompt text from `prompt_file`, or the built-in prompt.
    pub fn prompt(&self) -> Result<String> {
        match &self.prompt_file {
            Some(path) => std::fs::read_to_string(shellexpand_path(path))
                .map_err(|e| TallyError::Settings(format!("cannot read prompt file {path}: {e}"))),
            None => Ok(DEFAULT_PROMPT.to_string()),
        }
    }

    pub fn ai_config(&self, api_key: String) -> Result<AiConfig> {
        Ok(AiConfig {
            api_key,
            model: self.ai.model.clone(),
            base_url: self.ai.base_url.clone(),
            language: self.ai.language.clone(),
            prompt: self.prompt()?,
            max_retries: self.ai.max_retries,
            timeout_secs: self.ai.timeout_secs,
        })
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tally")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("tally")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| TallyError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn settings_file_exists() -> bool {
    settings_path().exists()
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            data_dir: "/tmp/test".to_string(),
            search_threshold: 0.9,
            ..Settings::default()
        };
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.search_threshold, 0.9);
        assert_eq!(loaded.ai.model, "gpt-4o-mini");
    }

    #[test]
    fn test_load_returns_defaults_when_missing() {
        let s = Settings::default();
        assert_eq!(s.currency, "BRL");
        assert_eq!(s.search_threshold, 0.8);
        assert_eq!(s.ai.language, "pt-br");
        assert_eq!(s.ai.max_retries, 2);
        assert!(s.db_path().ends_with("tally.db"));
    }

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test", "ai": {"model": "gpt-4.1-mini"}}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.search_threshold, 0.8);
        assert_eq!(s.ai.model, "gpt-4.1-mini");
        assert_eq!(s.ai.base_url, "https://api.openai.com/v1");
        assert_eq!(s.db_path(), PathBuf::from("/tmp/test/tally.db"));
    }

    #[test]
    fn test_engine_and_ai_config() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = dir.path().join("prompt.txt");
        std::fs::write(&prompt, "Categorize.").unwrap();
        let settings = Settings {
            search_threshold: 0.7,
            prompt_file: Some(prompt.to_string_lossy().to_string()),
            ..Settings::default()
        };
        let engine = settings.engine_config(Tier::Search);
        assert_eq!(engine.search_threshold, 0.7);
        assert_eq!(engine.max_tier, Tier::Search);
        let ai = settings.ai_config("sk-test".into()).unwrap();
        assert_eq!(ai.prompt, "Categorize.");
        assert_eq!(ai.api_key, "sk-test");
        assert_eq!(ai.timeout_secs, 30);
    }

    #[test]
    fn test_missing_prompt_file_is_an_error() {
        let settings = Settings {
            prompt_file: Some("/nonexistent/prompt.txt".into()),
            ..Settings::default()
        };
        assert!(matches!(settings.prompt(), Err(TallyError::Settings(_))));
    }
}
