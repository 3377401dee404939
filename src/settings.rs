//! Settings storage
//!
//! Persists the defaults used to build engines, sampler configurations and conversations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{Backend, EngineOptions};
use crate::error::{BridgeError, Result};
use crate::native::NativeRuntime;
use crate::sampler::{SamplerConfig, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P};

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Model file loaded by the engine
    pub model_path: PathBuf,
    /// Primary compute backend
    pub backend: Backend,
    /// Maximum number of tokens (context size) for the engine
    pub max_tokens: u32,
    /// Number of GPU layers to offload when the backend is `Gpu`
    pub gpu_layers: u32,
    pub use_external_cache_dir: bool,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f64,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f64,
    pub top_k: i32,
    /// Random seed (0 = random)
    pub seed: i32,
    /// System prompt for new conversations; empty means none
    pub system_prompt: String,
    /// Readiness poll interval while an engine initializes
    pub poll_interval_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            model_path: get_data_dir()
                .ok()
                .map(|d| d.join("models").join("model.gguf"))
                .unwrap_or_else(|| PathBuf::from("./models/model.gguf")),
            backend: Backend::Cpu,
            max_tokens: 1024,
            gpu_layers: 99,
            use_external_cache_dir: true,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            seed: 0,
            system_prompt: String::new(),
            poll_interval_ms: 16,
        }
    }
}

impl BridgeSettings {
    /// Clamps values into their accepted ranges.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k <= 0 {
            self.top_k = DEFAULT_TOP_K;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 1024;
        }

        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = 16;
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions::new(self.model_path.clone())
            .with_backend(self.backend)
            .with_max_tokens(self.max_tokens)
            .with_external_cache_dir(self.use_external_cache_dir)
    }

    pub fn sampler_config(&self, runtime: &Arc<dyn NativeRuntime>) -> Result<SamplerConfig> {
        SamplerConfig::new(runtime, self.temperature, self.top_p, self.top_k, self.seed)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when the system prompt is blank.
    pub fn system_prompt(&self) -> Option<&str> {
        Some(self.system_prompt.trim()).filter(|s| !s.is_empty())
    }
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\LocaLM\LocaLM`
/// - macOS: `/Users/{user}/Library/Application Support/com.LocaLM.LocaLM`
/// - Linux: `/home/{user}/.local/share/LocaLM`
pub fn get_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("com", "LocaLM", "LocaLM")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| BridgeError::Settings("Could not determine data directory".to_string()))
}

fn get_settings_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the data directory
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> BridgeSettings {
    match get_settings_path().and_then(|path| load_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            BridgeSettings::default()
        }
    }
}

/// Load settings from `path`; a missing file yields defaults.
pub fn load_from(path: &Path) -> Result<BridgeSettings> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(BridgeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: BridgeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &BridgeSettings) -> Result<()> {
    save_to(settings, &get_settings_path()?)
}

pub fn save_to(settings: &BridgeSettings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockRuntime;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.backend, Backend::Cpu);
        assert_eq!(settings.max_tokens, 1024);
        assert_eq!(settings.top_k, 64);
        assert!(settings.system_prompt().is_none());
        assert_eq!(settings.poll_interval(), Duration::from_millis(16));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = BridgeSettings::default();

        settings.temperature = 5.0;
        settings.top_p = -0.5;
        settings.top_k = 0;
        settings.max_tokens = 0;
        settings.poll_interval_ms = 0;
        settings.validate();

        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 0.0);
        assert_eq!(settings.top_k, 64);
        assert_eq!(settings.max_tokens, 1024);
        assert_eq!(settings.poll_interval_ms, 16);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = BridgeSettings {
            backend: Backend::Gpu,
            temperature: 0.3,
            system_prompt: "You are terse.".to_string(),
            ..BridgeSettings::default()
        };
        save_to(&settings, &path).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.system_prompt(), Some("You are terse."));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, BridgeSettings::default());
    }

    #[test]
    fn test_partial_file_is_completed_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "temperature": 9.0, "backend": "Gpu" }"#).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.temperature, 2.0);
        assert_eq!(loaded.backend, Backend::Gpu);
        assert_eq!(loaded.top_k, 64);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(load_from(&path), Err(BridgeError::Settings(_))));
    }

    #[test]
    fn test_builds_engine_options_and_sampler() {
        let settings = BridgeSettings {
            model_path: PathBuf::from("/models/gemma.gguf"),
            backend: Backend::Gpu,
            max_tokens: 2048,
            seed: 7,
            ..BridgeSettings::default()
        };
        let options = settings.engine_options();
        assert_eq!(options.model_path, PathBuf::from("/models/gemma.gguf"));
        assert_eq!(options.backend, Backend::Gpu);
        assert_eq!(options.max_tokens, 2048);

        let runtime: Arc<dyn NativeRuntime> = MockRuntime::new();
        let sampler = settings.sampler_config(&runtime).unwrap();
        assert_eq!(sampler.seed(), 7);
    }
}
