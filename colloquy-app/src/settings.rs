//! Host settings: JSON file with environment overrides.
//!
//! Search order per field: environment variable, then `colloquy.json` next
//! to the working directory (or `COLLOQUY_SETTINGS` if set), then the
//! built-in default. The credential itself never appears here — the token
//! endpoint is fetched per session and the secret is never persisted.

use std::path::{Path, PathBuf};

use colloquy_core::SessionConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    /// HTTP endpoint issuing the short-lived connection secret.
    pub token_url: String,
    /// WebSocket endpoint of the speech service.
    pub realtime_url: String,
    /// Synthesized voice name.
    pub voice: String,
    /// System instructions for the model.
    pub instructions: Option<String>,
    /// Preferred input device name; `None` uses the system default.
    pub input_device: Option<String>,
    /// Playback gain in [0.0, 1.0].
    pub playback_gain: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            token_url: defaults.token_url,
            realtime_url: defaults.realtime_url,
            voice: defaults.voice,
            instructions: None,
            input_device: None,
            playback_gain: 1.0,
        }
    }
}

impl AppSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            realtime_url: self.realtime_url.clone(),
            token_url: self.token_url.clone(),
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            preferred_input_device: self.input_device.clone(),
            playback_gain: self.playback_gain,
            ..SessionConfig::default()
        }
    }
}

/// Path of the settings file: `COLLOQUY_SETTINGS` or `./colloquy.json`.
pub fn default_settings_path() -> PathBuf {
    std::env::var_os("COLLOQUY_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("colloquy.json"))
}

/// Load settings from `path`, falling back to defaults when the file is
/// missing or unreadable, then apply environment overrides.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<AppSettings>(&text) {
            Ok(s) => {
                info!(path = %path.display(), "settings loaded");
                s
            }
            Err(e) => {
                warn!(path = %path.display(), "settings file invalid ({e}), using defaults");
                AppSettings::default()
            }
        },
        Err(_) => AppSettings::default(),
    };
    apply_env_overrides(&mut settings);
    settings
}

fn apply_env_overrides(settings: &mut AppSettings) {
    if let Ok(v) = std::env::var("COLLOQUY_TOKEN_URL") {
        settings.token_url = v;
    }
    if let Ok(v) = std::env::var("COLLOQUY_REALTIME_URL") {
        settings.realtime_url = v;
    }
    if let Ok(v) = std::env::var("COLLOQUY_VOICE") {
        settings.voice = v;
    }
    if let Ok(v) = std::env::var("COLLOQUY_INPUT_DEVICE") {
        settings.input_device = Some(v);
    }
    if let Ok(v) = std::env::var("COLLOQUY_PLAYBACK_GAIN") {
        match v.parse::<f32>() {
            Ok(gain) => settings.playback_gain = gain.clamp(0.0, 1.0),
            Err(_) => warn!("COLLOQUY_PLAYBACK_GAIN is not a number, ignoring"),
        }
    }
}
