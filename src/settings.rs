use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::streaming::{Endpoint, RecognitionMode, SpeechError, MAX_FRAME_BYTES};

pub const REGION_ENV: &str = "SPEECH_REGION";
pub const LANGUAGE_ENV: &str = "SPEECH_LANGUAGE";
pub const LEGACY_ENDPOINT_ENV: &str = "SPEECH_LEGACY_ENDPOINT";
pub const SUBSCRIPTION_KEY_ENV: &str = "SPEECH_SUBSCRIPTION_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Azure region of the speech resource, e.g. `westus`.
    pub region: String,

    /// Recognition language sent as the `language` query parameter.
    pub language: String,

    pub mode: RecognitionMode,

    /// Connect to the fixed-host Bing speech endpoint (region is ignored).
    pub legacy_endpoint: bool,

    /// Upper bound for a single outbound frame. Values above 8192 are clamped.
    pub max_frame_bytes: usize,

    /// How often the token renewal task fetches a fresh token.
    /// Tokens are valid for 10 minutes.
    pub token_refresh_minutes: u64,

    /// Only ever taken from the environment, never written to disk.
    #[serde(skip)]
    pub subscription_key: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            region: "westus".to_string(),
            language: "en-US".to_string(),
            mode: RecognitionMode::Interactive,
            legacy_endpoint: false,
            max_frame_bytes: MAX_FRAME_BYTES,
            token_refresh_minutes: 9,
            subscription_key: None,
        }
    }
}

impl ClientSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            region: self.region.clone(),
            language: self.language.clone(),
            mode: self.mode,
            legacy: self.legacy_endpoint,
        }
    }

    pub fn frame_limit(&self) -> usize {
        self.max_frame_bytes.min(MAX_FRAME_BYTES)
    }

    /// Override fields from `SPEECH_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(region) = lookup(REGION_ENV) {
            self.region = region;
        }
        if let Some(language) = lookup(LANGUAGE_ENV) {
            self.language = language;
        }
        if let Some(legacy) = lookup(LEGACY_ENDPOINT_ENV) {
            self.legacy_endpoint = matches!(
                legacy.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(key) = lookup(SUBSCRIPTION_KEY_ENV) {
            self.subscription_key = Some(key);
        }
    }
}

/// Read settings from `path`. A missing or unreadable file yields defaults.
pub fn load_settings(path: impl AsRef<Path>) -> ClientSettings {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings(path: impl AsRef<Path>, settings: &ClientSettings) -> Result<(), SpeechError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            SpeechError::Io(format!("Failed to create config directory {:?}: {}", parent, e))
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| SpeechError::Io(format!("Serialize settings: {}", e)))?;

    // Temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| SpeechError::Io(format!("Write temp settings {:?}: {}", tmp_path, e)))?;

    // rename() does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(SpeechError::Io(format!(
                    "Remove existing settings file {:?}: {}",
                    path, e
                )));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        SpeechError::Io(format!(
            "Rename temp settings {:?} to {:?}: {}",
            tmp_path, path, e
        ))
    })
}
