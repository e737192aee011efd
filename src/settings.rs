use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::reconnect::ReconnectPolicy;
use crate::streaming::SessionConfig;

const SETTINGS_DIR_NAME: &str = "voicelink";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Query parameter carrying the credential on the connection URL
const API_KEY_PARAM: &str = "apikey";

pub const ENV_URL: &str = "VOICELINK_URL";
pub const ENV_API_KEY: &str = "VOICELINK_API_KEY";
pub const ENV_API_KEY_FALLBACK: &str = "OPENAI_API_KEY";
pub const ENV_INSTRUCTIONS: &str = "VOICELINK_INSTRUCTIONS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Settings I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("No API key configured (set VOICELINK_API_KEY or apiKey in settings)")]
    MissingCredential,
}

fn io_error(path: &Path, source: std::io::Error) -> SettingsError {
    SettingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where to connect and the credential to authenticate with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint with the credential as its `apikey` query parameter
    pub url: Url,
    /// Sent again in the auth frame once the socket opens
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Realtime WebSocket endpoint (`ws://` or `wss://`).
    pub endpoint_url: String,

    /// Credential sent as the `apikey` query parameter and in the auth frame.
    /// When empty, an `apikey` already in `endpoint_url` is used instead.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// System instructions; also seeds the transcript's instruction message.
    pub instructions: Option<String>,

    /// Voice for audio responses.
    pub voice: Option<String>,

    /// Ping period. Pings are sent on this fixed interval regardless of traffic.
    pub keepalive_interval_ms: u64,

    /// Consecutive pings without a pong before the connection is treated as lost.
    /// 0 disables the check.
    pub max_missed_pongs: u32,

    /// Handshake timeout for each connection attempt.
    pub connect_timeout_ms: u64,

    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
                .to_string(),
            api_key: String::new(),
            instructions: None,
            voice: Some("alloy".to_string()),
            keepalive_interval_ms: 20_000,
            max_missed_pongs: 2,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Apply `VOICELINK_*` environment variables on top of the file settings
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var(ENV_URL) {
            log::debug!("Settings: endpoint from {}", ENV_URL);
            self.endpoint_url = url;
        }
        if let Some(key) = var(ENV_API_KEY).or_else(|| var(ENV_API_KEY_FALLBACK)) {
            self.api_key = key;
        }
        if let Some(instructions) = var(ENV_INSTRUCTIONS) {
            self.instructions = Some(instructions);
        }
    }

    /// Resolve the connection URL and the credential it carries.
    ///
    /// `api_key` wins over an `apikey` already present in `endpoint_url`; the
    /// URL parameter is used only when `api_key` is empty. Either way the URL
    /// ends up with exactly one `apikey`, equal to the returned credential.
    pub fn endpoint(&self) -> Result<Endpoint, SettingsError> {
        let mut url = Url::parse(&self.endpoint_url)
            .map_err(|e| SettingsError::InvalidUrl(format!("{}: {}", self.endpoint_url, e)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SettingsError::InvalidUrl(format!(
                "unsupported scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }

        let mut from_url = None;
        let mut retained = Vec::new();
        for (key, value) in url.query_pairs() {
            if key == API_KEY_PARAM {
                from_url = Some(value.into_owned());
            } else {
                retained.push((key.into_owned(), value.into_owned()));
            }
        }

        let credential = if !self.api_key.is_empty() {
            if from_url.as_deref().is_some_and(|k| k != self.api_key) {
                log::warn!("Settings: apiKey overrides the apikey in endpointUrl");
            }
            self.api_key.clone()
        } else {
            from_url
                .filter(|k| !k.is_empty())
                .ok_or(SettingsError::MissingCredential)?
        };

        url.set_query(None);
        url.query_pairs_mut()
            .extend_pairs(retained)
            .append_pair(API_KEY_PARAM, &credential);

        Ok(Endpoint { url, credential })
    }

    /// `session.update` payload for this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            ..SessionConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.endpoint().map(|_| ())
    }
}

/// `<config_dir>/voicelink/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from `path`; a missing file yields defaults
pub fn load_settings(path: &Path) -> Result<SessionSettings, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let settings = serde_json::from_str::<SessionSettings>(&contents)?;
            log::debug!("Settings: loaded {:?}", path);
            Ok(settings)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("Settings: {:?} not found, using defaults", path);
            Ok(SessionSettings::default())
        }
        Err(e) => Err(io_error(path, e)),
    }
}

pub fn save_settings(path: &Path, settings: &SessionSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|e| io_error(&tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_error(path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| io_error(path, e))?;
    log::info!("Settings: saved {:?}", path);
    Ok(())
}
