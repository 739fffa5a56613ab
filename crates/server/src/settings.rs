use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::auth::DEFAULT_USER_HEADER;

pub const SETTINGS_DIRECTORY_NAME: &str = "threadline";
pub const SETTINGS_FILE_NAME: &str = "server.json";
pub const DATABASE_FILE_NAME: &str = "streams.db";
pub const CONFIG_PATH_ENV: &str = "THREADLINE_CONFIG";
pub const ENV_PREFIX: &str = "THREADLINE_";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8787";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// How long completed and cancelled records are kept.
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            terminal_retention_secs: default_terminal_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RetentionSettings {
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_replay_retention_secs")]
    pub replay_retention_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            replay_retention_secs: default_replay_retention_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl RelaySettings {
    pub fn replay_retention(&self) -> Duration {
        Duration::from_secs(self.replay_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            echo_delay_ms: default_echo_delay_ms(),
        }
    }
}

impl GenerationSettings {
    pub fn echo_delay(&self) -> Duration {
        Duration::from_millis(self.echo_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub generation: GenerationSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_path: default_database_path(),
            auth: AuthSettings::default(),
            retention: RetentionSettings::default(),
            relay: RelaySettings::default(),
            generation: GenerationSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Defaults, then the JSON file when present, then `THREADLINE_*` variables
    /// (`__` separates nested keys, e.g. `THREADLINE_RETENTION__SWEEP_INTERVAL_SECS`).
    pub fn figment(config_path: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ServerSettings::default()));
        if config_path.exists() {
            figment = figment.merge(Json::file(config_path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", config_path);
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn extract(figment: &Figment) -> Result<Self, SettingsError> {
        let settings = figment.extract::<ServerSettings>().context(ExtractSnafu {
            stage: "extract-server-settings",
        })?;
        Ok(settings.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.bind_address = non_blank_or(self.bind_address, default_bind_address);
        self.database_path = non_blank_or(self.database_path, default_database_path);
        self.auth.user_header = non_blank_or(self.auth.user_header, default_user_header);

        // Zero would spin the sweeper and make broadcast channels panic.
        self.retention.sweep_interval_secs = self.retention.sweep_interval_secs.max(1);
        self.relay.channel_capacity = self.relay.channel_capacity.max(1);
        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load server settings on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

/// Live settings snapshot, swapped atomically on reload.
pub struct SettingsStore {
    settings: ArcSwap<ServerSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".threadline"))
    }

    /// `THREADLINE_CONFIG` when set, otherwise `<config dir>/threadline/server.json`.
    pub fn default_config_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default_config_dir().join(SETTINGS_FILE_NAME))
    }

    pub fn new(settings: ServerSettings, config_path: PathBuf) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings.normalized()),
            config_path,
        }
    }

    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(Self::default_config_path())
    }

    pub fn load_from(config_path: PathBuf) -> Result<Self, SettingsError> {
        let settings = ServerSettings::extract(&ServerSettings::figment(&config_path))?;
        Ok(Self::new(settings, config_path))
    }

    pub fn settings(&self) -> Arc<ServerSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Re-reads the file and environment. The previous snapshot stays active on error.
    pub fn reload(&self) -> Result<Arc<ServerSettings>, SettingsError> {
        let settings = ServerSettings::extract(&ServerSettings::figment(&self.config_path))?;
        self.replace(settings);
        tracing::info!("reloaded settings from {:?}", self.config_path);
        Ok(self.settings())
    }

    pub fn replace(&self, settings: ServerSettings) {
        self.settings.store(Arc::new(settings.normalized()));
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".threadline"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}

fn default_user_header() -> String {
    DEFAULT_USER_HEADER.to_string()
}

fn default_terminal_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_replay_retention_secs() -> u64 {
    15 * 60
}

fn default_channel_capacity() -> usize {
    256
}

fn default_echo_delay_ms() -> u64 {
    25
}
