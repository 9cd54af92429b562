use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use runtime_core::env::{HANDLER_ENV, env_parse_with, is_truthy};
use runtime_core::envelope::DEFAULT_CONTAINER;
use runtime_core::{ParamEnvelope, ParseBody};
use serde::Deserialize;
use thiserror::Error;

pub const SERVICE_NAME: &str = "wtlocal";
pub const CONFIG_FILE: &str = "wtlocal.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_container")]
    pub container: String,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Backing file for the storage cell; storage is memory-only without it.
    #[serde(default)]
    pub storage_file: Option<PathBuf>,

    /// Seed value for the storage cell. Takes precedence over `storage_file`.
    #[serde(default)]
    pub initial_storage: Option<serde_json::Value>,

    /// Fixture name or path to a handler source file.
    #[serde(default)]
    pub handler: Option<String>,

    /// Token placed in stamped envelopes. A development token is signed
    /// when absent.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub signing_secret: Option<String>,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(default)]
    pub envelope: EnvelopeDefaults,
}

fn default_port() -> u16 {
    8721
}

fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_log() -> String {
    "wtlocal=info,engine=info,http=info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            container: default_container(),
            max_body_size: default_max_body_size(),
            storage_file: None,
            initial_storage: None,
            handler: None,
            token: None,
            signing_secret: None,
            log: default_log(),
            envelope: EnvelopeDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseBodySetting {
    Never,
    Always,
    #[default]
    OnArity,
}

impl ParseBodySetting {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "never" | "0" => Some(Self::Never),
            "always" | "1" => Some(Self::Always),
            "on_arity" | "2" => Some(Self::OnArity),
            _ => None,
        }
    }
}

impl From<ParseBodySetting> for ParseBody {
    fn from(setting: ParseBodySetting) -> Self {
        match setting {
            ParseBodySetting::Never => ParseBody::Never,
            ParseBodySetting::Always => ParseBody::Always,
            ParseBodySetting::OnArity => ParseBody::OnArity,
        }
    }
}

/// Envelope stamped onto requests that arrive without an `x-wt-params`
/// header.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeDefaults {
    #[serde(default)]
    pub merge_body: bool,
    #[serde(default)]
    pub parse_body: ParseBodySetting,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl EnvelopeDefaults {
    pub fn to_envelope(&self, container: &str, token: Option<&str>) -> ParamEnvelope {
        ParamEnvelope {
            merge_body: self.merge_body,
            parse_body: self.parse_body.into(),
            params: self.params.clone(),
            secrets: self.secrets.clone(),
            meta: self.meta.clone(),
            container: Some(container.to_string()),
            auth_token: token.map(str::to_string),
            ..ParamEnvelope::default()
        }
    }
}

impl RuntimeConfig {
    /// Loads the first config file found on the search path, falling back
    /// to built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").ok();
        for path in config_search_paths(home.as_deref()) {
            if path.exists() {
                let cfg = Self::load_from(&path)?;
                tracing::info!("Loaded config from {}", path.display());
                return Ok(cfg);
            }
        }

        tracing::debug!("No {} found; using built-in defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(&|key: &str| std::env::var(key).ok())
    }

    pub fn apply_env_with<F>(&mut self, env_get: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_env("WTLOCAL_PORT", env_get)? {
            self.port = port;
        }
        if let Some(limit) = parse_env("WTLOCAL_MAX_BODY_SIZE", env_get)? {
            self.max_body_size = limit;
        }
        if let Some(container) = non_empty(env_get("WTLOCAL_CONTAINER")) {
            self.container = container;
        }
        if let Some(file) = non_empty(env_get("WTLOCAL_STORAGE_FILE")) {
            self.storage_file = Some(PathBuf::from(file));
        }
        if let Some(handler) = non_empty(env_get(HANDLER_ENV)) {
            self.handler = Some(handler);
        }
        if let Some(mode) = non_empty(env_get("WTLOCAL_PARSE_BODY")) {
            self.envelope.parse_body =
                ParseBodySetting::parse(&mode).ok_or(ConfigError::Env {
                    var: "WTLOCAL_PARSE_BODY",
                    value: mode,
                })?;
        }
        if let Some(flag) = env_get("WTLOCAL_MERGE_BODY") {
            self.envelope.merge_body = is_truthy(&flag);
        }
        Ok(())
    }

    pub fn default_envelope(&self) -> ParamEnvelope {
        self.envelope
            .to_envelope(&self.container, self.token.as_deref())
    }
}

fn parse_env<T, F>(var: &'static str, env_get: &F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    env_parse_with(var, env_get).map_err(|value| ConfigError::Env { var, value })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub fn config_search_paths(home: Option<&str>) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("./{}", CONFIG_FILE))];

    if let Some(home) = home {
        paths.push(
            PathBuf::from(home)
                .join(".config")
                .join(SERVICE_NAME)
                .join(CONFIG_FILE),
        );
    }

    paths.push(PathBuf::from(format!("/etc/{}/{}", SERVICE_NAME, CONFIG_FILE)));
    paths
}
