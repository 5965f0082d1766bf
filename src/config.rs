use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com";
const DEFAULT_DATABASE: &str = "(default)";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
/// Token the Firestore emulator accepts as an admin credential.
const EMULATOR_TOKEN: &str = "owner";

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Firestore connection settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FirestoreConfig {
    /// Google Cloud project ID
    pub project_id: Option<String>,
    /// Database ID (default: "(default)")
    pub database: Option<String>,
    /// REST endpoint, e.g. "http://localhost:8080" for the emulator
    pub base_url: Option<String>,
    /// OAuth2 bearer token
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

impl FirestoreConfig {
    /// Returns true if a project is configured
    pub fn is_configured(&self) -> bool {
        self.project_id.is_some()
    }

    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Upper bound for every database request, in seconds
    pub request_timeout_secs: ConfigValue<u64>,
    /// How often `package watch` polls Firestore, in milliseconds
    pub poll_interval_ms: ConfigValue<u64>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Firestore configuration
    pub firestore: FirestoreConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    request_timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    firestore: Option<FirestoreConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_path, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::load`] with an explicit environment lookup.
    pub fn load_with_env(
        config_path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut request_timeout_secs =
            ConfigValue::new(DEFAULT_REQUEST_TIMEOUT_SECS, ConfigSource::Default);
        let mut poll_interval_ms =
            ConfigValue::new(DEFAULT_POLL_INTERVAL_MS, ConfigSource::Default);
        let mut config_file = None;
        let mut firestore = FirestoreConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(secs) = file_config.request_timeout_secs {
                request_timeout_secs = ConfigValue::new(secs, ConfigSource::File);
            }
            if let Some(ms) = file_config.poll_interval_ms {
                poll_interval_ms = ConfigValue::new(ms, ConfigSource::File);
            }
            if let Some(firestore_config) = file_config.firestore {
                firestore = firestore_config;
            }
        }

        // Apply environment variable overrides
        if let Some(secs) = env("HOMESTAY_REQUEST_TIMEOUT_SECS") {
            request_timeout_secs = ConfigValue::new(
                parse_number("HOMESTAY_REQUEST_TIMEOUT_SECS", &secs)?,
                ConfigSource::Environment,
            );
        }
        if let Some(ms) = env("HOMESTAY_POLL_INTERVAL_MS") {
            poll_interval_ms = ConfigValue::new(
                parse_number("HOMESTAY_POLL_INTERVAL_MS", &ms)?,
                ConfigSource::Environment,
            );
        }
        if let Some(project) = env("HOMESTAY_FIRESTORE_PROJECT") {
            firestore.project_id = Some(project);
        }
        if let Some(database) = env("HOMESTAY_FIRESTORE_DATABASE") {
            firestore.database = Some(database);
        }
        if let Some(url) = env("HOMESTAY_FIRESTORE_URL") {
            firestore.base_url = Some(url);
        } else if let Some(host) = env("FIRESTORE_EMULATOR_HOST") {
            firestore.base_url = Some(format!("http://{}", host));
            if firestore.access_token.is_none() {
                firestore.access_token = Some(EMULATOR_TOKEN.to_string());
            }
        }
        if let Some(token) = env("HOMESTAY_ACCESS_TOKEN") {
            firestore.access_token = Some(token);
        }

        if request_timeout_secs.value == 0 {
            return Err(ConfigError::InvalidValue(
                "request_timeout_secs".to_string(),
                "0".to_string(),
            ));
        }
        if poll_interval_ms.value == 0 {
            return Err(ConfigError::InvalidValue(
                "poll_interval_ms".to_string(),
                "0".to_string(),
            ));
        }

        Ok(Self {
            request_timeout_secs,
            poll_interval_ms,
            config_file,
            firestore,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.value)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.value)
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/homestay/
    /// - macOS: ~/Library/Application Support/homestay/
    /// - Windows: %APPDATA%/homestay/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("homestay")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw.to_string()))
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(String, String),
    NotConfigured(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
            ConfigError::NotConfigured(what) => {
                write!(f, "{} is not configured. Add it to the config file.", what)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
