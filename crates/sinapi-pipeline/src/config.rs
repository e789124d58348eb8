use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use sinapi_core::{ArchiveFormat, ReferencePeriod, SourceType};
use sinapi_storage::{BackoffPolicy, HttpClientConfig, DEFAULT_BASE_URL};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

use crate::reconcile::PlaceholderTemplates;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reference year and month are required (SINAPI_YEAR / SINAPI_MONTH)")]
    MissingPeriod,
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("reading config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// `reset` drops and recreates every table on each run; `preserve` only
/// creates what is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    #[default]
    Reset,
    Preserve,
}

impl SchemaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Preserve => "preserve",
        }
    }
}

impl FromStr for SchemaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "preserve" => Ok(Self::Preserve),
            other => Err(format!("expected `reset` or `preserve`, got `{other}`")),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "sinapi".to_string(),
            user: "sinapi".to_string(),
            password: String::new(),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DbConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DbConfig,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub source_type: SourceType,
    pub format: ArchiveFormat,
    pub local_file: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub schema_mode: SchemaMode,
    pub base_url: String,
    pub proxy_list_url: Option<String>,
    pub proxy_max_attempts: usize,
    pub cooldown_minutes: i64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_download_attempts: usize,
    pub retry_delays_secs: Vec<u64>,
    pub placeholders: PlaceholderTemplates,
    pub deactivation_keywords: Vec<String>,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            year: None,
            month: None,
            source_type: SourceType::Referencia,
            format: ArchiveFormat::Xlsx,
            local_file: None,
            download_dir: PathBuf::from("./downloads"),
            reports_dir: PathBuf::from("./reports"),
            schema_mode: SchemaMode::Reset,
            base_url: DEFAULT_BASE_URL.to_string(),
            proxy_list_url: None,
            proxy_max_attempts: 10,
            cooldown_minutes: 10,
            http_timeout_secs: 30,
            user_agent: "sinapi-loader/0.1".to_string(),
            max_download_attempts: 4,
            retry_delays_secs: vec![10, 30, 60],
            placeholders: PlaceholderTemplates::default(),
            deactivation_keywords: vec![
                "DEACTIVATION".to_string(),
                "DESATIVACAO".to_string(),
                "DESATIVAÇÃO".to_string(),
            ],
            scheduler_enabled: false,
            cron: "0 0 6 10 * *".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// YAML file first, then environment variables on top.
    pub fn from_yaml_file_and_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_yaml_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `SINAPI_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SINAPI_DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("SINAPI_DB_PORT") {
            self.database.port = parse_value("SINAPI_DB_PORT", &v)?;
        }
        if let Some(v) = get("SINAPI_DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("SINAPI_DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("SINAPI_DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = get("SINAPI_YEAR") {
            self.year = Some(parse_value("SINAPI_YEAR", &v)?);
        }
        if let Some(v) = get("SINAPI_MONTH") {
            self.month = Some(parse_value("SINAPI_MONTH", &v)?);
        }
        if let Some(v) = get("SINAPI_SOURCE_TYPE") {
            self.source_type = parse_value("SINAPI_SOURCE_TYPE", &v)?;
        }
        if let Some(v) = get("SINAPI_FORMAT") {
            self.format = parse_value("SINAPI_FORMAT", &v)?;
        }
        if let Some(v) = get("SINAPI_LOCAL_FILE") {
            self.local_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SINAPI_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SINAPI_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SINAPI_SCHEMA_MODE") {
            self.schema_mode = parse_value("SINAPI_SCHEMA_MODE", &v)?;
        }
        if let Some(v) = get("SINAPI_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("SINAPI_PROXY_LIST_URL") {
            self.proxy_list_url = Some(v);
        }
        if let Some(v) = get("SINAPI_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_value("SINAPI_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("SINAPI_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("SINAPI_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = get("SINAPI_CRON") {
            self.cron = v;
        }
        Ok(())
    }

    /// Checks everything except the reference period.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.database.name.trim().is_empty() {
            return Err(ConfigError::Invalid("database name must not be empty".into()));
        }
        if self.database.user.trim().is_empty() {
            return Err(ConfigError::Invalid("database user must not be empty".into()));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http timeout must be greater than zero".into()));
        }
        if self.max_download_attempts == 0 {
            return Err(ConfigError::Invalid("at least one download attempt is required".into()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base url must not be empty".into()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<ReferencePeriod, ConfigError> {
        self.validate_settings()?;
        period_from(self.year, self.month)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.max_download_attempts,
                delays: self
                    .retry_delays_secs
                    .iter()
                    .map(|secs| Duration::from_secs(*secs))
                    .collect(),
            },
            system_proxy: true,
        }
    }
}

pub fn period_from(year: Option<i32>, month: Option<u32>) -> Result<ReferencePeriod, ConfigError> {
    let (Some(year), Some(month)) = (year, month) else {
        return Err(ConfigError::MissingPeriod);
    };
    if !(1..=12).contains(&month) {
        return Err(ConfigError::InvalidValue {
            key: "month",
            value: month.to_string(),
            reason: "must be between 1 and 12".into(),
        });
    }
    if year < 2000 {
        return Err(ConfigError::InvalidValue {
            key: "year",
            value: year.to_string(),
            reason: "releases start in 2000".into(),
        });
    }
    ReferencePeriod::new(year, month).map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
