use std::collections::HashSet;
use std::path::{Path, PathBuf};

use dimse::{DimseConfig, FindQuery, QueryKey, QueryLevel, QueryRoot, RemoteNode};
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

use crate::config::logging_config::LoggingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid [remote] section: {0}")]
    InvalidRemote(String),

    #[error("Invalid [local] section: {0}")]
    InvalidLocal(String),

    #[error("Invalid [query] section: {0}")]
    InvalidQuery(String),

    #[error("Invalid route #{index}: {reason}")]
    InvalidRoute { index: usize, reason: String },

    #[error("Invalid [ingest] section: {0}")]
    InvalidIngest(String),

    #[error("Invalid [logging] section: {0}")]
    InvalidLogging(String),

    #[error("Failed to read allow-list {path}: {source}")]
    AllowList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Application configuration, one TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub local: DimseConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub retrieve: RetrieveConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The archive queried and retrieved from
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_aet")]
    pub ae_title: String,
    pub host: String,
    #[serde(default = "dimse::config::default_remote_port")]
    pub port: u16,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub level: QueryLevel,
    pub root: QueryRoot,
    pub patient_id: String,
    pub referring_physician: Option<String>,
    pub series_description: Option<String>,
    pub study_description: Option<String>,
    /// Overrides `[local] optional_keys_pending_is_match` when set
    pub optional_keys_pending_is_match: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    pub allow_list: Vec<String>,
    pub allow_list_file: Option<PathBuf>,
    pub halt_on_destination_unknown: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Output directory of the store receiver; `[local] storage_dir` when unset
    pub dir: Option<PathBuf>,
    pub clear_before_batch: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
    pub program: String,
    /// `{dir}`, `{group}` and `{project}` are substituted per route
    pub args: Vec<String>,
}

/// One `[[routes]]` entry of the transfer workflow
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub patient_id_prefix: String,
    #[serde(default = "wildcard")]
    pub referring_physician: String,
    pub group: String,
    pub project: String,
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote_node()
            .validate()
            .map_err(|e| ConfigError::InvalidRemote(e.to_string()))?;
        self.dimse_config()
            .validate()
            .map_err(|e| ConfigError::InvalidLocal(e.to_string()))?;
        self.query.validate()?;

        for (index, route) in self.routes.iter().enumerate() {
            route
                .validate()
                .map_err(|reason| ConfigError::InvalidRoute { index, reason })?;
        }

        if self.ingest.enabled && self.ingest.program.trim().is_empty() {
            return Err(ConfigError::InvalidIngest(
                "program cannot be empty when ingestion is enabled".to_string(),
            ));
        }

        self.logging.validate()
    }

    pub fn remote_node(&self) -> RemoteNode {
        let node = RemoteNode::new(&self.remote.ae_title, &self.remote.host, self.remote.port);
        match self.remote.connect_timeout_ms {
            Some(timeout) => node.with_timeout(timeout),
            None => node,
        }
    }

    /// Settings of the protocol crate: local identity, receiver and timeouts
    pub fn dimse_config(&self) -> DimseConfig {
        let mut config = self.local.clone();
        config.storage_dir = self.output_dir().to_path_buf();
        if let Some(is_match) = self.query.optional_keys_pending_is_match {
            config.optional_keys_pending_is_match = is_match;
        }
        config
    }

    /// Where retrieved objects land
    pub fn output_dir(&self) -> &Path {
        self.cache.dir.as_deref().unwrap_or(&self.local.storage_dir)
    }
}

impl QueryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.level == QueryLevel::Image {
            return Err(ConfigError::InvalidQuery(
                "searches run at PATIENT, STUDY or SERIES level".to_string(),
            ));
        }
        if self.patient_id.trim().is_empty() {
            return Err(ConfigError::InvalidQuery(
                "patient_id cannot be empty, use \"*\" to match everything".to_string(),
            ));
        }
        Ok(())
    }

    /// Query descriptor for the configured level and matching keys
    pub fn to_find_query(&self) -> FindQuery {
        let query = match self.level {
            QueryLevel::Patient => FindQuery::new(QueryLevel::Patient)
                .with_match(QueryKey::PatientId, self.patient_id.as_str())
                .with_return_key(QueryKey::PatientName),
            QueryLevel::Series | QueryLevel::Image => FindQuery::series(
                self.series_description.as_deref().unwrap_or("*"),
            )
            .with_match(QueryKey::PatientId, self.patient_id.as_str())
            .with_return_keys([QueryKey::SeriesTime, QueryKey::StudyDate]),
            QueryLevel::Study => FindQuery::study(
                &self.patient_id,
                self.referring_physician.as_deref().unwrap_or("*"),
            ),
        };

        let query = match &self.study_description {
            Some(description) if self.level != QueryLevel::Patient => {
                query.with_match(QueryKey::StudyDescription, description.as_str())
            }
            _ => query,
        };
        query.with_root(self.root)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            level: QueryLevel::Study,
            root: QueryRoot::Study,
            patient_id: wildcard(),
            referring_physician: None,
            series_description: None,
            study_description: None,
            optional_keys_pending_is_match: None,
        }
    }
}

impl RetrieveConfig {
    /// Identifiers retrieval is restricted to, `None` when unrestricted.
    ///
    /// The file holds one identifier per line; only the first comma separated
    /// column is read and blank lines are ignored.
    pub fn load_allow_list(&self) -> Result<Option<HashSet<String>>, ConfigError> {
        if self.allow_list.is_empty() && self.allow_list_file.is_none() {
            return Ok(None);
        }

        let mut allowed: HashSet<String> = self
            .allow_list
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        if let Some(path) = &self.allow_list_file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::AllowList {
                path: path.clone(),
                source,
            })?;
            allowed.extend(parse_allow_list(&text));
        }
        Ok(Some(allowed))
    }
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            allow_list_file: None,
            halt_on_destination_unknown: true,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "fw".to_string(),
            args: ["ingest", "dicom", "-y", "{dir}", "{group}", "{project}"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RouteConfig {
    fn validate(&self) -> Result<(), String> {
        if self.patient_id_prefix.trim().is_empty() {
            return Err("patient_id_prefix cannot be empty".to_string());
        }
        if self.group.trim().is_empty() || self.project.trim().is_empty() {
            return Err("group and project are required".to_string());
        }
        Ok(())
    }

    /// Study list search for this route
    pub fn to_find_query(&self, root: QueryRoot) -> FindQuery {
        FindQuery::study(&self.patient_id_prefix, &self.referring_physician).with_root(root)
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.group, self.project)
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.log_level
            .parse::<LevelFilter>()
            .map_err(|_| ConfigError::InvalidLogging(format!("unknown level '{}'", self.log_level)))?;
        if self.log_to_file && self.log_file_path.trim().is_empty() {
            return Err(ConfigError::InvalidLogging(
                "log_file_path is required when log_to_file is set".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_allow_list(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .filter_map(|line| line.split(',').next())
        .map(|id| id.trim().trim_matches('"').to_string())
        .filter(|id| !id.is_empty())
}

fn default_remote_aet() -> String {
    "ANY-SCP".to_string()
}

fn wildcard() -> String {
    "*".to_string()
}
