mod tests;
mod logging_config;
pub mod config;

pub use config::{
    CacheConfig, Config, ConfigError, IngestConfig, QueryConfig, RemoteConfig, RetrieveConfig,
    RouteConfig,
};
pub use logging_config::LoggingConfig;
