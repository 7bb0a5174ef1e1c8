//! Downstream handoff of a populated cache directory

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::IngestConfig;

/// Where an ingestion lands downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub group: String,
    pub project: String,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Ingest directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("Failed to run {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self, dir: &Path, key: &RoutingKey) -> Result<IngestReport, IngestError>;
}

/// Runs an external program, `fw ingest dicom -y <dir> <group> <project>` by default
#[derive(Debug, Clone)]
pub struct CommandIngestor {
    program: String,
    args: Vec<String>,
}

impl CommandIngestor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(&config.program, config.args.clone())
    }

    fn command_args(&self, dir: &Path, key: &RoutingKey) -> Vec<String> {
        let dir = dir.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{dir}", &dir)
                    .replace("{group}", &key.group)
                    .replace("{project}", &key.project)
            })
            .collect()
    }
}

#[async_trait]
impl Ingestor for CommandIngestor {
    async fn ingest(&self, dir: &Path, key: &RoutingKey) -> Result<IngestReport, IngestError> {
        if !dir.is_dir() {
            return Err(IngestError::MissingDirectory(dir.to_path_buf()));
        }

        let args = self.command_args(dir, key);
        info!("Ingesting {} into {}/{}", dir.display(), key.group, key.project);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|source| IngestError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let report = IngestReport {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !report.success {
            warn!(
                "{} exited with {:?}: {}",
                self.program,
                report.exit_code,
                report.stderr.trim()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RoutingKey {
        RoutingKey {
            group: "caltech".to_string(),
            project: "qc".to_string(),
        }
    }

    #[test]
    fn default_arguments_follow_the_fw_cli() {
        let ingestor = CommandIngestor::from_config(&IngestConfig::default());
        let args = ingestor.command_args(Path::new("/data/dicom"), &key());
        assert_eq!(
            args,
            vec!["ingest", "dicom", "-y", "/data/dicom", "caltech", "qc"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_program_output() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = CommandIngestor::new(
            "sh",
            vec!["-c".to_string(), "echo {group}/{project}".to_string()],
        );

        let report = ingestor.ingest(dir.path(), &key()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.stdout.trim(), "caltech/qc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor =
            CommandIngestor::new("sh", vec!["-c".to_string(), "echo nope >&2; exit 3".to_string()]);

        let report = ingestor.ingest(dir.path(), &key()).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.stderr.trim(), "nope");
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = CommandIngestor::new("qrpull-no-such-program", Vec::new());

        let err = ingestor.ingest(dir.path(), &key()).await.unwrap_err();
        assert!(matches!(err, IngestError::Launch { .. }));
    }

    #[tokio::test]
    async fn missing_directory_is_refused() {
        let ingestor = CommandIngestor::from_config(&IngestConfig::default());
        let err = ingestor
            .ingest(Path::new("/nonexistent/qrpull/cache"), &key())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingDirectory(_)));
    }
}
