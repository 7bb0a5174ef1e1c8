//! The command-line workflows: echo, find, pull and transfer
//!
//! Each one wires the protocol components to the external collaborators
//! (CSV report, cache directory, ingestion command) according to the config.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dimse::{Connector, DimseScu, FilesystemStore, FindQuery, StoreHandler, UlConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Config, RouteConfig};
use crate::ingest::{CommandIngestor, IngestReport, Ingestor, RoutingKey};
use crate::ledger::ResultLedger;
use crate::orchestrator::{BatchReport, RetrieveOrchestrator};
use crate::storage::CacheDir;

/// Verification attempts before a workflow gives up on the archive
const ECHO_RETRIES: u32 = 2;

/// Result of `pull`
#[derive(Debug, Clone)]
pub struct PullReport {
    pub ledger: ResultLedger,
    pub batch: BatchReport,
}

/// Result of one `[[routes]]` entry of `transfer`
#[derive(Debug, Clone)]
pub struct RouteReport {
    pub route: String,
    pub ledger: ResultLedger,
    pub batch: BatchReport,
    /// Files in the cache after the batch
    pub files: usize,
    pub ingest: Option<IngestReport>,
    /// Ingestion program could not be run
    pub ingest_error: Option<String>,
    /// Search failure that ended this route early
    pub error: Option<String>,
}

impl RouteReport {
    fn new(route: &RouteConfig) -> Self {
        Self {
            route: route.label(),
            ledger: ResultLedger::new(),
            batch: BatchReport::default(),
            files: 0,
            ingest: None,
            ingest_error: None,
            error: None,
        }
    }

    pub fn ingest_failed(&self) -> bool {
        self.ingest.as_ref().is_some_and(|r| !r.success) || self.ingest_error.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    pub routes: Vec<RouteReport>,
    /// Routes never started
    pub skipped_routes: Vec<String>,
}

pub struct Workflow {
    config: Config,
    connector: Arc<dyn Connector>,
    store: Arc<dyn StoreHandler>,
    ingestor: Arc<dyn Ingestor>,
    cancel: CancellationToken,
}

impl Workflow {
    pub fn new(config: Config) -> Self {
        Self {
            connector: Arc::new(UlConnector::new(config.dimse_config())),
            store: Arc::new(FilesystemStore::new(config.output_dir())),
            ingestor: Arc::new(CommandIngestor::from_config(&config.ingest)),
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_ingestor(mut self, ingestor: Arc<dyn Ingestor>) -> Self {
        self.ingestor = ingestor;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn scu(&self) -> DimseScu {
        DimseScu::with_connector(self.config.dimse_config(), self.connector.clone())
            .with_root(self.config.query.root)
    }

    fn orchestrator(&self) -> RetrieveOrchestrator {
        RetrieveOrchestrator::new(self.scu(), self.store.clone())
            .with_halt_on_destination_unknown(self.config.retrieve.halt_on_destination_unknown)
    }

    fn cache(&self) -> CacheDir {
        CacheDir::new(self.config.output_dir())
    }

    /// Verify the archive answers C-ECHO
    pub async fn echo(&self) -> Result<()> {
        let remote = self.config.remote_node();
        self.scu()
            .test_connection(&remote, ECHO_RETRIES)
            .await
            .with_context(|| format!("{} is not answering C-ECHO", remote))
    }

    /// Search with the configured query, optionally writing the CSV report
    pub async fn find(&self, csv: Option<&Path>) -> Result<ResultLedger> {
        self.echo().await?;
        let ledger = self.search(&self.config.query.to_find_query()).await?;
        if let Some(path) = csv {
            write_csv(&ledger, path).await?;
        }
        Ok(ledger)
    }

    /// Search, filter by the allow-list and retrieve everything that is left
    pub async fn pull(&self, csv: Option<&Path>) -> Result<PullReport> {
        self.echo().await?;
        let ledger = self.search(&self.config.query.to_find_query()).await?;
        if let Some(path) = csv {
            write_csv(&ledger, path).await?;
        }

        let allow = self.config.retrieve.load_allow_list()?;
        if let Some(allow) = &allow {
            info!("Restricting retrieval to {} allowed identifier(s)", allow.len());
        }
        let targets = ledger.targets(allow.as_ref());
        if targets.is_empty() {
            warn!("Nothing to retrieve");
        }

        let cache = self.cache();
        if self.config.cache.clear_before_batch {
            cache.clear()?;
        } else {
            cache.ensure()?;
        }

        let batch = self
            .orchestrator()
            .retrieve(&self.config.remote_node(), &targets, &self.cancel)
            .await?;
        Ok(PullReport { ledger, batch })
    }

    /// Run every route: search, retrieve into the cache, hand off, clear.
    ///
    /// A halted batch or a failed ingestion stops the remaining routes; in the
    /// latter case the cache is left in place for the operator.
    pub async fn transfer(&self) -> Result<TransferReport> {
        if self.config.routes.is_empty() {
            bail!("no [[routes]] configured");
        }
        if !self.config.ingest.enabled {
            warn!("Ingestion disabled: routes accumulate in {}", self.config.output_dir().display());
        }
        self.echo().await?;

        let cache = self.cache();
        let mut report = TransferReport::default();
        for (index, route) in self.config.routes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Transfer cancelled before route {}", route.label());
                report
                    .skipped_routes
                    .extend(self.config.routes[index..].iter().map(RouteConfig::label));
                break;
            }

            let span = info_span!("route", route = %route.label());
            let route_report = self.transfer_route(route, &cache).instrument(span).await?;
            let stop = route_report.batch.halted.is_some()
                || route_report.batch.cancelled
                || route_report.ingest_failed();
            report.routes.push(route_report);

            if stop {
                report
                    .skipped_routes
                    .extend(self.config.routes[index + 1..].iter().map(RouteConfig::label));
                break;
            }
        }
        Ok(report)
    }

    async fn transfer_route(&self, route: &RouteConfig, cache: &CacheDir) -> Result<RouteReport> {
        let mut report = RouteReport::new(route);
        if self.config.ingest.enabled {
            cache.clear()?;
        } else {
            cache.ensure()?;
        }

        let query = route.to_find_query(self.config.query.root);
        match self.search(&query).await {
            Ok(ledger) => report.ledger = ledger,
            Err(e) => {
                error!("Search for route {} failed: {:#}", report.route, e);
                report.error = Some(format!("{:#}", e));
                return Ok(report);
            }
        }

        let targets = report.ledger.targets(None);
        report.batch = self
            .orchestrator()
            .retrieve(&self.config.remote_node(), &targets, &self.cancel)
            .await?;
        report.files = cache.count_files()?;

        if !self.config.ingest.enabled {
            return Ok(report);
        }
        if report.files == 0 {
            info!("Nothing to ingest for {}", report.route);
            return Ok(report);
        }

        let key = RoutingKey {
            group: route.group.clone(),
            project: route.project.clone(),
        };
        match self.ingestor.ingest(cache.path(), &key).await {
            Ok(ingest) if ingest.success => {
                info!("Ingested {} file(s) into {}", report.files, report.route);
                report.ingest = Some(ingest);
                cache.clear()?;
            }
            Ok(ingest) => {
                error!(
                    "Ingestion into {} failed, {} file(s) left in {}",
                    report.route,
                    report.files,
                    cache.path().display()
                );
                report.ingest = Some(ingest);
            }
            Err(e) => {
                error!(
                    "Ingestion into {} failed: {}; {} file(s) left in {}",
                    report.route,
                    e,
                    report.files,
                    cache.path().display()
                );
                report.ingest_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    async fn search(&self, query: &FindQuery) -> Result<ResultLedger> {
        let remote = self.config.remote_node();
        let outcome = self
            .scu()
            .find(&remote, query)
            .await
            .with_context(|| format!("C-FIND on {} failed", remote))?;

        let mut ledger = ResultLedger::new();
        ledger.record_outcome(outcome);
        info!(
            "{} match(es), {} skipped",
            ledger.matches().count(),
            ledger.skipped().count()
        );
        Ok(ledger)
    }
}

async fn write_csv(ledger: &ResultLedger, path: &Path) -> Result<()> {
    info!("Saving study list to {}", path.display());
    tokio::fs::write(path, ledger.export().to_csv())
        .await
        .with_context(|| format!("cannot write {}", path.display()))
}
