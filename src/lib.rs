pub mod config;
pub mod ingest;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod storage;
pub mod workflow;

pub use config::{Config, ConfigError};
pub use ledger::{LedgerEntry, LedgerTable, ResultLedger};
pub use orchestrator::{BatchReport, RetrieveOrchestrator};
pub use workflow::Workflow;
