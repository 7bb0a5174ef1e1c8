//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides the client side of query/retrieve (C-ECHO, C-FIND,
//! C-MOVE) and the storage SCP a C-MOVE pushes its objects to.
//!
//! # Features
//! - Association Channel over the DICOM upper layer, one association per operation
//! - Total status classification table for find/move/store replies
//! - Search Engine producing ordered match records, skipping unprocessable replies
//! - Single-target move driver folding the status stream into an outcome
//! - Store Receiver with deterministic, atomically written output files
//! - Scripted in-memory peer for tests

pub mod association;
pub mod config;
pub mod error;
pub mod message;
pub mod mock;
pub mod outcome;
pub mod reply;
pub mod scp;
pub mod scu;
pub mod status;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use association::{AssociationChannel, AssociationState, Connector, ServiceContext, UlConnector};
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use outcome::{FailureReason, FindEntry, FindOutcome, OperationOutcome, Verdict};
pub use scp::{ReceiverReport, StoreScp, StoreScpHandle};
pub use scu::{DimseScu, ScuBuilder};
pub use status::{classify, StatusClass};
pub use store::{FilesystemStore, PushedObject, StoreHandler, StoredObject};
pub use types::{FindQuery, MatchRecord, MoveQuery, QueryKey, QueryLevel, QueryRoot, RetrievalTarget};

/// Default DICOM port of a remote archive
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default port of the local Store Receiver
pub const DEFAULT_STORE_PORT: u16 = 11113;
