//! Store Receiver: the local storage SCP that a move destination points at
//!
//! `start` returns as soon as the listener is bound. Each inbound association
//! runs on its own blocking worker; `stop` stops accepting, waits for the
//! in-flight associations to finish acknowledging and only then unbinds.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use dicom_dictionary_std::uids;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::association::pump;
use crate::config::DimseConfig;
use crate::error::{DimseError, Result};
use crate::message::{
    command_transfer_syntax, transfer_syntax, CommandField, CommandSet, DimseMessage,
    MessageAssembler, RawMessage,
};
use crate::status::{
    STATUS_OUT_OF_RESOURCES, STATUS_PROCESSING_FAILURE, STATUS_SUCCESS, STATUS_UNABLE_TO_PROCESS,
    STATUS_UNRECOGNIZED_OPERATION,
};
use crate::store::{PushedObject, StoreFailure, StoreHandler, StoredObject};

/// What the receiver accepted and refused while it ran
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverReport {
    pub stored: Vec<StoredObject>,
    pub failures: Vec<StoreFailure>,
}

struct ReceiverContext {
    config: DimseConfig,
    handler: Arc<dyn StoreHandler>,
    report: Mutex<ReceiverReport>,
}

impl ReceiverContext {
    fn record_stored(&self, stored: StoredObject) {
        let mut report = self.report.lock().unwrap_or_else(|p| p.into_inner());
        report.stored.push(stored);
    }

    fn record_failure(&self, failure: StoreFailure) {
        let mut report = self.report.lock().unwrap_or_else(|p| p.into_inner());
        report.failures.push(failure);
    }
}

/// Storage SCP
pub struct StoreScp {
    config: DimseConfig,
    handler: Arc<dyn StoreHandler>,
}

impl StoreScp {
    pub fn new(config: DimseConfig, handler: Arc<dyn StoreHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind the listener and start accepting associations
    pub async fn start(self) -> Result<StoreScpHandle> {
        self.config.validate()?;

        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Store receiver listening on {} (AET: {})",
            local_addr, self.config.local_aet
        );

        let context = Arc::new(ReceiverContext {
            config: self.config,
            handler: self.handler,
            report: Mutex::new(ReceiverReport::default()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, context.clone(), cancel.clone()));

        Ok(StoreScpHandle {
            local_addr,
            cancel,
            task: Some(task),
            context,
        })
    }
}

/// Running receiver. Dropping it without `stop` cancels the accept loop.
pub struct StoreScpHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    context: Arc<ReceiverContext>,
}

impl StoreScpHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Objects stored so far
    pub fn stored_count(&self) -> usize {
        self.context
            .report
            .lock()
            .map(|r| r.stored.len())
            .unwrap_or_else(|p| p.into_inner().stored.len())
    }

    /// Graceful stop
    pub async fn stop(mut self) -> ReceiverReport {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Store receiver task failed: {}", e);
            }
        }
        let mut report = self.context.report.lock().unwrap_or_else(|p| p.into_inner());
        let report = std::mem::take(&mut *report);
        info!(
            "Store receiver on {} stopped: {} stored, {} failed",
            self.local_addr,
            report.stored.len(),
            report.failures.len()
        );
        report
    }
}

impl Drop for StoreScpHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            warn!("Store receiver on {} dropped without stop", self.local_addr);
            self.cancel.cancel();
        }
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<ReceiverContext>, cancel: CancellationToken) {
    let max_associations = context.config.max_associations as usize;
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                };
                while workers.try_join_next().is_some() {}
                if workers.len() >= max_associations {
                    warn!("Maximum associations reached, rejecting connection from {}", peer);
                    drop(stream);
                    continue;
                }

                let stream = match into_blocking(stream, &context.config) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Cannot hand connection from {} to a worker: {}", peer, e);
                        continue;
                    }
                };
                let context = context.clone();
                workers.spawn_blocking(move || {
                    let _span = info_span!("store_association", peer = %peer).entered();
                    if let Err(e) = handle_association(stream, &context) {
                        warn!("Association from {} ended with error: {}", peer, e);
                    }
                });
            }
        }
    }

    if !workers.is_empty() {
        info!("Waiting for {} in-flight association(s)", workers.len());
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Association worker failed: {}", e);
        }
    }
    drop(listener);
}

fn into_blocking(stream: tokio::net::TcpStream, config: &DimseConfig) -> Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(config.association_timeout()))?;
    stream.set_write_timeout(Some(config.association_timeout()))?;
    Ok(stream)
}

fn handle_association(stream: std::net::TcpStream, context: &ReceiverContext) -> Result<()> {
    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(context.config.local_aet.clone())
        .max_pdu_length(context.config.max_pdu)
        .promiscuous(true)
        .with_abstract_syntax(uids::VERIFICATION);
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    let mut association = options
        .establish(stream)
        .map_err(|e| DimseError::DicomUl(e.to_string()))?;
    let contexts: HashMap<u8, String> = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
        .collect();
    info!(
        "Association established with {} ({} presentation contexts)",
        association.client_ae_title(),
        contexts.len()
    );

    let mut assembler = MessageAssembler::new();
    let mut queued: VecDeque<RawMessage> = VecDeque::new();
    loop {
        let raw = match pump!(association, assembler, queued) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Association released by peer");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(response) = answer(raw, &contexts, context) else {
            continue;
        };
        let pdus = response.to_pdus(command_transfer_syntax()?, context.config.max_pdu)?;
        for pdu in &pdus {
            association
                .send(pdu)
                .map_err(|e| DimseError::connection_lost(e.to_string()))?;
        }
    }
}

/// Response to one inbound message, `None` when none is due
fn answer(
    raw: RawMessage,
    contexts: &HashMap<u8, String>,
    context: &ReceiverContext,
) -> Option<DimseMessage> {
    let pc_id = raw.presentation_context_id;
    let command = raw.command.clone();
    let status = match command.command_field {
        CommandField::CStoreRq => store(raw, contexts, context),
        CommandField::CEchoRq => {
            debug!("C-ECHO");
            STATUS_SUCCESS
        }
        CommandField::CCancelRq => return None,
        other => {
            warn!("Refusing unsupported command {:?}", other);
            STATUS_UNRECOGNIZED_OPERATION
        }
    };
    Some(DimseMessage::new(pc_id, CommandSet::response_to(&command, status)))
}

fn store(raw: RawMessage, contexts: &HashMap<u8, String>, context: &ReceiverContext) -> u16 {
    let announced_uid = raw.command.affected_sop_instance_uid.clone();
    let refuse = |status: u16, reason: String| {
        warn!(
            sop_instance_uid = announced_uid.as_deref().unwrap_or(""),
            "C-STORE refused with 0x{:04X}: {}",
            status,
            reason
        );
        context.record_failure(StoreFailure {
            sop_instance_uid: announced_uid.clone(),
            status,
            reason,
        });
        status
    };

    let Some(ts_uid) = contexts.get(&raw.presentation_context_id).cloned() else {
        return refuse(
            STATUS_UNABLE_TO_PROCESS,
            format!("unknown presentation context {}", raw.presentation_context_id),
        );
    };
    let message = match transfer_syntax(&ts_uid).and_then(|ts| raw.decode(ts)) {
        Ok(message) => message,
        Err(e) => return refuse(STATUS_UNABLE_TO_PROCESS, e.to_string()),
    };
    let Some(dataset) = message.dataset else {
        return refuse(STATUS_UNABLE_TO_PROCESS, "C-STORE without data set".to_string());
    };
    let object = match PushedObject::from_dataset(dataset, ts_uid) {
        Ok(object) => object,
        Err(e) => return refuse(STATUS_UNABLE_TO_PROCESS, e.to_string()),
    };

    let handler = context.handler.clone();
    match catch_unwind(AssertUnwindSafe(|| handler.store(object))) {
        Ok(Ok(stored)) => {
            info!(
                sop_instance_uid = %stored.sop_instance_uid,
                "Stored {}",
                stored.path.display()
            );
            context.record_stored(stored);
            STATUS_SUCCESS
        }
        Ok(Err(e)) => refuse(STATUS_OUT_OF_RESOURCES, e.to_string()),
        Err(_) => refuse(STATUS_PROCESSING_FAILURE, "store handler panicked".to_string()),
    }
}
