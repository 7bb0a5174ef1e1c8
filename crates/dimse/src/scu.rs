//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::association::{AssociationChannel, Connector, ServiceContext, UlConnector};
use crate::config::{DimseConfig, RemoteNode};
use crate::message::{CommandField, CommandSet, DimseMessage, SubOperationCounts};
use crate::outcome::{FindOutcome, OperationOutcome};
use crate::reply::{find_policy, move_policy, ReplyStream};
use crate::status::{StatusClass, STATUS_PENDING_OPTIONAL_KEYS, STATUS_SUCCESS};
use crate::store::PushedObject;
use crate::types::{
    text, FindQuery, MatchRecord, MoveQuery, QueryRoot, RetrievalTarget, SkippedReply,
};
use crate::{DimseError, Result};

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
    connector: Arc<dyn Connector>,
    root: QueryRoot,
    next_message_id: AtomicU16,
}

impl DimseScu {
    /// Create a new SCU speaking the upper layer protocol
    pub fn new(config: DimseConfig) -> Self {
        let connector = Arc::new(UlConnector::new(config.clone()));
        Self::with_connector(config, connector)
    }

    /// Create a new SCU over any association connector
    pub fn with_connector(config: DimseConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            root: QueryRoot::Study,
            next_message_id: AtomicU16::new(1),
        }
    }

    /// Information model used for retrievals
    pub fn with_root(mut self, root: QueryRoot) -> Self {
        self.root = root;
        self
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    fn message_id(&self) -> u16 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<()> {
        info!("Sending C-ECHO to {}", node);

        let mut channel = self.connector.open(node, ServiceContext::Verification).await?;
        let exchange = self.run_echo(channel.as_mut()).await;
        let result = finish(channel.as_mut(), exchange).await;

        match &result {
            Ok(()) => info!("C-ECHO to {} completed successfully", node),
            Err(e) => error!("C-ECHO to {} failed: {}", node, e),
        }
        result
    }

    async fn run_echo(&self, channel: &mut dyn AssociationChannel) -> Result<Result<()>> {
        let id = self.message_id();
        let context_id = channel.context().id;
        channel
            .send(DimseMessage::new(context_id, CommandSet::echo_rq(id)))
            .await?;
        let reply = match channel.receive(self.config.reply_timeout()).await {
            Err(DimseError::Timeout(msg)) => return Err(DimseError::connection_lost(msg)),
            other => other?,
        };
        if reply.command.command_field != CommandField::CEchoRsp {
            return Err(DimseError::connection_lost(format!(
                "expected C-ECHO-RSP, peer sent {:?}",
                reply.command.command_field
            )));
        }
        match reply.status() {
            Some(STATUS_SUCCESS) => Ok(Ok(())),
            Some(status) => Ok(Err(DimseError::connection_lost(format!(
                "C-ECHO answered with status 0x{:04X}",
                status
            )))),
            None => Err(DimseError::connection_lost("C-ECHO reply carries no status")),
        }
    }

    /// Test connectivity to a remote node with retry logic
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<()> {
        let mut retries = 0;

        while retries <= max_retries {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries)).await; // Exponential backoff
            }

            match self.echo(node).await {
                Ok(()) => {
                    info!("Connection test successful");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                    continue;
                }
                Err(e) => {
                    error!("Connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }

        Err(DimseError::internal("Connection test failed after all retries"))
    }

    /// Run a search and collect its replies in arrival order.
    ///
    /// The association is released once the peer sent its final reply, even a
    /// failure, and aborted when the exchange broke off.
    pub async fn find(&self, node: &RemoteNode, query: &FindQuery) -> Result<FindOutcome> {
        info!(
            "Sending C-FIND to {} (level: {}, keys: {:?})",
            node, query.query_level, query.matching
        );

        let mut channel = self
            .connector
            .open(node, ServiceContext::Find(query.root))
            .await?;
        let exchange = self.run_find(channel.as_mut(), query).await;
        let result = finish(channel.as_mut(), exchange).await;

        match &result {
            Ok(outcome) => info!(
                "C-FIND on {} finished: {} match(es), {} skipped",
                node,
                outcome.matches().count(),
                outcome.skipped().count()
            ),
            Err(e) => error!("C-FIND on {} failed: {}", node, e),
        }
        result
    }

    async fn run_find(
        &self,
        channel: &mut dyn AssociationChannel,
        query: &FindQuery,
    ) -> Result<Result<FindOutcome>> {
        let id = self.message_id();
        let context = channel.context().clone();
        let request = DimseMessage::new(
            context.id,
            CommandSet::find_rq(id, &context.abstract_syntax, query.priority.code()),
        )
        .with_dataset(query.to_identifier());
        channel.send(request).await?;

        let mut outcome = FindOutcome::default();
        let mut stream = ReplyStream::new(
            channel,
            id,
            CommandField::CFindRsp,
            find_policy,
            self.config.reply_timeout(),
            self.config.failure_grace(),
        );

        while let Some(reply) = stream.next().await? {
            match reply.class {
                StatusClass::Pending => {
                    if reply.status == STATUS_PENDING_OPTIONAL_KEYS
                        && !self.config.optional_keys_pending_is_match
                    {
                        let identifier = reply.identifier.as_ref().and_then(reply_identifier);
                        warn!(
                            "Skipping 0xFF01 reply for {} (optional keys not supported)",
                            identifier.as_deref().unwrap_or("<none>")
                        );
                        outcome.push_skipped(SkippedReply {
                            status: reply.status,
                            identifier,
                            reason: "optional keys not supported".to_string(),
                        });
                        continue;
                    }
                    match reply.identifier {
                        Some(identifier) => outcome.push_match(MatchRecord::from_identifier(
                            query.query_level,
                            &identifier,
                            reply.status,
                        )),
                        None => {
                            warn!("Pending C-FIND reply without identifier");
                            outcome.push_skipped(SkippedReply {
                                status: reply.status,
                                identifier: None,
                                reason: "pending reply without identifier".to_string(),
                            });
                        }
                    }
                }
                StatusClass::Unprocessable => {
                    let identifier = reply.identifier.as_ref().and_then(reply_identifier);
                    warn!(
                        "Peer could not process query identifier {} (status 0x{:04X}), skipping",
                        identifier.as_deref().unwrap_or("<none>"),
                        reply.status
                    );
                    outcome.push_skipped(SkippedReply {
                        status: reply.status,
                        identifier,
                        reason: "unable to process".to_string(),
                    });
                }
                StatusClass::Success => {
                    outcome.status = Some(reply.status);
                }
                class => {
                    return Ok(Err(DimseError::connection_lost(format!(
                        "C-FIND failed with status 0x{:04X} ({})",
                        reply.status, class
                    ))));
                }
            }
        }
        Ok(Ok(outcome))
    }

    /// Move one target to `destination_aet` and drain its status stream.
    ///
    /// Never fails: association problems are folded into the outcome. The
    /// association is released after any final status, success or not; it is
    /// aborted when the stream broke off or a cancelled token interrupted it.
    pub async fn move_target(
        &self,
        node: &RemoteNode,
        target: &RetrievalTarget,
        destination_aet: &str,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let query = MoveQuery::for_target(target, destination_aet).with_root(self.root);
        info!(
            "Sending C-MOVE of {} ({} {}) to {}, destination {}",
            target.label,
            target.level,
            target.key(),
            node,
            destination_aet
        );

        let mut channel = match self.connector.open(node, ServiceContext::Move(query.root)).await {
            Ok(channel) => channel,
            Err(e) => {
                let outcome =
                    OperationOutcome::from_error(target.clone(), &e, &SubOperationCounts::default());
                report_move(&outcome);
                return outcome;
            }
        };

        let outcome = self.run_move(channel.as_mut(), &query, target, cancel).await;
        if outcome.status.is_some() {
            channel.release().await;
        } else {
            channel.abort().await;
        }
        report_move(&outcome);
        outcome
    }

    async fn run_move(
        &self,
        channel: &mut dyn AssociationChannel,
        query: &MoveQuery,
        target: &RetrievalTarget,
        cancel: &CancellationToken,
    ) -> OperationOutcome {
        let id = self.message_id();
        let context = channel.context().clone();
        let request = DimseMessage::new(
            context.id,
            CommandSet::move_rq(
                id,
                &context.abstract_syntax,
                query.priority.code(),
                &query.destination_aet,
            ),
        )
        .with_dataset(query.to_identifier());

        let mut counts = SubOperationCounts::default();
        if let Err(e) = channel.send(request).await {
            return OperationOutcome::from_error(target.clone(), &e, &counts);
        }

        let mut stream = ReplyStream::new(
            channel,
            id,
            CommandField::CMoveRsp,
            move_policy,
            self.config.reply_timeout(),
            self.config.failure_grace(),
        );
        let mut provisional: Option<u16> = None;
        let mut waiting_reported = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("C-MOVE of {} cancelled mid-transfer", target.label);
                    drop(stream);
                    channel.abort().await;
                    return OperationOutcome::cancelled(target.clone(), &counts);
                }
                next = stream.next() => next,
            };

            let reply = match next {
                Ok(Some(reply)) => reply,
                Ok(None) => break,
                Err(e) => return OperationOutcome::from_error(target.clone(), &e, &counts),
            };
            merge_counts(&mut counts, &reply.command.sub_operations);

            match reply.class {
                StatusClass::Pending => {
                    provisional = None;
                    if !waiting_reported {
                        info!("Waiting for {} to finish pushing {}", query.destination_aet, target.label);
                        waiting_reported = true;
                    }
                    debug!(
                        remaining = counts.remaining.unwrap_or(0),
                        completed = counts.completed.unwrap_or(0),
                        failed = counts.failed.unwrap_or(0),
                        "C-MOVE pending"
                    );
                }
                StatusClass::ResourceExhausted => {
                    warn!(
                        "Peer could not perform sub-operations for {} (status 0x{:04X})",
                        target.label, reply.status
                    );
                    provisional = Some(reply.status);
                }
                _ => {
                    return OperationOutcome::from_terminal(target.clone(), reply.status, &counts);
                }
            }
        }

        match provisional {
            Some(status) => OperationOutcome::from_terminal(target.clone(), status, &counts),
            None => OperationOutcome::from_error(
                target.clone(),
                &DimseError::connection_lost("status stream ended without a final reply"),
                &counts,
            ),
        }
    }

    /// Push one object with C-STORE; returns the status the peer acknowledged
    pub async fn store(&self, node: &RemoteNode, object: &PushedObject) -> Result<u16> {
        debug!("Sending C-STORE of {} to {}", object.sop_instance_uid, node);
        let service = ServiceContext::Storage {
            sop_class_uid: object.sop_class_uid.clone(),
            transfer_syntax: object.transfer_syntax.clone(),
        };
        let mut channel = self.connector.open(node, service).await?;
        let exchange = self.run_store(channel.as_mut(), object).await;
        finish(channel.as_mut(), exchange).await
    }

    async fn run_store(
        &self,
        channel: &mut dyn AssociationChannel,
        object: &PushedObject,
    ) -> Result<Result<u16>> {
        let id = self.message_id();
        let context_id = channel.context().id;
        let request = DimseMessage::new(
            context_id,
            CommandSet::store_rq(id, &object.sop_class_uid, &object.sop_instance_uid),
        )
        .with_dataset(object.dataset.clone());
        channel.send(request).await?;

        let reply = match channel.receive(self.config.reply_timeout()).await {
            Err(DimseError::Timeout(msg)) => return Err(DimseError::connection_lost(msg)),
            other => other?,
        };
        if reply.command.command_field != CommandField::CStoreRsp {
            return Err(DimseError::connection_lost(format!(
                "expected C-STORE-RSP, peer sent {:?}",
                reply.command.command_field
            )));
        }
        reply
            .status()
            .map(Ok)
            .ok_or_else(|| DimseError::connection_lost("C-STORE reply carries no status"))
    }
}

/// Close the association after an exchange.
///
/// The outer error means the exchange broke off and the association is
/// aborted. Otherwise the peer answered, and the association is released
/// whatever the answer was.
async fn finish<T>(channel: &mut dyn AssociationChannel, exchange: Result<Result<T>>) -> Result<T> {
    match exchange {
        Ok(answer) => {
            channel.release().await;
            answer
        }
        Err(e) => {
            channel.abort().await;
            Err(e)
        }
    }
}

fn reply_identifier(obj: &InMemDicomObject) -> Option<String> {
    text(obj, tags::PATIENT_ID).or_else(|| text(obj, tags::STUDY_INSTANCE_UID))
}

fn merge_counts(counts: &mut SubOperationCounts, update: &SubOperationCounts) {
    counts.remaining = update.remaining.or(counts.remaining);
    counts.completed = update.completed.or(counts.completed);
    counts.failed = update.failed.or(counts.failed);
    counts.warning = update.warning.or(counts.warning);
}

fn report_move(outcome: &OperationOutcome) {
    let status = outcome
        .status
        .map(|s| format!("0x{:04X}", s))
        .unwrap_or_else(|| "none".to_string());
    if outcome.is_success() {
        info!(
            "C-MOVE of {} finished: {} (status {}, completed {}, warning {})",
            outcome.target.label,
            outcome.verdict_label(),
            status,
            outcome.completed,
            outcome.warning
        );
    } else {
        error!(
            "C-MOVE of {} finished: {} (status {}, completed {}, failed {}){}",
            outcome.target.label,
            outcome.verdict_label(),
            status,
            outcome.completed,
            outcome.failed,
            outcome
                .detail
                .as_ref()
                .map(|d| format!(": {}", d))
                .unwrap_or_default()
        );
    }
}

/// Builder for creating SCU instances with custom configurations
pub struct ScuBuilder {
    config: DimseConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl ScuBuilder {
    /// Start building a new SCU
    pub fn new() -> Self {
        Self {
            config: DimseConfig::default(),
            connector: None,
        }
    }

    /// Set the local AE title
    pub fn local_aet(mut self, aet: impl Into<String>) -> Self {
        self.config.local_aet = aet.into();
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum wait between two replies
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum PDU size
    pub fn max_pdu(mut self, size: u32) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Use a specific connector instead of the network one
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the SCU
    pub fn build(self) -> Result<DimseScu> {
        self.config.validate()?;
        Ok(match self.connector {
            Some(connector) => DimseScu::with_connector(self.config, connector),
            None => DimseScu::new(self.config),
        })
    }
}

impl Default for ScuBuilder {
    fn default() -> Self {
        Self::new()
    }
}
