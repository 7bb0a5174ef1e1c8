//! Scripted in-memory peer for tests and dry runs
//!
//! A [`ScriptedConnector`] hands out one scripted association per `open`, in
//! order. Each association replays its [`ScriptedStep`]s once a request has
//! been sent. Push steps either go straight to a [`StoreHandler`], or, with
//! [`ScriptedPeer::pushing_to`], travel as real C-STORE sub-operations to a
//! running Store Receiver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dicom_dictionary_std::uids;
use dicom_object::InMemDicomObject;

use crate::association::{
    AssociationChannel, AssociationState, Connector, PresentationContext, ServiceContext,
};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::message::{CommandField, CommandSet, DimseMessage, SubOperationCounts};
use crate::scu::DimseScu;
use crate::store::{PushedObject, StoreHandler, StoredObject};

/// One scripted event
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Send a response to the last request
    Reply {
        field: CommandField,
        status: u16,
        identifier: Option<InMemDicomObject>,
        counts: SubOperationCounts,
    },
    /// Push an object to the configured store handler or destination
    Push(PushedObject),
    /// Drop the connection
    Drop,
}

impl ScriptedStep {
    pub fn reply(field: CommandField, status: u16) -> Self {
        ScriptedStep::Reply {
            field,
            status,
            identifier: None,
            counts: SubOperationCounts::default(),
        }
    }

    /// C-FIND response carrying an identifier
    pub fn find_match(status: u16, identifier: InMemDicomObject) -> Self {
        ScriptedStep::Reply {
            field: CommandField::CFindRsp,
            status,
            identifier: Some(identifier),
            counts: SubOperationCounts::default(),
        }
    }

    /// C-MOVE response carrying sub-operation counters
    pub fn move_status(status: u16, counts: SubOperationCounts) -> Self {
        ScriptedStep::Reply {
            field: CommandField::CMoveRsp,
            status,
            identifier: None,
            counts,
        }
    }
}

/// What happened on the scripted associations
#[derive(Debug, Default)]
pub struct MockLog {
    opened: AtomicUsize,
    released: AtomicUsize,
    aborted: AtomicUsize,
    requests: Mutex<Vec<CommandSet>>,
    pushed: Mutex<Vec<StoredObject>>,
    forwarded: Mutex<Vec<(String, u16)>>,
}

impl MockLog {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Every request command received, in order
    pub fn requests(&self) -> Vec<CommandSet> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Objects pushed through the store handler
    pub fn pushed(&self) -> Vec<StoredObject> {
        self.pushed.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// SOP Instance UID and acknowledged status of every network push
    pub fn forwarded(&self) -> Vec<(String, u16)> {
        self.forwarded.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

/// Script for one association
#[derive(Clone)]
pub struct ScriptedPeer {
    steps: Vec<ScriptedStep>,
    store: Option<Arc<dyn StoreHandler>>,
    destination: Option<RemoteNode>,
    reply_delay: Duration,
}

impl ScriptedPeer {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps,
            store: None,
            destination: None,
            reply_delay: Duration::ZERO,
        }
    }

    /// Where push steps deliver their objects
    pub fn with_store(mut self, store: Arc<dyn StoreHandler>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send push steps over the network to `destination` with C-STORE
    pub fn pushing_to(mut self, destination: RemoteNode) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Pause before every reply
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Standalone channel, already established
    pub fn into_channel(self, context_id: u8) -> Box<dyn AssociationChannel> {
        let log = Arc::new(MockLog::default());
        log.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(self.channel(context_id, String::new(), log))
    }

    fn channel(self, context_id: u8, abstract_syntax: String, log: Arc<MockLog>) -> ScriptedChannel {
        ScriptedChannel {
            context: PresentationContext {
                id: context_id,
                abstract_syntax,
                transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
            state: AssociationState::Established,
            steps: self.steps.into(),
            store: self.store,
            destination: self.destination,
            reply_delay: self.reply_delay,
            last_request: None,
            log,
        }
    }
}

enum Scripted {
    Reject(String),
    Accept(ScriptedPeer),
}

/// Connector handing out scripted associations in order
#[derive(Default)]
pub struct ScriptedConnector {
    queue: Mutex<VecDeque<Scripted>>,
    log: Arc<MockLog>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `open` succeeds and replays `peer`
    pub fn accept(self, peer: ScriptedPeer) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Scripted::Accept(peer));
        }
        self
    }

    /// Next `open` is rejected
    pub fn reject(self, reason: impl Into<String>) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Scripted::Reject(reason.into()));
        }
        self
    }

    pub fn log(&self) -> Arc<MockLog> {
        self.log.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        node: &RemoteNode,
        service: ServiceContext,
    ) -> Result<Box<dyn AssociationChannel>> {
        node.validate()?;
        let next = self
            .queue
            .lock()
            .map_err(|_| DimseError::internal("script poisoned"))?
            .pop_front();
        match next {
            Some(Scripted::Accept(peer)) => {
                self.log.opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(peer.channel(
                    1,
                    service.abstract_syntax().to_string(),
                    self.log.clone(),
                )))
            }
            Some(Scripted::Reject(reason)) => Err(DimseError::AssociationRejected(format!(
                "{}: {}",
                node, reason
            ))),
            None => Err(DimseError::connection_lost(format!(
                "{}: no scripted association left",
                node
            ))),
        }
    }
}

struct ScriptedChannel {
    context: PresentationContext,
    state: AssociationState,
    steps: VecDeque<ScriptedStep>,
    store: Option<Arc<dyn StoreHandler>>,
    destination: Option<RemoteNode>,
    reply_delay: Duration,
    last_request: Option<CommandSet>,
    log: Arc<MockLog>,
}

impl ScriptedChannel {
    fn push(&self, object: PushedObject) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| DimseError::internal("push step without a store handler"))?;
        let stored = store.store(object)?;
        if let Ok(mut pushed) = self.log.pushed.lock() {
            pushed.push(stored);
        }
        Ok(())
    }
}

/// C-STORE one object to the move destination, calling as the archive
async fn forward(destination: RemoteNode, object: PushedObject, log: Arc<MockLog>) -> Result<()> {
    let scu = DimseScu::new(DimseConfig {
        local_aet: "ARCHIVE".to_string(),
        ..Default::default()
    });
    let status = scu.store(&destination, &object).await?;
    if let Ok(mut forwarded) = log.forwarded.lock() {
        forwarded.push((object.sop_instance_uid, status));
    }
    Ok(())
}

#[async_trait]
impl AssociationChannel for ScriptedChannel {
    fn context(&self) -> &PresentationContext {
        &self.context
    }

    fn state(&self) -> AssociationState {
        self.state
    }

    async fn send(&mut self, message: DimseMessage) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(DimseError::connection_lost("association closed"));
        }
        if let Ok(mut requests) = self.log.requests.lock() {
            requests.push(message.command.clone());
        }
        if message.command.command_field != CommandField::CCancelRq {
            self.last_request = Some(message.command);
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<DimseMessage> {
        if self.state != AssociationState::Established {
            return Err(DimseError::connection_lost("association closed"));
        }
        let Some(request) = self.last_request.clone() else {
            return Err(DimseError::connection_lost("nothing to reply to"));
        };

        loop {
            match self.steps.pop_front() {
                None => {
                    return Err(DimseError::Timeout(format!(
                        "script exhausted (waited {:?})",
                        timeout
                    )))
                }
                Some(ScriptedStep::Drop) => {
                    self.state = AssociationState::Aborted;
                    return Err(DimseError::connection_lost("peer dropped the connection"));
                }
                Some(ScriptedStep::Push(object)) => {
                    // A failed push is the archive's problem: it shows up in
                    // the failed counter of its next reply.
                    let _ = match self.destination.clone() {
                        Some(destination) => forward(destination, object, self.log.clone()).await,
                        None => self.push(object),
                    };
                }
                Some(ScriptedStep::Reply {
                    field,
                    status,
                    identifier,
                    counts,
                }) => {
                    if !self.reply_delay.is_zero() {
                        tokio::time::sleep(self.reply_delay).await;
                    }
                    let command = CommandSet {
                        command_field: field,
                        ..CommandSet::response_to(&request, status)
                    }
                    .with_sub_operations(counts);
                    let message = DimseMessage::new(self.context.id, command);
                    return Ok(match identifier {
                        Some(identifier) => message.with_dataset(identifier),
                        None => message,
                    });
                }
            }
        }
    }

    async fn release(&mut self) {
        if self.state == AssociationState::Established {
            self.state = AssociationState::Closed;
            self.log.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn abort(&mut self) {
        if self.state == AssociationState::Established {
            self.state = AssociationState::Closed;
            self.log.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}
