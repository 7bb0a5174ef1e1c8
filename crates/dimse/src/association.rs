//! Association Channel: one negotiated connection to a peer
//!
//! The upper layer association from `dicom-ul` is blocking, so every
//! association opened by [`UlConnector`] lives on its own blocking worker.
//! The async side talks to the worker through a small operation channel and
//! never touches the socket itself.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::TransferSyntax;
use dicom_ul::association::client::ClientAssociationOptions;
use dicom_ul::pdu::Pdu;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::message::{transfer_syntax, DimseMessage, MessageAssembler, RawMessage};
use crate::types::QueryRoot;

/// Pull the next complete message off a blocking association.
///
/// Evaluates to `Ok(None)` once the peer requested release (already
/// answered). Expands in place so it serves both client and server
/// associations without naming their types.
macro_rules! pump {
    ($association:expr, $assembler:expr, $queued:expr) => {{
        loop {
            if let Some(message) = $queued.pop_front() {
                break Ok(Some(message));
            }
            let pdu = match $association.receive() {
                Ok(pdu) => pdu,
                Err(e) => break Err($crate::error::DimseError::connection_lost(e.to_string())),
            };
            match pdu {
                ::dicom_ul::pdu::Pdu::PData { data } => match $assembler.feed(data) {
                    Ok(messages) => $queued.extend(messages),
                    Err(e) => break Err(e),
                },
                ::dicom_ul::pdu::Pdu::ReleaseRQ => {
                    let _ = $association.send(&::dicom_ul::pdu::Pdu::ReleaseRP);
                    break Ok(None);
                }
                ::dicom_ul::pdu::Pdu::AbortRQ { .. } => {
                    break Err($crate::error::DimseError::connection_lost("peer aborted the association"));
                }
                other => {
                    break Err($crate::error::DimseError::connection_lost(format!(
                        "unexpected PDU {:?}",
                        other
                    )))
                }
            }
        }
    }};
}

pub(crate) use pump;

/// Lifecycle of an open association. Negotiation happens inside
/// [`Connector::open`], which only hands out established channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Established,
    Releasing,
    Aborted,
    Closed,
}

/// The service an association is opened for. Exactly one presentation
/// context is proposed per association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceContext {
    Verification,
    Find(QueryRoot),
    Move(QueryRoot),
    Storage {
        sop_class_uid: String,
        transfer_syntax: String,
    },
}

impl ServiceContext {
    /// Abstract syntax UID proposed for this service
    pub fn abstract_syntax(&self) -> &str {
        match self {
            ServiceContext::Verification => uids::VERIFICATION,
            ServiceContext::Find(QueryRoot::Study) => {
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            ServiceContext::Find(QueryRoot::Patient) => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            ServiceContext::Move(QueryRoot::Study) => {
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
            ServiceContext::Move(QueryRoot::Patient) => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
            ServiceContext::Storage { sop_class_uid, .. } => sop_class_uid,
        }
    }

    /// Transfer syntaxes proposed for this service
    pub fn transfer_syntaxes(&self, config: &DimseConfig) -> Vec<String> {
        match self {
            ServiceContext::Storage {
                transfer_syntax, ..
            } => vec![transfer_syntax.clone()],
            _ => config.preferred_transfer_syntaxes.clone(),
        }
    }
}

impl std::fmt::Display for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceContext::Verification => write!(f, "verification"),
            ServiceContext::Find(root) => write!(f, "find ({:?} root)", root),
            ServiceContext::Move(root) => write!(f, "move ({:?} root)", root),
            ServiceContext::Storage { sop_class_uid, .. } => write!(f, "storage {}", sop_class_uid),
        }
    }
}

/// The presentation context accepted by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// A negotiated association, owned by exactly one operation.
///
/// `release` and `abort` always succeed; calling either a second time is a
/// no-op.
#[async_trait]
pub trait AssociationChannel: Send {
    /// The accepted presentation context
    fn context(&self) -> &PresentationContext;

    /// Current lifecycle state
    fn state(&self) -> AssociationState;

    /// Send one complete message
    async fn send(&mut self, message: DimseMessage) -> Result<()>;

    /// Wait up to `timeout` for the next complete message.
    ///
    /// Fails with [`DimseError::Timeout`] when nothing arrived in time; the
    /// association stays usable and a later call picks up the same reply.
    async fn receive(&mut self, timeout: Duration) -> Result<DimseMessage>;

    /// Orderly release
    async fn release(&mut self);

    /// Abort without waiting for the peer
    async fn abort(&mut self);
}

/// Opens associations to remote nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        node: &RemoteNode,
        service: ServiceContext,
    ) -> Result<Box<dyn AssociationChannel>>;
}

/// Connector over the DICOM upper layer protocol
pub struct UlConnector {
    config: DimseConfig,
}

impl UlConnector {
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }
}

struct AssociationRequest {
    calling_ae_title: String,
    address: String,
    abstract_syntax: String,
    transfer_syntaxes: Vec<String>,
    max_pdu: u32,
    io_timeout: Duration,
}

enum Op {
    Send(Vec<Pdu>, oneshot::Sender<Result<()>>),
    Receive(oneshot::Sender<Result<RawMessage>>),
    Release(oneshot::Sender<()>),
    Abort(oneshot::Sender<()>),
}

#[async_trait]
impl Connector for UlConnector {
    async fn open(
        &self,
        node: &RemoteNode,
        service: ServiceContext,
    ) -> Result<Box<dyn AssociationChannel>> {
        node.validate()?;

        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout());
        let max_pdu = node.max_pdu.unwrap_or(self.config.max_pdu);
        let request = AssociationRequest {
            calling_ae_title: self.config.local_aet.clone(),
            address: node.address(),
            abstract_syntax: service.abstract_syntax().to_string(),
            transfer_syntaxes: service.transfer_syntaxes(&self.config),
            max_pdu,
            io_timeout: self.config.reply_timeout(),
        };

        debug!(peer = %node, context = %service, "Requesting association");
        let (ops_tx, ops_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || association_worker(request, ops_rx, ready_tx));

        let (context, acceptor_max_pdu) = match tokio::time::timeout(connect_timeout, ready_rx).await {
            Err(_) => {
                return Err(DimseError::Timeout(format!(
                    "association with {} not established within {:?}",
                    node, connect_timeout
                )))
            }
            Ok(Err(_)) => return Err(DimseError::internal("association worker exited")),
            Ok(Ok(result)) => result?,
        };
        let ts = transfer_syntax(&context.transfer_syntax)?;
        let send_max_pdu = outbound_pdu_limit(max_pdu, acceptor_max_pdu);
        debug!(
            peer = %node,
            context_id = context.id,
            transfer_syntax = %context.transfer_syntax,
            send_max_pdu,
            "Association established"
        );

        Ok(Box::new(UlAssociation {
            peer: node.to_string(),
            context,
            transfer_syntax: ts,
            max_pdu: send_max_pdu,
            state: AssociationState::Established,
            ops: ops_tx,
            pending: None,
            close_timeout: connect_timeout,
        }))
    }
}

/// Largest PDU we may send: the peer's advertised maximum, where 0 means it
/// set no limit.
fn outbound_pdu_limit(local_max_pdu: u32, acceptor_max_pdu: u32) -> u32 {
    if acceptor_max_pdu == 0 {
        local_max_pdu
    } else {
        acceptor_max_pdu
    }
}

/// Async handle on an association owned by a blocking worker
struct UlAssociation {
    peer: String,
    context: PresentationContext,
    transfer_syntax: &'static TransferSyntax,
    /// Outbound fragmentation limit, as negotiated with the peer
    max_pdu: u32,
    state: AssociationState,
    ops: mpsc::Sender<Op>,
    pending: Option<oneshot::Receiver<Result<RawMessage>>>,
    close_timeout: Duration,
}

impl UlAssociation {
    fn ensure_established(&self) -> Result<()> {
        if self.state == AssociationState::Established {
            Ok(())
        } else {
            Err(DimseError::connection_lost(format!(
                "association with {} is {:?}",
                self.peer, self.state
            )))
        }
    }

    async fn close_with(&mut self, op: fn(oneshot::Sender<()>) -> Op, state: AssociationState) {
        if self.state != AssociationState::Established {
            debug!(peer = %self.peer, state = ?self.state, "Association already closing");
            return;
        }
        self.state = state;
        let (tx, rx) = oneshot::channel();
        if self.ops.send(op(tx)).await.is_ok()
            && tokio::time::timeout(self.close_timeout, rx).await.is_err()
        {
            // The worker finishes on its own once its pending read returns.
            debug!(peer = %self.peer, "Association close still in progress");
        }
        self.state = AssociationState::Closed;
    }
}

#[async_trait]
impl AssociationChannel for UlAssociation {
    fn context(&self) -> &PresentationContext {
        &self.context
    }

    fn state(&self) -> AssociationState {
        self.state
    }

    async fn send(&mut self, message: DimseMessage) -> Result<()> {
        self.ensure_established()?;
        let pdus = message.to_pdus(self.transfer_syntax, self.max_pdu)?;
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::Send(pdus, tx))
            .await
            .map_err(|_| DimseError::connection_lost("association worker gone"))?;
        rx.await
            .map_err(|_| DimseError::connection_lost("association worker gone"))?
    }

    async fn receive(&mut self, timeout: Duration) -> Result<DimseMessage> {
        self.ensure_established()?;
        if self.pending.is_none() {
            let (tx, rx) = oneshot::channel();
            self.ops
                .send(Op::Receive(tx))
                .await
                .map_err(|_| DimseError::connection_lost("association worker gone"))?;
            self.pending = Some(rx);
        }
        let Some(rx) = self.pending.as_mut() else {
            return Err(DimseError::internal("no pending receive"));
        };
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(DimseError::Timeout(format!(
                "no reply from {} within {:?}",
                self.peer, timeout
            ))),
            Ok(result) => {
                self.pending = None;
                let raw = result
                    .map_err(|_| DimseError::connection_lost("association worker gone"))??;
                raw.decode(self.transfer_syntax)
            }
        }
    }

    async fn release(&mut self) {
        self.close_with(Op::Release, AssociationState::Releasing).await;
    }

    async fn abort(&mut self) {
        self.close_with(Op::Abort, AssociationState::Aborted).await;
    }
}

fn map_establish_error(address: &str, message: String) -> DimseError {
    let lower = message.to_lowercase();
    if lower.contains("reject") || lower.contains("presentation context") {
        DimseError::AssociationRejected(format!("{}: {}", address, message))
    } else if lower.contains("timed out") || lower.contains("timeout") {
        DimseError::Timeout(format!("{}: {}", address, message))
    } else {
        DimseError::connection_lost(format!("{}: {}", address, message))
    }
}

fn association_worker(
    request: AssociationRequest,
    mut ops: mpsc::Receiver<Op>,
    ready: oneshot::Sender<Result<(PresentationContext, u32)>>,
) {
    let options = ClientAssociationOptions::new()
        .calling_ae_title(request.calling_ae_title.clone())
        .max_pdu_length(request.max_pdu)
        .read_timeout(request.io_timeout)
        .write_timeout(request.io_timeout)
        .with_presentation_context(
            request.abstract_syntax.clone(),
            request.transfer_syntaxes.clone(),
        );

    let mut association = match options.establish_with(&request.address) {
        Ok(association) => association,
        Err(e) => {
            let _ = ready.send(Err(map_establish_error(&request.address, e.to_string())));
            return;
        }
    };

    let accepted = association
        .presentation_contexts()
        .first()
        .map(|pc| PresentationContext {
            id: pc.id,
            abstract_syntax: request.abstract_syntax.clone(),
            transfer_syntax: pc.transfer_syntax.trim_end_matches('\0').to_string(),
        });
    let Some(context) = accepted else {
        let _ = association.abort();
        let _ = ready.send(Err(DimseError::AssociationRejected(format!(
            "{}: no presentation context accepted for {}",
            request.address, request.abstract_syntax
        ))));
        return;
    };
    if ready
        .send(Ok((context, association.acceptor_max_pdu_length())))
        .is_err()
    {
        // Caller gave up waiting for negotiation.
        let _ = association.abort();
        return;
    }

    let mut assembler = MessageAssembler::new();
    let mut queued: VecDeque<RawMessage> = VecDeque::new();

    while let Some(op) = ops.blocking_recv() {
        match op {
            Op::Send(pdus, reply) => {
                let result = pdus.iter().try_for_each(|pdu| {
                    association
                        .send(pdu)
                        .map_err(|e| DimseError::connection_lost(e.to_string()))
                });
                let _ = reply.send(result);
            }
            Op::Receive(reply) => {
                let result = match pump!(association, assembler, queued) {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => {
                        let _ = reply.send(Err(DimseError::connection_lost(
                            "peer released the association",
                        )));
                        return;
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Op::Release(reply) => {
                if let Err(e) = association.release() {
                    debug!(peer = %request.address, "Release ended with {}", e);
                }
                let _ = reply.send(());
                return;
            }
            Op::Abort(reply) => {
                let _ = association.abort();
                let _ = reply.send(());
                return;
            }
        }
    }

    // Handle dropped without an explicit close.
    warn!(peer = %request.address, "Association dropped while open, aborting");
    let _ = association.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandSet;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::InMemDicomObject;

    #[test]
    fn service_contexts_map_to_sop_classes() {
        assert_eq!(
            ServiceContext::Find(QueryRoot::Study).abstract_syntax(),
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
        );
        assert_eq!(
            ServiceContext::Move(QueryRoot::Patient).abstract_syntax(),
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
        );
        assert_eq!(ServiceContext::Verification.abstract_syntax(), uids::VERIFICATION);
    }

    #[test]
    fn storage_context_proposes_object_transfer_syntax() {
        let config = DimseConfig::default();
        let service = ServiceContext::Storage {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.4".to_string(),
            transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        };
        assert_eq!(
            service.transfer_syntaxes(&config),
            vec![uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string()]
        );
        assert_eq!(
            ServiceContext::Find(QueryRoot::Study).transfer_syntaxes(&config),
            config.preferred_transfer_syntaxes
        );
    }

    #[test]
    fn sends_are_fragmented_to_the_peer_limit() {
        assert_eq!(outbound_pdu_limit(65_536, 0), 65_536);
        let limit = outbound_pdu_limit(65_536, 16_384);
        assert_eq!(limit, 16_384);

        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(vec![0u8; 40_000]),
        ));
        let message = DimseMessage::new(
            1,
            CommandSet::store_rq(1, uids::MR_IMAGE_STORAGE, "1.2.826.0.1.1.1.1"),
        )
        .with_dataset(dataset);
        let ts = transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();

        let pdus = message.to_pdus(ts, limit).unwrap();
        assert!(pdus.len() >= 4, "{} PDUs", pdus.len());
        for pdu in &pdus {
            let Pdu::PData { data } = pdu else {
                panic!("unexpected PDU {:?}", pdu);
            };
            let length: usize = data.iter().map(|pdv| pdv.data.len() + 6).sum();
            assert!(length <= limit as usize, "PDU of {} bytes", length);
        }
    }

    #[test]
    fn establish_errors_are_classified() {
        assert!(matches!(
            map_establish_error("A@h:1", "Association rejected by the peer".into()),
            DimseError::AssociationRejected(_)
        ));
        assert!(matches!(
            map_establish_error("A@h:1", "connection timed out".into()),
            DimseError::Timeout(_)
        ));
        assert!(matches!(
            map_establish_error("A@h:1", "Connection refused".into()),
            DimseError::ConnectionLost(_)
        ));
    }
}
