//! Retrieve Orchestrator: one store receiver per batch, one move per target
//!
//! The receiver is started before the first move directive and stopped after
//! the last outcome is known, exactly once, whatever happens to the targets in
//! between. Receiver and moves share nothing but the output directory.

use std::sync::Arc;

use dimse::{
    DimseConfig, DimseError, DimseScu, FailureReason, OperationOutcome, ReceiverReport,
    RemoteNode, RetrievalTarget, StoreHandler, StoreScp,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Everything one batch produced
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One outcome per attempted target, in target order
    pub outcomes: Vec<OperationOutcome>,
    /// Targets never attempted because the batch halted or was cancelled
    pub not_attempted: Vec<RetrievalTarget>,
    /// Set when the batch stopped on a configuration defect
    pub halted: Option<String>,
    pub cancelled: bool,
    pub receiver: ReceiverReport,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// All targets attempted and all succeeded
    pub fn is_clean(&self) -> bool {
        self.not_attempted.is_empty() && self.outcomes.iter().all(OperationOutcome::is_success)
    }

    /// The unknown-destination defect, for the operator. Reported whether or
    /// not the batch halted on it.
    pub fn destination_error(&self, destination_aet: &str) -> Option<DimseError> {
        let seen = self.halted.is_some()
            || self
                .outcomes
                .iter()
                .any(|o| o.reason() == Some(&FailureReason::DestinationUnknown));
        seen.then(|| DimseError::DestinationUnknown {
            destination: destination_aet.to_string(),
        })
    }
}

pub struct RetrieveOrchestrator {
    scu: DimseScu,
    receiver: DimseConfig,
    store: Arc<dyn StoreHandler>,
    halt_on_destination_unknown: bool,
}

impl RetrieveOrchestrator {
    /// The receiver listens with the SCU's local identity and advertises its
    /// AE title as the move destination.
    pub fn new(scu: DimseScu, store: Arc<dyn StoreHandler>) -> Self {
        let receiver = scu.config().clone();
        Self {
            scu,
            receiver,
            store,
            halt_on_destination_unknown: true,
        }
    }

    /// Whether an unknown destination stops the remaining targets
    pub fn with_halt_on_destination_unknown(mut self, halt: bool) -> Self {
        self.halt_on_destination_unknown = halt;
        self
    }

    pub fn destination_aet(&self) -> &str {
        &self.receiver.local_aet
    }

    /// Retrieve every target from `remote` into the receiver's output directory.
    ///
    /// Fails only if the receiver cannot be started; per-target failures are
    /// folded into the report.
    pub async fn retrieve(
        &self,
        remote: &RemoteNode,
        targets: &[RetrievalTarget],
        cancel: &CancellationToken,
    ) -> dimse::Result<BatchReport> {
        let span = info_span!("batch", peer = %remote, targets = targets.len());
        let receiver = StoreScp::new(self.receiver.clone(), self.store.clone())
            .start()
            .instrument(span.clone())
            .await?;

        let mut report = self.run_batch(remote, targets, cancel).instrument(span.clone()).await;
        report.receiver = receiver.stop().instrument(span).await;

        info!(
            "Batch finished: {} succeeded, {} failed, {} not attempted, {} object(s) received",
            report.succeeded(),
            report.failed(),
            report.not_attempted.len(),
            report.receiver.stored.len()
        );
        for failure in &report.receiver.failures {
            warn!(
                "Store failure for {}: {} (0x{:04X})",
                failure.sop_instance_uid.as_deref().unwrap_or("<unknown>"),
                failure.reason,
                failure.status
            );
        }
        Ok(report)
    }

    async fn run_batch(
        &self,
        remote: &RemoteNode,
        targets: &[RetrievalTarget],
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let destination = self.destination_aet();

        for (index, target) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Batch cancelled before {}", target.label);
                report.cancelled = true;
                report.not_attempted.extend_from_slice(&targets[index..]);
                break;
            }

            info!("Target {} of {}: {}", index + 1, targets.len(), target.label);
            let outcome = self.scu.move_target(remote, target, destination, cancel).await;
            let reason = outcome.reason().cloned();
            report.outcomes.push(outcome);

            match reason {
                Some(FailureReason::Cancelled) => {
                    report.cancelled = true;
                    report.not_attempted.extend_from_slice(&targets[index + 1..]);
                    break;
                }
                Some(FailureReason::DestinationUnknown) if self.halt_on_destination_unknown => {
                    error!(
                        "{} does not know destination {}; check the local AE title and port. \
                         Halting the remaining {} target(s)",
                        remote,
                        destination,
                        targets.len() - index - 1
                    );
                    report.halted = Some(format!(
                        "destination {} unknown to {}",
                        destination, remote
                    ));
                    report.not_attempted.extend_from_slice(&targets[index + 1..]);
                    break;
                }
                _ => {}
            }
        }
        report
    }
}
