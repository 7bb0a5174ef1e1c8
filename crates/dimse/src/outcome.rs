//! Per-operation results of search and retrieval

use serde::{Deserialize, Serialize};

use crate::error::DimseError;
use crate::message::SubOperationCounts;
use crate::status::{classify, StatusClass};
use crate::types::{MatchRecord, RetrievalTarget, SkippedReply};

/// One reply of a search, as it arrived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FindEntry {
    Matched(MatchRecord),
    Skipped(SkippedReply),
}

/// Result of one search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindOutcome {
    /// Matches and skipped replies, interleaved in reply order
    pub entries: Vec<FindEntry>,
    /// Terminal status, absent when the stream ended after a grace period
    pub status: Option<u16>,
}

impl FindOutcome {
    pub fn push_match(&mut self, record: MatchRecord) {
        self.entries.push(FindEntry::Matched(record));
    }

    pub fn push_skipped(&mut self, skipped: SkippedReply) {
        self.entries.push(FindEntry::Skipped(skipped));
    }

    pub fn matches(&self) -> impl Iterator<Item = &MatchRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            FindEntry::Matched(record) => Some(record),
            FindEntry::Skipped(_) => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedReply> {
        self.entries.iter().filter_map(|entry| match entry {
            FindEntry::Skipped(skipped) => Some(skipped),
            FindEntry::Matched(_) => None,
        })
    }
}

/// Why a retrieval failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Unprocessable,
    SubOperationFailure,
    DestinationUnknown,
    ConnectionLost,
    AssociationRejected,
    Cancelled,
    Unknown(u16),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Unprocessable => write!(f, "unprocessable"),
            FailureReason::SubOperationFailure => write!(f, "sub-operation failure"),
            FailureReason::DestinationUnknown => write!(f, "destination unknown"),
            FailureReason::ConnectionLost => write!(f, "connection lost"),
            FailureReason::AssociationRejected => write!(f, "association rejected"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Unknown(status) => write!(f, "unknown failure 0x{:04X}", status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    Failure(FailureReason),
}

/// Result of one move directive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub target: RetrievalTarget,
    /// Terminal status observed, if any reply arrived
    pub status: Option<u16>,
    pub class: Option<StatusClass>,
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
    pub verdict: Verdict,
    pub detail: Option<String>,
}

impl OperationOutcome {
    fn new(target: RetrievalTarget, counts: &SubOperationCounts, verdict: Verdict) -> Self {
        Self {
            target,
            status: None,
            class: None,
            remaining: counts.remaining.unwrap_or(0),
            completed: counts.completed.unwrap_or(0),
            failed: counts.failed.unwrap_or(0),
            warning: counts.warning.unwrap_or(0),
            verdict,
            detail: None,
        }
    }

    /// Classify the authoritative status of a finished move
    pub fn from_terminal(target: RetrievalTarget, status: u16, counts: &SubOperationCounts) -> Self {
        let class = classify(status);
        let failed = counts.failed.unwrap_or(0);
        let verdict = match class {
            StatusClass::Success if failed == 0 => Verdict::Success,
            StatusClass::Success | StatusClass::ResourceExhausted => {
                Verdict::Failure(FailureReason::SubOperationFailure)
            }
            StatusClass::Unprocessable => Verdict::Failure(FailureReason::Unprocessable),
            StatusClass::DestinationUnknown => Verdict::Failure(FailureReason::DestinationUnknown),
            StatusClass::Pending | StatusClass::UnknownFailure => {
                Verdict::Failure(FailureReason::Unknown(status))
            }
        };
        Self {
            status: Some(status),
            class: Some(class),
            ..Self::new(target, counts, verdict)
        }
    }

    /// Fold an association-level error into an outcome
    pub fn from_error(target: RetrievalTarget, error: &DimseError, counts: &SubOperationCounts) -> Self {
        let reason = match error {
            DimseError::AssociationRejected(_)
            | DimseError::InvalidAeTitle(_)
            | DimseError::Config(_) => FailureReason::AssociationRejected,
            DimseError::DestinationUnknown { .. } => FailureReason::DestinationUnknown,
            DimseError::SubOperationFailure { .. } => FailureReason::SubOperationFailure,
            DimseError::QueryUnprocessable { .. } => FailureReason::Unprocessable,
            _ => FailureReason::ConnectionLost,
        };
        Self {
            detail: Some(error.to_string()),
            ..Self::new(target, counts, Verdict::Failure(reason))
        }
    }

    /// Outcome of a move interrupted by batch cancellation
    pub fn cancelled(target: RetrievalTarget, counts: &SubOperationCounts) -> Self {
        Self::new(target, counts, Verdict::Failure(FailureReason::Cancelled))
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }

    pub fn reason(&self) -> Option<&FailureReason> {
        match &self.verdict {
            Verdict::Success => None,
            Verdict::Failure(reason) => Some(reason),
        }
    }

    /// Error form of a failed outcome, for callers that propagate
    pub fn to_error(&self, destination: &str) -> Option<DimseError> {
        let status = self.status.unwrap_or(0);
        match self.reason()? {
            FailureReason::DestinationUnknown => Some(DimseError::DestinationUnknown {
                destination: destination.to_string(),
            }),
            FailureReason::SubOperationFailure => Some(DimseError::SubOperationFailure {
                status,
                failed: self.failed,
            }),
            FailureReason::Unprocessable => Some(DimseError::QueryUnprocessable { status }),
            FailureReason::AssociationRejected => Some(DimseError::AssociationRejected(
                self.detail.clone().unwrap_or_default(),
            )),
            FailureReason::ConnectionLost | FailureReason::Cancelled | FailureReason::Unknown(_) => {
                Some(DimseError::connection_lost(
                    self.detail.clone().unwrap_or_else(|| self.verdict_label()),
                ))
            }
        }
    }

    /// Short label for logs and reports
    pub fn verdict_label(&self) -> String {
        match &self.verdict {
            Verdict::Success => "success".to_string(),
            Verdict::Failure(reason) => format!("failure ({})", reason),
        }
    }
}
