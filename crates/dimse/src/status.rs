//! DIMSE status classification
//!
//! Status codes (PS3.7 Annex C) are classified through one ordered rule table.
//! The first rule whose masked value matches wins; the last rule matches
//! everything, so the mapping is total.
//!
//! | Status            | Class              |
//! |-------------------|--------------------|
//! | `0x0000`          | Success            |
//! | `0x0001`, `0x0107`, `0xBxxx` | Success (warning: completed with caveats) |
//! | `0xFF00`, `0xFF01`| Pending            |
//! | `0xA801`          | DestinationUnknown |
//! | `0xA7xx`          | ResourceExhausted  |
//! | `0xCxxx`          | Unprocessable      |
//! | anything else     | UnknownFailure     |

use serde::{Deserialize, Serialize};

/// Success
pub const STATUS_SUCCESS: u16 = 0x0000;
/// Pending: matches/sub-operations are continuing
pub const STATUS_PENDING: u16 = 0xFF00;
/// Pending: optional keys were not supported for this match
pub const STATUS_PENDING_OPTIONAL_KEYS: u16 = 0xFF01;
/// Cancel acknowledged
pub const STATUS_CANCEL: u16 = 0xFE00;
/// Refused: out of resources, unable to perform sub-operations
pub const STATUS_SUBOPS_OUT_OF_RESOURCES: u16 = 0xA702;
/// Refused: out of resources
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;
/// Refused: move destination unknown
pub const STATUS_MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
/// Error: cannot understand / unable to process
pub const STATUS_UNABLE_TO_PROCESS: u16 = 0xC000;
/// Warning: sub-operations complete, one or more failures
pub const STATUS_SUBOPS_WARNING: u16 = 0xB000;
/// Failure: processing failure
pub const STATUS_PROCESSING_FAILURE: u16 = 0x0110;
/// Failure: unrecognized operation
pub const STATUS_UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// Classification of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusClass {
    Success,
    Pending,
    Unprocessable,
    ResourceExhausted,
    DestinationUnknown,
    UnknownFailure,
}

#[derive(Debug, Clone, Copy)]
struct StatusRule {
    mask: u16,
    value: u16,
    class: StatusClass,
}

impl StatusRule {
    const fn exact(value: u16, class: StatusClass) -> Self {
        Self {
            mask: 0xFFFF,
            value,
            class,
        }
    }

    const fn masked(mask: u16, value: u16, class: StatusClass) -> Self {
        Self { mask, value, class }
    }

    fn matches(&self, status: u16) -> bool {
        status & self.mask == self.value
    }
}

const STATUS_RULES: &[StatusRule] = &[
    StatusRule::exact(STATUS_SUCCESS, StatusClass::Success),
    StatusRule::exact(0x0001, StatusClass::Success),
    StatusRule::exact(0x0107, StatusClass::Success),
    StatusRule::masked(0xF000, STATUS_SUBOPS_WARNING, StatusClass::Success),
    StatusRule::exact(STATUS_PENDING, StatusClass::Pending),
    StatusRule::exact(STATUS_PENDING_OPTIONAL_KEYS, StatusClass::Pending),
    StatusRule::exact(STATUS_MOVE_DESTINATION_UNKNOWN, StatusClass::DestinationUnknown),
    StatusRule::masked(0xFF00, STATUS_OUT_OF_RESOURCES, StatusClass::ResourceExhausted),
    StatusRule::masked(0xF000, STATUS_UNABLE_TO_PROCESS, StatusClass::Unprocessable),
    // Catch-all keeps the table total.
    StatusRule::masked(0x0000, 0x0000, StatusClass::UnknownFailure),
];

/// Classify a status code
pub fn classify(status: u16) -> StatusClass {
    STATUS_RULES
        .iter()
        .find(|rule| rule.matches(status))
        .map(|rule| rule.class)
        .unwrap_or(StatusClass::UnknownFailure)
}

impl StatusClass {
    /// Whether the class is a failure of some kind
    pub fn is_failure(self) -> bool {
        !matches!(self, StatusClass::Success | StatusClass::Pending)
    }

    /// Short label used in logs and reports
    pub fn label(self) -> &'static str {
        match self {
            StatusClass::Success => "success",
            StatusClass::Pending => "pending",
            StatusClass::Unprocessable => "unprocessable",
            StatusClass::ResourceExhausted => "resource-exhausted",
            StatusClass::DestinationUnknown => "destination-unknown",
            StatusClass::UnknownFailure => "unknown-failure",
        }
    }
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether the status is one of the warning codes folded into `Success`
pub fn is_warning(status: u16) -> bool {
    classify(status) == StatusClass::Success && status != STATUS_SUCCESS
}
