//! Bill run status state machine
//!
//! Every status change goes through [`BillRunStatus::transition`]. The
//! resulting [`StatusTransition`] is the only value the repository accepts
//! for a status update, and it is applied as a compare-and-set on the prior
//! status.
//!
//! ```text
//! queued     -> processing | cancel
//! processing -> review | ready | empty | error | cancel
//! review     -> processing | empty
//! ready      -> sending
//! sending    -> sent
//! cancel     -> empty
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillRunStatus {
    Queued,
    Processing,
    Review,
    Ready,
    Sending,
    Sent,
    Cancel,
    Error,
    Empty,
}

impl BillRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillRunStatus::Queued => "queued",
            BillRunStatus::Processing => "processing",
            BillRunStatus::Review => "review",
            BillRunStatus::Ready => "ready",
            BillRunStatus::Sending => "sending",
            BillRunStatus::Sent => "sent",
            BillRunStatus::Cancel => "cancel",
            BillRunStatus::Error => "error",
            BillRunStatus::Empty => "empty",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BillRunStatus::Queued),
            "processing" => Some(BillRunStatus::Processing),
            "review" => Some(BillRunStatus::Review),
            "ready" => Some(BillRunStatus::Ready),
            "sending" => Some(BillRunStatus::Sending),
            "sent" => Some(BillRunStatus::Sent),
            "cancel" => Some(BillRunStatus::Cancel),
            "error" => Some(BillRunStatus::Error),
            "empty" => Some(BillRunStatus::Empty),
            _ => None,
        }
    }

    /// Statuses the busy checker treats as "building"
    pub const BUILDING: [BillRunStatus; 3] = [
        BillRunStatus::Processing,
        BillRunStatus::Queued,
        BillRunStatus::Sending,
    ];

    pub fn is_building(&self) -> bool {
        Self::BUILDING.contains(self)
    }

    pub fn is_cancelling(&self) -> bool {
        matches!(self, BillRunStatus::Cancel)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillRunStatus::Sent | BillRunStatus::Empty | BillRunStatus::Error
        )
    }

    pub fn can_transition_to(&self, next: BillRunStatus) -> bool {
        use BillRunStatus::*;

        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancel)
                | (Processing, Review)
                | (Processing, Ready)
                | (Processing, Empty)
                | (Processing, Error)
                | (Processing, Cancel)
                | (Review, Processing)
                | (Review, Empty)
                | (Ready, Sending)
                | (Sending, Sent)
                | (Cancel, Empty)
        )
    }

    /// Validate a move from `self` to `next`
    pub fn transition(self, next: BillRunStatus) -> Result<StatusTransition, TransitionError> {
        if self.can_transition_to(next) {
            Ok(StatusTransition {
                from: self,
                to: next,
            })
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for BillRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated status change. Only constructible through
/// [`BillRunStatus::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    from: BillRunStatus,
    to: BillRunStatus,
}

impl StatusTransition {
    pub fn from(&self) -> BillRunStatus {
        self.from
    }

    pub fn to(&self) -> BillRunStatus {
        self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Bill run cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: BillRunStatus,
    pub to: BillRunStatus,
}
