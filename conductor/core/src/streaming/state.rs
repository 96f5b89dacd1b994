//! Message status transitions
//!
//! ```text
//! pending ──token──▶ streaming ──done──▶ complete
//!    │                   │
//!    └──────┬────────────┘
//!           ▼
//!   aborted | error
//! ```
//!
//! Terminal states are final for the session that reached them. A new
//! session may later resume an `error` (or orphaned) message, which starts
//! again from `pending`.

use crate::model::MessageStatus;

/// Whether a session may move a message from `from` to `to`
#[must_use]
pub fn can_transition(from: MessageStatus, to: MessageStatus) -> bool {
    use MessageStatus::{Aborted, Complete, Error, Pending, Streaming};
    matches!(
        (from, to),
        (Pending, Streaming)
            | (Streaming, Complete)
            | (Pending | Streaming, Aborted | Error)
    )
}

/// Status of one session, enforcing legal transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SessionState {
    status: MessageStatus,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            status: MessageStatus::Pending,
        }
    }

    pub(crate) fn status(self) -> MessageStatus {
        self.status
    }

    /// Move to `to`; returns `false` and stays put on an illegal transition
    pub(crate) fn advance(&mut self, to: MessageStatus) -> bool {
        if can_transition(self.status, to) {
            self.status = to;
            true
        } else {
            tracing::warn!(from = %self.status, to = %to, "Rejected status transition");
            false
        }
    }
}
