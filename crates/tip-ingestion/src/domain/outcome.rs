//! Result of an ingestion call.

use serde::Serialize;
use uuid::Uuid;

/// What `record_event` did with a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A new event and its outbox row were written.
    Recorded {
        /// The assigned identity.
        event_id: Uuid,
    },
    /// The dedupe key was already recorded; nothing was written.
    Duplicate {
        /// The dedupe key that matched.
        dedupe_key: String,
        /// The identity of the existing event, when it could be resolved.
        existing_event_id: Option<Uuid>,
    },
}

impl IngestOutcome {
    /// The identity the caller should use for this occurrence.
    #[must_use]
    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            Self::Recorded { event_id } => Some(*event_id),
            Self::Duplicate {
                existing_event_id, ..
            } => *existing_event_id,
        }
    }

    /// Whether the candidate was a repeat of a recorded event.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}
