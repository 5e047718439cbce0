//! Commands for the ingestion context.

use tip_core::event::CandidateEvent;
use uuid::Uuid;

/// Command to record a candidate event.
#[derive(Debug, Clone)]
pub struct RecordEvent {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The proposed event.
    pub candidate: CandidateEvent,
}
