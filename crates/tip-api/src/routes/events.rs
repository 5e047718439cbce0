//! Routes for recording and looking up canonical events.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use tip_core::event::{CandidateEvent, Event};
use tracing::{info, instrument};
use uuid::Uuid;

use tip_ingestion::application::{command_handlers, query_handlers};
use tip_ingestion::domain::commands::RecordEvent;
use tip_ingestion::domain::outcome::IngestOutcome;

use crate::error::{ApiError, ErrorBody};
use crate::state::AppState;

/// Response body for POST /.
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    /// The recorded event, or the one already holding the dedupe key.
    pub event_id: Option<Uuid>,
    /// Whether the dedupe key was already recorded.
    pub duplicate: bool,
}

/// Query string for GET /.
#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    /// Dedupe key to look up.
    pub dedupe_key: String,
}

/// POST /
///
/// 201 for a new event, 200 for a repeat of a recorded dedupe key.
#[instrument(skip(state, candidate), fields(dedupe_key = %candidate.dedupe_key))]
async fn record_event(
    State(state): State<AppState>,
    Json(candidate): Json<CandidateEvent>,
) -> Result<(StatusCode, Json<RecordResponse>), ApiError> {
    let command = RecordEvent {
        correlation_id: Uuid::new_v4(),
        candidate,
    };

    info!(correlation_id = %command.correlation_id, "handling record_event command");

    let outcome = command_handlers::handle_record_event(
        &command,
        state.clock.as_ref(),
        state.event_store.as_ref(),
    )
    .await?;

    let status = match outcome {
        IngestOutcome::Recorded { .. } => StatusCode::CREATED,
        IngestOutcome::Duplicate { .. } => StatusCode::OK,
    };
    Ok((
        status,
        Json(RecordResponse {
            event_id: outcome.event_id(),
            duplicate: outcome.is_duplicate(),
        }),
    ))
}

/// GET /{event_id}
async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<Event>, ApiError> {
    let event = query_handlers::get_event_by_id(event_id, state.event_store.as_ref()).await?;
    Ok(Json(event))
}

/// GET /?dedupe_key=...
async fn find_by_dedupe_key(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Response, ApiError> {
    let found =
        query_handlers::find_event_by_dedupe_key(&query.dedupe_key, state.event_store.as_ref())
            .await?;
    Ok(match found {
        Some(event) => Json(event).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "event_not_found",
                message: format!("no event with dedupe key {}", query.dedupe_key),
            }),
        )
            .into_response(),
    })
}

/// Returns the router for the events resource.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(find_by_dedupe_key).post(record_event))
        .route("/{event_id}", get(get_event))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tip_test_support::{FixedClock, InMemoryEventStore, make_candidate};
    use tower::ServiceExt;

    fn app_state(store: Arc<InMemoryEventStore>) -> AppState {
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()));
        AppState::new(clock, store.clone(), store)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body_bytes).unwrap())
    }

    fn post(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_returns_201_then_200_for_repeat() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let app = router().with_state(app_state(store.clone()));
        let body = serde_json::to_value(make_candidate("wsb:2024-01-01:AAPL:post123")).unwrap();

        // Act
        let (first_status, first) = send(app.clone(), post(&body)).await;
        let (second_status, second) = send(app, post(&body)).await;

        // Assert
        assert_eq!(first_status, StatusCode::CREATED);
        assert_eq!(first["duplicate"], false);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(second["duplicate"], true);
        assert_eq!(first["event_id"], second["event_id"]);
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.outbox_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_candidate_returns_400() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let app = router().with_state(app_state(store.clone()));
        let mut candidate = make_candidate("wsb:2024-01-01:AAPL:post123");
        candidate.severity = 500;
        let body = serde_json::to_value(candidate).unwrap();

        // Act
        let (status, json) = send(app, post(&body)).await;

        // Assert
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transaction_returns_503_and_writes_nothing() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        store.fail_next_outbox_insert();
        let app = router().with_state(app_state(store.clone()));
        let body = serde_json::to_value(make_candidate("wsb:2024-01-01:AAPL:post123")).unwrap();

        // Act
        let (status, json) = send(app, post(&body)).await;

        // Assert
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "transaction_failure");
        assert!(store.events().is_empty());
        assert!(store.outbox_entries().is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_event_returns_404() {
        // Arrange
        let app = router().with_state(app_state(Arc::new(InMemoryEventStore::new())));
        let request = Request::builder()
            .uri(format!("/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();

        // Act
        let (status, json) = send(app, request).await;

        // Assert
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "event_not_found");
    }

    #[tokio::test]
    async fn test_lookup_by_dedupe_key() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let app = router().with_state(app_state(store));
        let body = serde_json::to_value(make_candidate("wsb:2024-01-01:AAPL:post123")).unwrap();
        let (_, recorded) = send(app.clone(), post(&body)).await;
        let request = Request::builder()
            .uri("/?dedupe_key=wsb:2024-01-01:AAPL:post123")
            .body(Body::empty())
            .unwrap();

        // Act
        let (status, json) = send(app, request).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["event_id"], recorded["event_id"]);
        assert_eq!(json["event_type"], "SOCIAL.MENTIONS");
    }
}
