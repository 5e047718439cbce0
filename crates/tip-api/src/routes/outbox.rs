//! Routes for inspecting the outbox and releasing quarantined rows.

use axum::extract::{Path, Query, State};
use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tip_core::outbox::{BacklogStats, OutboxEntry};
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_QUARANTINE_LIMIT: usize = 100;

/// Query string for GET /quarantined.
#[derive(Debug, Deserialize)]
pub struct QuarantinedQuery {
    /// Maximum rows to return.
    pub limit: Option<usize>,
}

/// Response body for POST /{outbox_id}/release.
#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    /// The row acted on.
    pub outbox_id: i64,
    /// `false` if the row was not quarantined.
    pub released: bool,
}

/// GET /backlog
async fn backlog(State(state): State<AppState>) -> Result<Json<BacklogStats>, ApiError> {
    let stats = state.outbox.backlog_stats(state.clock.now()).await?;
    Ok(Json(stats))
}

/// GET /quarantined
async fn quarantined(
    State(state): State<AppState>,
    Query(query): Query<QuarantinedQuery>,
) -> Result<Json<Vec<OutboxEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_QUARANTINE_LIMIT);
    let rows = state.outbox.list_quarantined(limit).await?;
    Ok(Json(rows))
}

/// POST /{outbox_id}/release
#[instrument(skip(state))]
async fn release(
    State(state): State<AppState>,
    Path(outbox_id): Path<i64>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let released = state.outbox.release_quarantined(outbox_id).await?;
    info!(outbox_id, released, "release requested");
    Ok(Json(ReleaseResponse {
        outbox_id,
        released,
    }))
}

/// Returns the router for outbox operations.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backlog", get(backlog))
        .route("/quarantined", get(quarantined))
        .route("/{outbox_id}/release", post(release))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tip_core::outbox::{BusMessage, DeliveryFailure};
    use tip_core::store::{EventStore, OutboxRepository};
    use tip_test_support::{FixedClock, InMemoryEventStore, make_event};
    use tower::ServiceExt;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn app_state(store: Arc<InMemoryEventStore>) -> AppState {
        AppState::new(Arc::new(FixedClock(now())), store.clone(), store)
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body_bytes).unwrap())
    }

    async fn seed(store: &InMemoryEventStore, key: &str, minutes_ago: i64) -> i64 {
        let event = make_event(key, now() - Duration::minutes(minutes_ago));
        store
            .record_event(&event, &BusMessage::from(&event).to_payload())
            .await
            .unwrap();
        store.outbox_entry_for(event.event_id).unwrap().outbox_id
    }

    async fn quarantine(store: &InMemoryEventStore, outbox_id: i64) {
        let failure = DeliveryFailure {
            error: "permanent publish failure: too large".into(),
            next_attempt_at: None,
            quarantine: true,
        };
        store.record_failure(outbox_id, &failure, now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_reports_pending_and_age() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, "a", 30).await;
        seed(&store, "b", 5).await;
        let app = router().with_state(app_state(store));

        // Act
        let (status, json) = send(app, "GET", "/backlog").await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pending"], 2);
        assert_eq!(json["quarantined"], 0);
        assert_eq!(json["oldest_pending_age_secs"], 1800);
    }

    #[tokio::test]
    async fn test_quarantined_rows_are_listed_and_released() {
        // Arrange
        let store = Arc::new(InMemoryEventStore::new());
        let outbox_id = seed(&store, "poison", 10).await;
        quarantine(&store, outbox_id).await;
        let app = router().with_state(app_state(store.clone()));

        // Act
        let (list_status, listed) = send(app.clone(), "GET", "/quarantined").await;
        let (release_status, released) =
            send(app, "POST", &format!("/{outbox_id}/release")).await;

        // Assert
        assert_eq!(list_status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["outbox_id"], outbox_id);
        assert_eq!(release_status, StatusCode::OK);
        assert_eq!(released["released"], true);
        assert!(store.outbox_entries()[0].is_pending());
    }

    #[tokio::test]
    async fn test_release_of_unknown_row_returns_404() {
        // Arrange
        let app = router().with_state(app_state(Arc::new(InMemoryEventStore::new())));

        // Act
        let (status, json) = send(app, "POST", "/42/release").await;

        // Assert
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "outbox_entry_not_found");
    }
}
