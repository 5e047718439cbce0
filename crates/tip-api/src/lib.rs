//! HTTP surface of the trading intel pipeline: event ingestion, event
//! lookup, and outbox operations.

pub mod error;
pub mod routes;
pub mod state;

use axum::Router;

/// Builds the full application router over `state`.
pub fn app(state: state::AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1/events", routes::events::router())
        .nest("/api/v1/outbox", routes::outbox::router())
        .with_state(state)
}
