//! Internal HTTP surface: event ingest plus the admin API.

pub mod circuits;
pub mod deliveries;
pub mod events;
pub mod stats;
pub mod webhooks;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};

use crate::{auth::admin_auth, state::AppState};

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/deliveries", get(deliveries::list_deliveries_handler))
        .route("/deliveries/:id", get(deliveries::get_delivery_handler))
        .route(
            "/deliveries/:id/attempts",
            get(deliveries::list_attempts_handler),
        )
        .route(
            "/deliveries/:id/retry",
            post(deliveries::retry_delivery_handler),
        )
        .route(
            "/deliveries/:id/cancel",
            post(deliveries::cancel_delivery_handler),
        )
        .route("/stats", get(stats::stats_handler))
        .route("/webhooks", post(webhooks::create_webhook_handler))
        .route(
            "/webhooks/:id",
            get(webhooks::get_webhook_handler).delete(webhooks::delete_webhook_handler),
        )
        .route("/webhooks/:id/health", get(webhooks::health_handler))
        .route(
            "/webhooks/:id/status",
            put(webhooks::update_status_handler),
        )
        .route("/circuits", get(circuits::list_circuits_handler))
        .route("/circuits/:key/open", post(circuits::open_circuit_handler))
        .route("/circuits/:key/close", post(circuits::close_circuit_handler))
        .route("/circuits/:key/reset", post(circuits::reset_circuit_handler))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new()
        .route("/internal/events", post(events::emit_event_handler))
        .nest("/api/admin", admin)
        .with_state(state)
}
