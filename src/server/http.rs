use axum::{
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{error, instrument, span, Level, Span};
use uuid::Uuid;

use crate::provider::Provider;

/// Build the router for the health and metrics endpoint
pub fn router(provider: Arc<dyn Provider>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(provider)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MakeSpanWithId)
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Healthy iff the backend connection still answers round-trips
#[instrument(name = "status", skip_all)]
async fn status(State(provider): State<Arc<dyn Provider>>) -> StatusCode {
    match provider.health_check().await {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            error!(%error, "database health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Text exposition of everything in the default prometheus registry
#[instrument(name = "metrics", skip_all)]
async fn metrics() -> Response {
    let families = prometheus::gather();
    let encoder = TextEncoder::new();

    let mut buffer = vec![];
    if let Err(error) = encoder.encode(&families, &mut buffer) {
        error!(%error, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response()
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct MakeSpanWithId;

impl<B> MakeSpan<B> for MakeSpanWithId {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        span!(
            Level::INFO,
            "external-db-operator::request",
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            id = %Uuid::new_v4(),
        )
    }
}
