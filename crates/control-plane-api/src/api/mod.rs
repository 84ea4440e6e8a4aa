//! HTTP surface of the control plane.

pub mod routes;

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};

use control_plane_core::context::RequestContext;
use control_plane_core::error::ControlPlaneError;

use crate::events::EventStoreService;
use crate::health::StreamingHealthService;
use crate::registry::HandlerRegistry;

/// Shared handler state.
pub struct AppState {
    pub registry: Arc<HandlerRegistry>,
    pub events: Arc<EventStoreService>,
    pub health: Arc<StreamingHealthService>,
}

/// Wire every route group.
pub fn init_routes(cfg: &mut web::ServiceConfig) {
    routes::registry::configure(cfg);
    routes::messages::configure(cfg);
    routes::events::configure(cfg);
    routes::health::configure(cfg);
}

/// Context for one request, continuing the caller's correlation id when
/// the `x-correlation-id` header is present.
pub fn request_context(req: &HttpRequest) -> RequestContext {
    match req
        .headers()
        .get("x-correlation-id")
        .and_then(|value| value.to_str().ok())
    {
        Some(correlation_id) => RequestContext::with_correlation_id(correlation_id),
        None => RequestContext::new(),
    }
}

/// Map an error to its HTTP response.
pub fn error_response(error: &ControlPlaneError) -> HttpResponse {
    let status = match error {
        ControlPlaneError::ValidationError { .. } => StatusCode::BAD_REQUEST,
        ControlPlaneError::SequenceConflict { .. } => StatusCode::CONFLICT,
        ControlPlaneError::NoHealthyHandler { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ControlPlaneError::RegistryUnavailable { .. }
        | ControlPlaneError::StorageUnavailable { .. } => StatusCode::BAD_GATEWAY,
        ControlPlaneError::SerializationError { .. }
        | ControlPlaneError::ConfigurationError { .. }
        | ControlPlaneError::Cancelled { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    HttpResponse::build(status).json(serde_json::json!({
        "ok": false,
        "error": error.code(),
        "message": error.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let conflict = ControlPlaneError::SequenceConflict {
            aggregate_id: "u-1".to_string(),
            expected: 1,
            current: 2,
        };
        assert_eq!(error_response(&conflict).status(), StatusCode::CONFLICT);

        let no_handler = ControlPlaneError::NoHealthyHandler {
            kind: "command".to_string(),
            message_type: "X".to_string(),
        };
        assert_eq!(
            error_response(&no_handler).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let invalid = ControlPlaneError::validation("nope");
        assert_eq!(error_response(&invalid).status(), StatusCode::BAD_REQUEST);
    }
}
