//! Server health, metrics exposition, and the health-change stream.

use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::AppState;
use crate::monitoring::metrics;

/// Liveness of the control plane itself.
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "subscribers": state.health.subscriber_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Prometheus text exposition.
pub async fn metrics_endpoint() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

/// Server-streaming health changes as server-sent events.
///
/// The subscriber is attached under the id in the path and primed with its
/// own current health record. Closing the connection drops the stream;
/// the next broadcast notices the closed mailbox and unsubscribes.
pub async fn health_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let subscriber_id = path.into_inner();
    let receiver = state.health.register_subscriber(&subscriber_id).await;

    let stream = ReceiverStream::new(receiver).map(|change| {
        let data = serde_json::to_string(&change).unwrap_or_default();
        Ok::<web::Bytes, actix_web::Error>(web::Bytes::from(format!("data: {}\n\n", data)))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/health/stream/{subscriber_id}", web::get().to(health_stream));
}

#[cfg(test)]
mod tests {
    use actix_web::{test, App};

    use crate::testing::in_memory_app_state as test_state;

    use super::*;

    #[actix_web::test]
    async fn test_health_endpoint() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
    }

    #[actix_web::test]
    async fn test_metrics_endpoint_renders_text() {
        crate::monitoring::metrics::init();
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_health_stream_attaches_subscriber() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/health/stream/monitor-1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        assert_eq!(state.health.subscriber_count().await, 1);
    }
}
