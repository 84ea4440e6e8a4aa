//! Command, query, and event submission endpoints.
//!
//! Commands and queries are routed, not forwarded: the response names the
//! target instance and its endpoint, derived from the routed descriptor.
//! Events are appended to the log with sequence validation.

use std::collections::HashMap;
use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{error_response, request_context, AppState};
use crate::monitoring::metrics;

#[derive(Debug, Deserialize)]
pub struct SubmitCommandRequest {
    #[serde(default)]
    pub command_id: Option<String>,
    pub command_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitCommandResponse {
    pub ok: bool,
    pub command_id: String,
    pub target_instance: String,
    pub target_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitQueryRequest {
    #[serde(default)]
    pub query_id: Option<String>,
    pub query_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitQueryResponse {
    pub ok: bool,
    pub query_id: String,
    pub target_instance: String,
    pub target_endpoint: Option<String>,
    pub exec_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    #[serde(default)]
    pub event_id: Option<String>,
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// Expected sequence: `0` (or `1`) for a new aggregate, `current + 1`
    /// afterwards; absent to auto-assign.
    #[serde(default)]
    pub sequence: Option<i64>,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitEventResponse {
    pub ok: bool,
    pub event_internal_id: Uuid,
    pub sequence: i64,
}

/// Route a command deterministically by aggregate id.
pub async fn submit_command(
    state: web::Data<AppState>,
    body: web::Json<SubmitCommandRequest>,
) -> HttpResponse {
    let body = body.into_inner();

    match state
        .registry
        .route_command(&body.command_type, &body.aggregate_id)
        .await
    {
        Ok(target_instance) => {
            metrics::COMMANDS_ROUTED.with_label_values(&["routed"]).inc();
            let target_endpoint = state
                .registry
                .discover(
                    control_plane_core::instance::MessageKind::Command,
                    &body.command_type,
                    false,
                )
                .await
                .into_iter()
                .find(|d| d.instance_id == target_instance)
                .map(|d| d.endpoint());

            HttpResponse::Ok().json(SubmitCommandResponse {
                ok: true,
                command_id: body.command_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                target_instance,
                target_endpoint,
            })
        }
        Err(error) => {
            metrics::COMMANDS_ROUTED.with_label_values(&["no_handler"]).inc();
            error_response(&error)
        }
    }
}

/// Route a query to a random live handler.
pub async fn submit_query(
    state: web::Data<AppState>,
    body: web::Json<SubmitQueryRequest>,
) -> HttpResponse {
    let started = Instant::now();
    let body = body.into_inner();

    match state.registry.route_query(&body.query_type).await {
        Ok(target_instance) => {
            metrics::QUERIES_ROUTED.with_label_values(&["routed"]).inc();
            let target_endpoint = state
                .registry
                .discover(
                    control_plane_core::instance::MessageKind::Query,
                    &body.query_type,
                    false,
                )
                .await
                .into_iter()
                .find(|d| d.instance_id == target_instance)
                .map(|d| d.endpoint());

            HttpResponse::Ok().json(SubmitQueryResponse {
                ok: true,
                query_id: body.query_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                target_instance,
                target_endpoint,
                exec_ms: started.elapsed().as_millis() as u64,
            })
        }
        Err(error) => {
            metrics::QUERIES_ROUTED.with_label_values(&["no_handler"]).inc();
            error_response(&error)
        }
    }
}

/// Append a domain event with sequence validation.
pub async fn submit_event(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SubmitEventRequest>,
) -> HttpResponse {
    let ctx = request_context(&req);
    let body = body.into_inner();

    match state
        .events
        .store_event(
            &ctx,
            &body.aggregate_id,
            &body.aggregate_type,
            body.sequence,
            &body.event_type,
            body.payload,
            body.metadata,
        )
        .await
    {
        Ok(record) => HttpResponse::Ok().json(SubmitEventResponse {
            ok: true,
            event_internal_id: record.id,
            sequence: record.sequence_number,
        }),
        Err(error) => error_response(&error),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/messages")
            .route("/commands", web::post().to(submit_command))
            .route("/queries", web::post().to(submit_query))
            .route("/events", web::post().to(submit_event)),
    );
}
