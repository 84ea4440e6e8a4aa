//! Registration, discovery, and heartbeat endpoints.

use std::collections::{BTreeSet, HashMap};

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use control_plane_core::error::ControlPlaneError;
use control_plane_core::instance::{InstanceDescriptor, InstanceStatus, MessageKind};

use crate::api::{error_response, request_context, AppState};

/// Registration request body.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub command_types: BTreeSet<String>,
    #[serde(default)]
    pub query_types: BTreeSet<String>,
    #[serde(default)]
    pub event_types: BTreeSet<String>,
    /// Optional per-message-type payload schemas, kept with the instance
    /// record for discovery tooling.
    #[serde(default)]
    pub schemas: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub ok: bool,
    pub registration_id: String,
    pub counts: crate::registry::BindingCounts,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterQuery {
    /// Comma-separated kinds to remove; absent means all.
    pub kinds: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub ok: bool,
    pub counts: crate::registry::BindingCounts,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    #[serde(default)]
    pub only_healthy: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub instances: Vec<InstanceDescriptor>,
    pub total: usize,
    pub healthy: usize,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub next_interval_s: u64,
}

#[derive(Debug, Serialize)]
pub struct InstanceListEntry {
    #[serde(flatten)]
    pub descriptor: InstanceDescriptor,
    pub live: bool,
}

/// Register a worker instance and its handler bindings.
pub async fn register(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> HttpResponse {
    let ctx = request_context(&req);
    let body = body.into_inner();

    let mut metadata = body.metadata;
    if let Some(schemas) = &body.schemas {
        match serde_json::to_string(schemas) {
            Ok(serialized) => {
                metadata.insert("schemas".to_string(), serialized);
            }
            Err(error) => {
                return error_response(&ControlPlaneError::SerializationError {
                    message: format!("schemas: {}", error),
                })
            }
        }
    }

    let descriptor = InstanceDescriptor {
        instance_id: body.instance_id,
        service_name: body.service_name,
        host: body.host,
        port: body.port,
        version: body.version,
        metadata,
        command_types: body.command_types,
        query_types: body.query_types,
        event_types: body.event_types,
        status: InstanceStatus::Starting,
        last_heartbeat: chrono::Utc::now().timestamp_millis(),
    };

    match state.registry.register(&descriptor, &ctx).await {
        Ok(summary) => HttpResponse::Ok().json(RegisterResponse {
            ok: true,
            registration_id: summary.registration_id,
            counts: summary.counts,
        }),
        Err(error) => error_response(&error),
    }
}

/// Remove bindings (all kinds unless narrowed by `?kinds=`).
pub async fn unregister(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UnregisterQuery>,
) -> HttpResponse {
    let instance_id = path.into_inner();

    let kinds = match &query.kinds {
        None => None,
        Some(raw) => {
            let mut kinds = Vec::new();
            for part in raw.split(',').filter(|p| !p.is_empty()) {
                match MessageKind::parse(part) {
                    Some(kind) => kinds.push(kind),
                    None => {
                        return error_response(&ControlPlaneError::validation(format!(
                            "unknown message kind: {}",
                            part
                        )))
                    }
                }
            }
            Some(kinds)
        }
    };

    match state.registry.unregister(&instance_id, kinds.as_deref()).await {
        Ok(counts) => HttpResponse::Ok().json(UnregisterResponse { ok: true, counts }),
        Err(error) => error_response(&error),
    }
}

/// Discover handlers of one message type.
pub async fn discover(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<DiscoverQuery>,
) -> HttpResponse {
    let (kind_raw, message_type) = path.into_inner();

    let kind = match MessageKind::parse(&kind_raw) {
        Some(kind) => kind,
        None => {
            return error_response(&ControlPlaneError::validation(format!(
                "unknown message kind: {}",
                kind_raw
            )))
        }
    };

    let instances = state.registry.discover(kind, &message_type, query.only_healthy).await;
    let mut healthy = 0;
    for instance in &instances {
        if state.registry.is_live(&instance.instance_id).await {
            healthy += 1;
        }
    }

    HttpResponse::Ok().json(DiscoverResponse {
        total: instances.len(),
        healthy,
        instances,
    })
}

/// All known instances with liveness, for monitors.
pub async fn list_instances(state: web::Data<AppState>) -> HttpResponse {
    let instances: Vec<InstanceListEntry> = state
        .registry
        .list_instances()
        .await
        .into_iter()
        .map(|(descriptor, live)| InstanceListEntry { descriptor, live })
        .collect();
    HttpResponse::Ok().json(instances)
}

/// Message types of one kind an instance handles.
pub async fn handled_types(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (instance_id, kind_raw) = path.into_inner();
    let kind = match MessageKind::parse(&kind_raw) {
        Some(kind) => kind,
        None => {
            return error_response(&ControlPlaneError::validation(format!(
                "unknown message kind: {}",
                kind_raw
            )))
        }
    };

    let types = state.registry.handled_types(&instance_id, kind).await;
    HttpResponse::Ok().json(types)
}

/// Instance ids of one service.
pub async fn service_instances(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let service_name = path.into_inner();
    let ids = state.registry.service_instances(&service_name).await;
    HttpResponse::Ok().json(ids)
}

/// Ingest a heartbeat; the response carries the next expected interval.
pub async fn heartbeat(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<HeartbeatRequest>,
) -> HttpResponse {
    let instance_id = path.into_inner();
    let body = body.into_inner();

    match state
        .health
        .update_instance_health(&instance_id, body.status, body.metadata)
        .await
    {
        Ok(()) => HttpResponse::Ok().json(HeartbeatResponse {
            ok: true,
            next_interval_s: state.health.heartbeat_interval_seconds(),
        }),
        Err(error) => error_response(&error),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/registry")
            .route("/instances", web::post().to(register))
            .route("/instances", web::get().to(list_instances))
            .route("/instances/{id}", web::delete().to(unregister))
            .route("/instances/{id}/heartbeat", web::post().to(heartbeat))
            .route("/instances/{id}/handlers/{kind}", web::get().to(handled_types))
            .route("/handlers/{kind}/{message_type}", web::get().to(discover))
            .route("/services/{name}", web::get().to(service_instances)),
    );
}
