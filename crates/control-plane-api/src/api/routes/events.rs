//! Event log read and replay endpoints.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::{error_response, AppState};

#[derive(Debug, Deserialize)]
pub struct AggregateEventsQuery {
    pub from_sequence: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub aggregate_type: Option<String>,
    pub event_type: Option<String>,
    pub from_ts: Option<DateTime<Utc>>,
    pub to_ts: Option<DateTime<Utc>>,
    pub after_ts: Option<DateTime<Utc>>,
}

/// Events of one aggregate in sequence order.
pub async fn aggregate_events(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<AggregateEventsQuery>,
) -> HttpResponse {
    let aggregate_id = path.into_inner();
    match state
        .events
        .events_for_aggregate(&aggregate_id, query.from_sequence)
        .await
    {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(error) => error_response(&error),
    }
}

/// Current and next sequence numbers of an aggregate.
pub async fn aggregate_sequence(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let aggregate_id = path.into_inner();
    match state.events.latest_sequence(&aggregate_id).await {
        Ok(latest) => HttpResponse::Ok().json(serde_json::json!({
            "aggregate_id": aggregate_id,
            "latest_sequence": latest,
            "next_sequence": latest + 1,
        })),
        Err(error) => error_response(&error),
    }
}

/// Snapshot-accelerated replay of one aggregate.
pub async fn aggregate_replay(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let aggregate_id = path.into_inner();
    match state.events.events_for_replay_with_snapshot(&aggregate_id).await {
        Ok(replay) => HttpResponse::Ok().json(replay),
        Err(error) => error_response(&error),
    }
}

/// Cross-aggregate replay, filtered by aggregate type, event type, or
/// timestamp; unfiltered returns the full log in time order.
pub async fn replay(state: web::Data<AppState>, query: web::Query<ReplayQuery>) -> HttpResponse {
    let query = query.into_inner();

    let result = if let Some(aggregate_type) = &query.aggregate_type {
        state
            .events
            .events_by_aggregate_type(aggregate_type, query.from_ts, query.to_ts)
            .await
    } else if let Some(event_type) = &query.event_type {
        state
            .events
            .events_by_event_type(event_type, query.from_ts, query.to_ts)
            .await
    } else if let Some(after_ts) = query.after_ts {
        state.events.events_after_timestamp(after_ts).await
    } else {
        state
            .events
            .events_after_timestamp(DateTime::<Utc>::MIN_UTC)
            .await
    };

    match result {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(error) => error_response(&error),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/events")
            .route("/replay", web::get().to(replay))
            .route("/{aggregate_id}", web::get().to(aggregate_events))
            .route("/{aggregate_id}/sequence", web::get().to(aggregate_sequence))
            .route("/{aggregate_id}/replay", web::get().to(aggregate_replay)),
    );
}

#[cfg(test)]
mod tests {
    use actix_web::{test, App};

    use crate::db::events::EventRecord;
    use crate::testing::in_memory_app_state as test_state;

    use super::*;

    async fn seed_events(state: &web::Data<AppState>) {
        let ctx = control_plane_core::context::RequestContext::new();
        for i in 1..=3 {
            state
                .events
                .store_event(
                    &ctx,
                    "u-1",
                    "User",
                    Some(i),
                    "Tick",
                    serde_json::json!({"i": i}),
                    None,
                )
                .await
                .unwrap();
        }
    }

    #[actix_web::test]
    async fn test_aggregate_events_and_sequence() {
        let state = test_state();
        seed_events(&state).await;
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/events/u-1").to_request();
        let events: Vec<EventRecord> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence_number, 1);

        let req = test::TestRequest::get()
            .uri("/events/u-1?from_sequence=3")
            .to_request();
        let events: Vec<EventRecord> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(events.len(), 1);

        let req = test::TestRequest::get().uri("/events/u-1/sequence").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["latest_sequence"], 3);
        assert_eq!(body["next_sequence"], 4);
    }

    #[actix_web::test]
    async fn test_replay_filters() {
        let state = test_state();
        seed_events(&state).await;
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/events/replay?aggregate_type=User")
            .to_request();
        let events: Vec<EventRecord> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(events.len(), 3);

        let req = test::TestRequest::get()
            .uri("/events/replay?event_type=Missing")
            .to_request();
        let events: Vec<EventRecord> = test::call_and_read_body_json(&app, req).await;
        assert!(events.is_empty());

        let req = test::TestRequest::get().uri("/events/replay").to_request();
        let events: Vec<EventRecord> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(events.len(), 3);
    }
}
