//! End-to-end routing behavior over in-memory backends.

use std::collections::HashMap;
use std::collections::HashSet;

use control_plane_api::bootstrap::ControlPlaneServer;
use control_plane_core::config::ControlPlaneConfig;
use control_plane_core::context::RequestContext;
use control_plane_core::instance::{InstanceDescriptor, InstanceStatus, MessageKind};

fn command_worker(id: &str) -> InstanceDescriptor {
    InstanceDescriptor::new(id, "user-service", "10.0.0.1", 9100)
        .with_version("1.0.0")
        .with_command_types(["CreateUserCommand"])
}

#[tokio::test]
async fn two_workers_deterministic_routing() {
    let server = ControlPlaneServer::build_in_memory(ControlPlaneConfig::default());
    let ctx = RequestContext::new();

    server.registry.register(&command_worker("w-A"), &ctx).await.unwrap();
    server.registry.register(&command_worker("w-B"), &ctx).await.unwrap();

    let mut targets = HashSet::new();
    for _ in 0..5 {
        let target = server
            .registry
            .route_command("CreateUserCommand", "u-123")
            .await
            .unwrap();
        assert!(target == "w-A" || target == "w-B");
        targets.insert(target);
    }

    assert_eq!(targets.len(), 1, "same aggregate must map to one instance");
}

#[tokio::test]
async fn failover_after_unhealthy_heartbeat() {
    let server = ControlPlaneServer::build_in_memory(ControlPlaneConfig::default());
    let ctx = RequestContext::new();

    server.registry.register(&command_worker("w-A"), &ctx).await.unwrap();
    server.registry.register(&command_worker("w-B"), &ctx).await.unwrap();

    // Force the pre-failover target to be w-A regardless of the hash by
    // finding an aggregate that maps there.
    let mut aggregate = None;
    for n in 0..64 {
        let candidate = format!("u-{}", n);
        if server
            .registry
            .route_command("CreateUserCommand", &candidate)
            .await
            .unwrap()
            == "w-A"
        {
            aggregate = Some(candidate);
            break;
        }
    }
    let aggregate = aggregate.expect("some aggregate maps to w-A");

    server
        .health
        .update_instance_health("w-A", InstanceStatus::Unhealthy, HashMap::new())
        .await
        .unwrap();

    let target = server
        .registry
        .route_command("CreateUserCommand", &aggregate)
        .await
        .unwrap();
    assert_eq!(target, "w-B");
}

#[tokio::test]
async fn no_healthy_handler_when_all_workers_unhealthy() {
    let server = ControlPlaneServer::build_in_memory(ControlPlaneConfig::default());
    let ctx = RequestContext::new();

    server.registry.register(&command_worker("w-A"), &ctx).await.unwrap();
    server
        .health
        .update_instance_health("w-A", InstanceStatus::Unhealthy, HashMap::new())
        .await
        .unwrap();

    let result = server.registry.route_command("CreateUserCommand", "u-1").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn discover_sees_instance_for_every_registered_type() {
    let server = ControlPlaneServer::build_in_memory(ControlPlaneConfig::default());
    let ctx = RequestContext::new();

    let descriptor = InstanceDescriptor::new("w-A", "user-service", "10.0.0.1", 9100)
        .with_command_types(["CreateUserCommand", "DeleteUserCommand"])
        .with_query_types(["GetUserQuery"])
        .with_event_types(["UserCreatedEvent"]);
    server.registry.register(&descriptor, &ctx).await.unwrap();

    for (kind, message_type) in [
        (MessageKind::Command, "CreateUserCommand"),
        (MessageKind::Command, "DeleteUserCommand"),
        (MessageKind::Query, "GetUserQuery"),
        (MessageKind::Event, "UserCreatedEvent"),
    ] {
        let found = server.registry.discover(kind, message_type, false).await;
        assert!(
            found.iter().any(|d| d.instance_id == "w-A"),
            "missing w-A for {} {}",
            kind,
            message_type
        );
    }
}

#[tokio::test]
async fn unregister_clears_every_route_set() {
    let server = ControlPlaneServer::build_in_memory(ControlPlaneConfig::default());
    let ctx = RequestContext::new();

    let descriptor = InstanceDescriptor::new("w-A", "user-service", "10.0.0.1", 9100)
        .with_command_types(["CreateUserCommand"])
        .with_event_types(["UserCreatedEvent"]);
    server.registry.register(&descriptor, &ctx).await.unwrap();

    server.registry.unregister("w-A", None).await.unwrap();

    for (kind, message_type) in [
        (MessageKind::Command, "CreateUserCommand"),
        (MessageKind::Event, "UserCreatedEvent"),
    ] {
        assert!(server.registry.instances_for(kind, message_type).await.is_empty());
    }
    assert!(server.registry.list_instances().await.is_empty());
}

#[tokio::test]
async fn event_handlers_are_discovered_as_a_set() {
    let server = ControlPlaneServer::build_in_memory(ControlPlaneConfig::default());
    let ctx = RequestContext::new();

    for id in ["w-A", "w-B", "w-C"] {
        let descriptor = InstanceDescriptor::new(id, "projector", "10.0.0.2", 9200)
            .with_event_types(["UserCreatedEvent"]);
        server.registry.register(&descriptor, &ctx).await.unwrap();
    }

    let handlers = server.registry.discover_event_handlers("UserCreatedEvent").await;
    let ids: Vec<&str> = handlers.iter().map(|d| d.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["w-A", "w-B", "w-C"]);
}
