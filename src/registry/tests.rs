use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{RegistryEvent, ServiceRegistry};
use crate::config::{Backoff, DeliverySettings};
use crate::message::{Envelope, Message, MessagePath, MessagePolicy};
use crate::topology::{HandleInfo, HostInfo, ServiceInfo, TopologyEvent};
use crate::transport::Frame;
use crate::transport::mock::MockTransport;

fn delivery() -> DeliverySettings {
    DeliverySettings {
        retry_interval_ms: 10,
        backoff: Backoff::Fixed,
        max_backoff_ms: 100,
        ack_timeout_ms: 50,
        default_max_retries: None,
        default_timeout_ms: None,
    }
}

fn envelope(handle: &str, policy: MessagePolicy) -> Envelope {
    Envelope {
        message: Message::new(b"payload".to_vec(), MessagePath::new("search", handle), policy),
        identity: "search".to_string(),
        signature: vec![0u8; 64],
    }
}

fn urgent() -> MessagePolicy {
    MessagePolicy {
        urgent: true,
        ..MessagePolicy::default()
    }
}

fn snapshot(hosts: &[(&str, &[&str])], failing: &[&str]) -> ServiceInfo {
    let mut info = ServiceInfo::empty("search");
    for (id, handles) in hosts {
        info.hosts.insert(id.to_string(), HostInfo::from_address(*id));
        info.handles.insert(
            id.to_string(),
            handles
                .iter()
                .map(|h| HandleInfo {
                    name: h.to_string(),
                    endpoint: id.to_string(),
                })
                .collect(),
        );
    }
    for id in failing {
        info.failing.insert(id.to_string());
    }
    info
}

fn change(previous: &ServiceInfo, next: ServiceInfo) -> TopologyEvent {
    TopologyEvent::diff(previous, Arc::new(next))
}

fn setup() -> (
    Arc<MockTransport>,
    Arc<ServiceRegistry>,
    mpsc::UnboundedReceiver<RegistryEvent>,
) {
    let transport = Arc::new(MockTransport::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = ServiceRegistry::new("search", transport.clone(), delivery(), tx);
    (transport, registry, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RegistryEvent>) -> Vec<RegistryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_urgent_messages_leave_first() {
    let (transport, registry, _rx) = setup();

    let n1 = envelope("query", MessagePolicy::default());
    let n2 = envelope("query", MessagePolicy::default());
    let u1 = envelope("query", urgent());
    let (n1_id, n2_id, u1_id) = (n1.message.uuid(), n2.message.uuid(), u1.message.uuid());
    registry.enqueue(n1);
    registry.enqueue(n2);
    registry.enqueue(u1);

    assert_eq!(registry.queued_uuids("query"), vec![u1_id, n1_id, n2_id]);

    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    assert_eq!(registry.pump().await, 3);
    assert_eq!(transport.host("a:1").request_uuids(), vec![u1_id, n1_id, n2_id]);
}

#[tokio::test]
async fn test_nothing_leaves_without_a_route() {
    let (transport, registry, _rx) = setup();
    registry.enqueue(envelope("query", MessagePolicy::default()));

    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["suggest"])], &[]),
    ));
    assert_eq!(registry.pump().await, 0);
    assert_eq!(registry.queued_len(), 1);
    assert!(transport.host("a:1").received().is_empty());
}

#[tokio::test]
async fn test_round_robin_skips_failing_hosts() {
    let (transport, registry, _rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(
            &[("a:1", &["query"]), ("b:1", &["query"]), ("c:1", &["query"])],
            &["b:1"],
        ),
    ));

    for _ in 0..4 {
        registry.enqueue(envelope("query", MessagePolicy::default()));
    }
    assert_eq!(registry.pump().await, 4);

    assert_eq!(transport.host("a:1").request_uuids().len(), 2);
    assert_eq!(transport.host("b:1").request_uuids().len(), 0);
    assert_eq!(transport.host("c:1").request_uuids().len(), 2);
}

#[tokio::test]
async fn test_only_failing_hosts_means_waiting() {
    let (_transport, registry, _rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &["a:1"]),
    ));
    registry.enqueue(envelope("query", MessagePolicy::default()));

    assert_eq!(registry.pump().await, 0);
    assert_eq!(registry.queued_len(), 1);
}

#[tokio::test]
async fn test_host_removal_requeues_in_sequence_order() {
    let (transport, registry, _rx) = setup();
    let first = snapshot(&[("a:1", &["query"])], &[]);
    registry.apply_topology(&change(&ServiceInfo::empty("search"), first.clone()));

    let envelopes: Vec<Envelope> = (0..3)
        .map(|_| envelope("query", MessagePolicy::default()))
        .collect();
    let uuids: Vec<Uuid> = envelopes.iter().map(|e| e.message.uuid()).collect();
    for e in envelopes {
        registry.enqueue(e);
    }
    assert_eq!(registry.pump().await, 3);
    assert_eq!(registry.in_flight_len(), 3);
    assert_eq!(registry.connected_hosts(), vec!["a:1".to_string()]);

    let added = registry.apply_topology(&change(&first, snapshot(&[("b:1", &["query"])], &[])));
    assert_eq!(added, vec![HostInfo::from_address("b:1")]);
    assert_eq!(registry.in_flight_len(), 0);
    assert_eq!(registry.queued_uuids("query"), uuids);
    assert!(registry.connected_hosts().is_empty());

    assert_eq!(registry.pump().await, 3);
    assert_eq!(transport.host("b:1").request_uuids(), uuids);
}

#[tokio::test]
async fn test_handle_change_redistributes_only_affected_messages() {
    let (_transport, registry, _rx) = setup();
    let first = snapshot(&[("a:1", &["query", "suggest"])], &[]);
    registry.apply_topology(&change(&ServiceInfo::empty("search"), first.clone()));

    let query = envelope("query", MessagePolicy::default());
    let suggest = envelope("suggest", MessagePolicy::default());
    let suggest_id = suggest.message.uuid();
    registry.enqueue(query);
    registry.enqueue(suggest);
    assert_eq!(registry.pump().await, 2);

    registry.apply_topology(&change(&first, snapshot(&[("a:1", &["query"])], &[])));
    assert_eq!(registry.in_flight_len(), 1);
    assert_eq!(registry.queued_uuids("suggest"), vec![suggest_id]);
}

#[tokio::test]
async fn test_send_failure_backs_off_and_records_attempt() {
    let (transport, registry, mut rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    transport.host("a:1").fail_next_sends(1);

    let persistent = MessagePolicy {
        persistent: true,
        max_retries: Some(3),
        ..MessagePolicy::default()
    };
    let e = envelope("query", persistent);
    let uuid = e.message.uuid();
    registry.enqueue(e);

    assert_eq!(registry.pump().await, 0);
    assert_eq!(registry.queued_uuids("query"), vec![uuid]);
    match drain(&mut rx).as_slice() {
        [RegistryEvent::Attempted(entry)] => {
            assert_eq!(entry.uuid, uuid);
            assert_eq!(entry.attempt_count, 1);
        }
        other => panic!("unexpected events {other:?}"),
    }

    // still backing off
    assert_eq!(registry.pump().await, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.pump().await, 1);
    assert_eq!(registry.in_flight_host(uuid), Some("a:1".to_string()));
}

#[tokio::test]
async fn test_exhausted_is_reported_exactly_once() {
    let (transport, registry, mut rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    transport.host("a:1").set_reachable(false);

    let policy = MessagePolicy {
        max_retries: Some(1),
        ..MessagePolicy::default()
    };
    let e = envelope("query", policy);
    let uuid = e.message.uuid();
    registry.enqueue(e);

    registry.pump().await;
    assert!(drain(&mut rx).is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.pump().await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        RegistryEvent::Exhausted {
            uuid: reported,
            attempts,
            ..
        } => {
            assert_eq!(*reported, uuid);
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(registry.queued_len(), 0);
    assert_eq!(registry.in_flight_len(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.pump().await;
    registry.sweep(Instant::now());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_ack_timeout_counts_as_failed_attempt() {
    let (_transport, registry, mut rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    let persistent = MessagePolicy {
        persistent: true,
        ..MessagePolicy::default()
    };
    let e = envelope("query", persistent);
    let uuid = e.message.uuid();
    registry.enqueue(e);
    registry.pump().await;
    assert_eq!(registry.in_flight_len(), 1);

    registry.sweep(Instant::now());
    assert_eq!(registry.in_flight_len(), 1);

    registry.sweep(Instant::now() + Duration::from_millis(60));
    assert_eq!(registry.in_flight_len(), 0);
    assert_eq!(registry.queued_uuids("query"), vec![uuid]);
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [RegistryEvent::Attempted(entry)] if entry.attempt_count == 1
    ));
}

#[tokio::test]
async fn test_expired_messages_are_dropped_and_reported() {
    let (_transport, registry, mut rx) = setup();
    let policy = MessagePolicy {
        timeout: Some(Duration::from_millis(10)),
        ..MessagePolicy::default()
    };
    let queued = envelope("query", policy);
    let queued_id = queued.message.uuid();
    registry.enqueue(queued);
    registry.enqueue(envelope("query", MessagePolicy::default()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.sweep(Instant::now());

    assert_eq!(registry.queued_len(), 1);
    match drain(&mut rx).as_slice() {
        [RegistryEvent::Expired { uuid, elapsed_ms, .. }] => {
            assert_eq!(*uuid, queued_id);
            assert!(*elapsed_ms >= 10);
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn test_acknowledge_completes_once() {
    let (_transport, registry, _rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    let e = envelope("query", MessagePolicy::default());
    let uuid = e.message.uuid();
    registry.enqueue(e);
    registry.pump().await;

    let path = MessagePath::new("search", "query");
    let ack = registry.acknowledge(uuid, &path).unwrap();
    assert_eq!(ack.host.as_deref(), Some("a:1"));
    assert!(registry.acknowledge(uuid, &path).is_none());
    assert_eq!(registry.in_flight_len(), 0);
}

#[tokio::test]
async fn test_acknowledge_on_another_path_leaves_message() {
    let (_transport, registry, _rx) = setup();
    let queued = envelope("query", MessagePolicy::default());
    let queued_id = queued.message.uuid();
    registry.enqueue(queued);

    let wrong = MessagePath::new("search", "other");
    assert!(registry.acknowledge(queued_id, &wrong).is_none());
    assert_eq!(registry.queued_uuids("query"), vec![queued_id]);

    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    registry.pump().await;
    assert!(registry.acknowledge(queued_id, &wrong).is_none());
    assert!(
        registry
            .acknowledge(queued_id, &MessagePath::new("billing", "query"))
            .is_none()
    );
    assert_eq!(registry.in_flight_host(queued_id).as_deref(), Some("a:1"));

    assert!(
        registry
            .acknowledge(queued_id, &MessagePath::new("search", "query"))
            .is_some()
    );
}

#[tokio::test]
async fn test_reader_forwards_responses() {
    let (transport, registry, mut rx) = setup();
    transport.host("a:1").respond_with(Box::new(|frame| match frame {
        Frame::Request {
            uuid,
            service,
            handle,
            ..
        } => Some(Frame::Response {
            uuid: *uuid,
            service: service.clone(),
            handle: handle.clone(),
            payload: b"answer".to_vec(),
            signature: vec![1; 64],
            identity: "backend".to_string(),
            error: None,
        }),
        _ => None,
    }));
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));

    let e = envelope("query", MessagePolicy::default());
    let uuid = e.message.uuid();
    registry.enqueue(e);
    registry.pump().await;

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        RegistryEvent::Response(response) => {
            assert_eq!(response.uuid, uuid);
            assert_eq!(response.host, "a:1");
            assert_eq!(response.path, MessagePath::new("search", "query"));
            assert_eq!(response.payload, b"answer");
            assert_eq!(response.identity, "backend");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_loss_requeues_without_counting() {
    let (transport, registry, mut rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    let persistent = MessagePolicy {
        persistent: true,
        ..MessagePolicy::default()
    };
    registry.enqueue(envelope("query", persistent));
    registry.pump().await;
    assert_eq!(registry.in_flight_len(), 1);

    transport.host("a:1").disconnect();
    for _ in 0..50 {
        if registry.in_flight_len() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(registry.in_flight_len(), 0);
    assert_eq!(registry.queued_len(), 1);
    assert!(registry.connected_hosts().is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_spawned_tasks_deliver_and_stop() {
    let (transport, registry, _rx) = setup();
    let (topology_tx, topology_rx) = mpsc::unbounded_channel();
    registry.spawn(topology_rx);

    let e = envelope("query", MessagePolicy::default());
    let uuid = e.message.uuid();
    registry.enqueue(e);

    topology_tx
        .send(change(
            &ServiceInfo::empty("search"),
            snapshot(&[("a:1", &["query"])], &[]),
        ))
        .unwrap();

    let host = transport.host("a:1");
    for _ in 0..100 {
        if !host.request_uuids().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(host.request_uuids().first(), Some(&uuid));

    tokio::time::timeout(Duration::from_secs(1), registry.close())
        .await
        .unwrap();
    assert!(registry.connected_hosts().is_empty());
}

#[tokio::test]
async fn test_connect_after_close_is_not_registered() {
    let (transport, registry, mut rx) = setup();
    registry.apply_topology(&change(
        &ServiceInfo::empty("search"),
        snapshot(&[("a:1", &["query"])], &[]),
    ));
    registry.close().await;

    registry.enqueue(envelope("query", MessagePolicy::default()));
    assert_eq!(registry.pump().await, 0);

    assert_eq!(registry.queued_len(), 1);
    assert_eq!(registry.in_flight_len(), 0);
    assert!(registry.connected_hosts().is_empty());
    assert_eq!(transport.host("a:1").open_connections(), 0);
    assert!(drain(&mut rx).is_empty());
}
