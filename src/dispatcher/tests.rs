//! Tests for the sharded dispatcher.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use tokio::sync::Semaphore;

use super::*;
use crate::model::EventType;
use crate::parser::{Shape, Wrapping};

const WAIT: Duration = Duration::from_secs(2);

fn message(event_type: &str, id: u64, description: &str) -> InboundMessage {
    let body = serde_json::json!({
        "type": event_type,
        "aggregateId": id,
        "description": description,
    });
    InboundMessage {
        id: format!("msg-{id}-{description}"),
        data: serde_json::to_vec(&body).unwrap(),
        attributes: HashMap::new(),
        ordering_key: Some(format!("activity-{id}")),
        delivery_attempt: 1,
        publish_time: None,
    }
}

fn create(id: u64, description: &str) -> InboundMessage {
    message("CREATE", id, description)
}

/// Records (aggregate id, description) in apply order.
#[derive(Default)]
struct RecordingApplier {
    applied: StdMutex<Vec<(u64, String)>>,
}

impl RecordingApplier {
    fn applied_for(&self, id: u64) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(aggregate, _)| *aggregate == id)
            .map(|(_, description)| description.clone())
            .collect()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome, ApplyError> {
        if let EventType::Unknown(raw) = &event.event_type {
            return Err(ApplyError::UnknownEventType(raw.clone()));
        }
        tokio::task::yield_now().await;
        self.applied
            .lock()
            .unwrap()
            .push((event.aggregate_id, event.description.clone()));
        Ok(ApplyOutcome::Created)
    }
}

/// Blocks every apply until a permit is released, reporting when it starts.
struct GatedApplier {
    started: mpsc::UnboundedSender<u64>,
    gate: Semaphore,
    applied: StdMutex<Vec<String>>,
}

impl GatedApplier {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                started: tx,
                gate: Semaphore::new(0),
                applied: StdMutex::new(Vec::new()),
            }),
            rx,
        )
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Applier for GatedApplier {
    async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome, ApplyError> {
        let _ = self.started.send(event.aggregate_id);
        self.gate
            .acquire()
            .await
            .expect("gate closed")
            .forget();
        self.applied.lock().unwrap().push(event.description.clone());
        Ok(ApplyOutcome::Created)
    }
}

/// Panics on the description "boom".
struct PanickingApplier;

#[async_trait]
impl Applier for PanickingApplier {
    async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome, ApplyError> {
        if event.description == "boom" {
            panic!("boom on aggregate {}", event.aggregate_id);
        }
        Ok(ApplyOutcome::Created)
    }
}

async fn started(rx: &mut mpsc::UnboundedReceiver<u64>) -> u64 {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("apply never started")
        .expect("applier dropped")
}

/// An aggregate id that routes to a different shard than `id`.
fn id_on_other_shard(id: u64, shard_count: usize) -> u64 {
    let shard = shard_index(&id.to_string(), shard_count);
    (id + 1..id + 1000)
        .find(|candidate| shard_index(&candidate.to_string(), shard_count) != shard)
        .expect("no id on another shard")
}

#[tokio::test]
async fn test_same_aggregate_applies_in_submission_order() {
    let applier = Arc::new(RecordingApplier::default());
    let dispatcher = Arc::new(
        ShardedDispatcher::new(DispatcherConfig::unbounded(4, 64), applier.clone()).unwrap(),
    );

    // On the current-thread runtime spawned tasks first run in spawn order,
    // and each one enqueues before it yields.
    let mut tasks = Vec::new();
    for n in 1..=10 {
        for id in [1u64, 2] {
            let dispatcher = dispatcher.clone();
            let msg = create(id, &n.to_string());
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .process(&DeliveryContext::background(), &msg)
                    .await
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    assert_eq!(applier.applied_for(1), expected);
    assert_eq!(applier.applied_for(2), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_per_aggregate_order() {
    let applier = Arc::new(RecordingApplier::default());
    let dispatcher = Arc::new(
        ShardedDispatcher::new(DispatcherConfig::unbounded(8, 16), applier.clone()).unwrap(),
    );

    let mut producers = Vec::new();
    for id in 1..=6u64 {
        let dispatcher = dispatcher.clone();
        producers.push(tokio::spawn(async move {
            for n in 1..=10 {
                dispatcher
                    .process(&DeliveryContext::background(), &create(id, &n.to_string()))
                    .await
                    .unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    for id in 1..=6 {
        assert_eq!(applier.applied_for(id), expected, "aggregate {id}");
    }
}

#[tokio::test]
async fn test_blocked_shard_does_not_stall_other_shards() {
    let (applier, mut started_rx) = GatedApplier::new();
    let dispatcher = Arc::new(
        ShardedDispatcher::new(DispatcherConfig::unbounded(2, 8), applier.clone()).unwrap(),
    );
    let other = id_on_other_shard(1, 2);

    let blocked = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .process(&DeliveryContext::background(), &create(1, "slow"))
                .await
        })
    };
    assert_eq!(started(&mut started_rx).await, 1);

    let free = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .process(&DeliveryContext::background(), &create(other, "fast"))
                .await
        })
    };
    assert_eq!(started(&mut started_rx).await, other);

    applier.release(2);
    blocked.await.unwrap().unwrap();
    free.await.unwrap().unwrap();
    assert_eq!(applier.applied().len(), 2);
}

#[tokio::test]
async fn test_full_queue_returns_enqueue_timeout() {
    let (applier, mut started_rx) = GatedApplier::new();
    let config = DispatcherConfig {
        shard_count: 1,
        queue_capacity: 1,
        enqueue_timeout_ms: 50,
        work_timeout_ms: 0,
    };
    let dispatcher = Arc::new(ShardedDispatcher::new(config, applier.clone()).unwrap());

    // First item occupies the worker.
    let first = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .process(&DeliveryContext::background(), &create(1, "a"))
                .await
        })
    };
    started(&mut started_rx).await;

    // Second item fills the queue.
    let second = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .process(&DeliveryContext::background(), &create(2, "b"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = dispatcher
        .process(&DeliveryContext::background(), &create(3, "c"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::EnqueueTimeout { shard: 0, .. }));
    assert!(!err.applied_maybe());

    applier.release(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(applier.applied(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_cancelled_context_is_rejected_before_enqueue() {
    let applier = Arc::new(RecordingApplier::default());
    let dispatcher =
        ShardedDispatcher::new(DispatcherConfig::unbounded(2, 8), applier.clone()).unwrap();
    let (ctx, cancel) = DeliveryContext::with_cancel();
    cancel.cancel();

    let err = dispatcher.process(&ctx, &create(1, "never")).await.unwrap_err();
    assert!(matches!(err, DispatchError::CanceledBeforeEnqueue { .. }));

    dispatcher.shutdown().await;
    assert!(applier.applied_for(1).is_empty());
}

#[tokio::test]
async fn test_cancel_while_waiting_still_applies_once() {
    let (applier, mut started_rx) = GatedApplier::new();
    let dispatcher = Arc::new(
        ShardedDispatcher::new(DispatcherConfig::unbounded(1, 8), applier.clone()).unwrap(),
    );
    let (ctx, cancel) = DeliveryContext::with_cancel();

    let waiting = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.process(&ctx, &create(1, "late")).await })
    };
    started(&mut started_rx).await;
    cancel.cancel();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, DispatchError::CanceledWhileWaiting { shard: 0 }));
    assert!(err.applied_maybe());

    applier.release(1);
    dispatcher.shutdown().await;
    assert_eq!(applier.applied(), vec!["late"]);
}

#[tokio::test]
async fn test_work_timeout_keeps_order_for_later_items() {
    let (applier, mut started_rx) = GatedApplier::new();
    let config = DispatcherConfig {
        shard_count: 1,
        queue_capacity: 8,
        enqueue_timeout_ms: 0,
        work_timeout_ms: 50,
    };
    let dispatcher = Arc::new(ShardedDispatcher::new(config, applier.clone()).unwrap());

    let err = {
        let dispatcher = dispatcher.clone();
        let timed_out = tokio::spawn(async move {
            dispatcher
                .process(&DeliveryContext::background(), &create(1, "first"))
                .await
        });
        started(&mut started_rx).await;
        timed_out.await.unwrap().unwrap_err()
    };
    assert!(matches!(err, DispatchError::WorkTimeout { shard: 0, .. }));
    assert!(err.applied_maybe());

    let next = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .process(&DeliveryContext::background(), &create(1, "second"))
                .await
        })
    };
    applier.release(2);
    // "second" may itself time out while "first" drains; order is what matters.
    let _ = next.await.unwrap();
    dispatcher.shutdown().await;
    assert_eq!(applier.applied(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_panicking_apply_is_contained() {
    let dispatcher =
        ShardedDispatcher::new(DispatcherConfig::unbounded(1, 8), Arc::new(PanickingApplier))
            .unwrap();
    let ctx = DeliveryContext::background();

    let err = dispatcher.process(&ctx, &create(7, "boom")).await.unwrap_err();
    match err {
        DispatchError::Apply(ApplyError::Panicked(message)) => {
            assert!(message.contains("boom on aggregate 7"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Same shard keeps working.
    let processed = dispatcher.process(&ctx, &create(7, "fine")).await.unwrap();
    assert_eq!(processed.outcome, ApplyOutcome::Created);
}

#[tokio::test]
async fn test_parse_failure_never_reaches_a_shard() {
    let applier = Arc::new(RecordingApplier::default());
    let dispatcher =
        ShardedDispatcher::new(DispatcherConfig::unbounded(2, 8), applier.clone()).unwrap();
    let mut garbage = create(1, "x");
    garbage.data = b"definitely not an event".to_vec();

    let err = dispatcher
        .process(&DeliveryContext::background(), &garbage)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Parse(ParseError::Unrecognized { .. })));

    let mut zero = create(1, "x");
    zero.data = br#"{"type":"CREATE","aggregateId":0}"#.to_vec();
    let err = dispatcher
        .process(&DeliveryContext::background(), &zero)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Parse(ParseError::MissingAggregateId)));

    dispatcher.shutdown().await;
    assert!(applier.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_type_surfaces_as_apply_error() {
    let dispatcher = ShardedDispatcher::new(
        DispatcherConfig::unbounded(2, 8),
        Arc::new(RecordingApplier::default()),
    )
    .unwrap();

    let err = dispatcher
        .process(&DeliveryContext::background(), &message("archived", 3, "x"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Apply(ApplyError::UnknownEventType(ref t)) if t == "ARCHIVED"
    ));
}

#[tokio::test]
async fn test_processed_reports_strategy_and_shard() {
    let dispatcher = ShardedDispatcher::new(
        DispatcherConfig::unbounded(8, 8),
        Arc::new(RecordingApplier::default()),
    )
    .unwrap();

    let processed = dispatcher
        .process(&DeliveryContext::background(), &create(42, "x"))
        .await
        .unwrap();
    assert_eq!(processed.shard, shard_index("42", 8));
    assert_eq!(
        processed.strategy,
        Strategy {
            wrapping: Wrapping::Plain,
            shape: Shape::Legacy,
        }
    );
}

#[tokio::test]
async fn test_shutdown_closes_shards() {
    let dispatcher = ShardedDispatcher::new(
        DispatcherConfig::unbounded(2, 8),
        Arc::new(RecordingApplier::default()),
    )
    .unwrap();
    dispatcher.shutdown().await;

    let err = dispatcher
        .process(&DeliveryContext::background(), &create(1, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShardClosed { .. }));
}

#[tokio::test]
async fn test_handler_acks_only_processed_messages() {
    let dispatcher = ShardedDispatcher::new(
        DispatcherConfig::unbounded(2, 8),
        Arc::new(RecordingApplier::default()),
    )
    .unwrap();

    let ok = dispatcher
        .handle(DeliveryContext::background(), create(1, "x"))
        .await;
    assert!(ok.is_ok());

    let mut garbage = create(1, "x");
    garbage.data = b"???".to_vec();
    let nack = dispatcher
        .handle(DeliveryContext::background(), garbage)
        .await;
    assert!(matches!(nack, Err(BusError::HandlerFailed { .. })));
}

#[tokio::test]
async fn test_zero_sizes_are_rejected() {
    let applier: Arc<dyn Applier> = Arc::new(RecordingApplier::default());
    assert!(ShardedDispatcher::new(DispatcherConfig::unbounded(0, 8), applier.clone()).is_err());
    assert!(ShardedDispatcher::new(DispatcherConfig::unbounded(4, 0), applier).is_err());
}

#[test]
fn test_shard_index_is_stable_and_in_range() {
    for key in ["1", "42", "activity-7", "msg-abc"] {
        let shard = shard_index(key, 8);
        assert!(shard < 8);
        assert_eq!(shard, shard_index(key, 8));
    }
    assert_eq!(shard_index("anything", 1), 0);
}

#[test]
fn test_shard_index_spreads_keys() {
    let mut counts = [0usize; 8];
    for id in 1..=1000u64 {
        counts[shard_index(&id.to_string(), 8)] += 1;
    }
    assert!(counts.iter().all(|&count| count > 50), "{counts:?}");
}

#[test]
fn test_routing_falls_back_to_message_id() {
    let mut event: DomainEvent =
        serde_json::from_str(r#"{"type":"CREATE","aggregateId":5}"#).unwrap();
    assert_eq!(routing_key(&event, "msg-1"), "5");
    event.aggregate_id = 0;
    assert_eq!(routing_key(&event, "msg-1"), "msg-1");
}

#[test]
fn test_config_timeouts() {
    let config = DispatcherConfig::default();
    assert_eq!(config.enqueue_timeout(), Some(Duration::from_secs(5)));
    assert_eq!(config.work_timeout(), Some(Duration::from_secs(30)));
    let unbounded = DispatcherConfig::unbounded(1, 1);
    assert_eq!(unbounded.enqueue_timeout(), None);
    assert_eq!(unbounded.work_timeout(), None);
}
