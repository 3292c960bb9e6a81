use reliable_exec::outbox::{ChannelPublisher, SqliteOutboxRepository};
use reliable_exec::{
    Clock, InMemoryOutboxRepository, ManualClock, MessageStatus, OutboxConfig, OutboxError,
    OutboxMessage, OutboxProcessor, OutboxPublisher, OutboxRepository, PublishError, UnixTimeMs,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn make_now() -> UnixTimeMs {
    UnixTimeMs(1_700_000_000_000)
}

fn order_placed(order_id: &str) -> OutboxMessage {
    OutboxMessage::new(
        "Order",
        order_id,
        "OrderPlaced",
        "orders",
        format!(r#"{{"order_id":"{order_id}"}}"#).into_bytes(),
        make_now(),
    )
}

#[derive(Default)]
struct BrokenBroker {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl OutboxPublisher for BrokenBroker {
    async fn publish(&self, _message: &OutboxMessage) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::transient("connection refused"))
    }
}

async fn exhausted_message_is_dead_lettered<R: OutboxRepository>(repo: Arc<R>) {
    let clock = Arc::new(ManualClock::new(make_now()));
    let broker = Arc::new(BrokenBroker::default());
    let processor = OutboxProcessor::with_clock(
        repo.clone(),
        broker.clone(),
        OutboxConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            ..Default::default()
        },
        clock.clone(),
    )
    .unwrap();

    let msg = order_placed("123");
    repo.enqueue(msg.clone()).await.unwrap();

    // 1. Two failures leave the message retryable, with growing delays
    let mut delays = Vec::new();
    for expected_attempts in 1..=2 {
        let report = processor.tick().await.unwrap();
        assert_eq!(report.retried, 1);
        let stored = repo.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempts, expected_attempts);
        let due = stored.next_attempt_at.unwrap();
        delays.push(due.since(clock.now()));
        clock.set(due);
    }
    assert!(delays[0] < delays[1]);

    // 2. The third failure is terminal
    let report = processor.tick().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(matches!(
        report.errors.as_slice(),
        [(id, OutboxError::DeadLettered { attempts: 3, .. })] if *id == msg.id
    ));

    let stored = repo.get(&msg.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Dead);
    assert_eq!(stored.attempts, 3);

    // 3. Dead messages are never claimed again
    clock.advance(Duration::from_secs(3_600));
    assert_eq!(processor.tick().await.unwrap().claimed, 0);
    assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn dead_letter_after_max_attempts_in_memory() {
    exhausted_message_is_dead_lettered(Arc::new(InMemoryOutboxRepository::new())).await;
}

#[tokio::test]
async fn dead_letter_after_max_attempts_sqlite() {
    exhausted_message_is_dead_lettered(Arc::new(
        SqliteOutboxRepository::open_in_memory().unwrap(),
    ))
    .await;
}

#[tokio::test]
async fn channel_relay_delivers_in_claim_order() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let (publisher, mut receiver) = ChannelPublisher::channel(16);
    let processor =
        OutboxProcessor::new(repo.clone(), Arc::new(publisher), OutboxConfig::default()).unwrap();

    let routine = order_placed("routine");
    let urgent = order_placed("urgent").with_priority(10);
    repo.enqueue(routine.clone()).await.unwrap();
    repo.enqueue(urgent.clone()).await.unwrap();

    let report = processor.tick().await.unwrap();
    assert_eq!(report.published, 2);

    assert_eq!(receiver.recv().await.unwrap().id, urgent.id);
    assert_eq!(receiver.recv().await.unwrap().id, routine.id);
    assert_eq!(processor.queue_depth().await.unwrap().published, 2);
}

/// Records every delivery so duplicates can be detected.
#[derive(Default)]
struct RecordingBroker {
    delivered: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl OutboxPublisher for RecordingBroker {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        tokio::task::yield_now().await;
        self.delivered
            .lock()
            .unwrap()
            .push(message.aggregate_id.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processors_never_double_publish() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(SqliteOutboxRepository::open(dir.path().join("outbox.db")).unwrap());
    for i in 0..40 {
        repo.enqueue(order_placed(&format!("order-{i}"))).await.unwrap();
    }

    let broker = Arc::new(RecordingBroker::default());
    let mut handles = Vec::new();
    for worker in 0..4 {
        let processor = OutboxProcessor::new(
            repo.clone(),
            broker.clone(),
            OutboxConfig {
                worker_id: Some(format!("relay-{worker}")),
                ..Default::default()
            },
        )
        .unwrap();
        handles.push(tokio::spawn(async move {
            let mut published = 0;
            loop {
                let report = processor.process_once(5).await.unwrap();
                if report.claimed == 0 {
                    break published;
                }
                published += report.published;
            }
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 40);

    let delivered = broker.delivered.lock().unwrap().clone();
    let unique: HashSet<_> = delivered.iter().collect();
    assert_eq!(delivered.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(repo.queue_depth().await.unwrap().published, 40);
}
