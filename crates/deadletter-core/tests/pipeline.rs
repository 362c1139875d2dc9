//! End-to-end: dispatch, dead-letter, extract, evaluate, notify.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use deadletter::alerting::{AlertEvaluator, ChannelSubscriber, NotificationFanout};
use deadletter::collector::{MetricStore, Pipeline};
use deadletter::config::{DispatcherConfig, MetricsConfig};
use deadletter::dispatcher::{Dispatcher, ShouldFailHandler};
use deadletter::dlq::{DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore};
use deadletter::models::{
    AlarmRule, AlarmStatus, AlarmTransition, DeliveryOutcome, Event, ExecutionRecord,
    FailureReason, MetricSelector, ERRORS_LOGGED, INVOCATIONS,
};

const NS: &str = "DeadLetterPipeline";

struct Harness {
    dispatcher: Dispatcher,
    store: Arc<dyn DeadLetterStore>,
    metrics: Arc<MetricStore>,
    pipeline: Arc<Pipeline>,
}

impl Harness {
    fn new(max_retries: u32, store: Arc<dyn DeadLetterStore>) -> Self {
        let metrics = Arc::new(MetricStore::new());
        let pipeline = Arc::new(Pipeline::from_config(&MetricsConfig::default(), metrics.clone()));
        let config = DispatcherConfig {
            max_retries,
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(
            config,
            Arc::new(ShouldFailHandler),
            store.clone(),
            pipeline.clone(),
        );

        Self {
            dispatcher,
            store,
            metrics,
            pipeline,
        }
    }

    /// Dispatch every event, then let the pipeline drain its buffer
    async fn dispatch_all(&self, events: Vec<Event>) -> Vec<DeliveryOutcome> {
        let cancel = CancellationToken::new();
        let pipeline = self.pipeline.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { pipeline.start(token).await });

        let mut outcomes = Vec::new();
        for event in events {
            outcomes.push(self.dispatcher.dispatch(event).await.unwrap());
        }

        cancel.cancel();
        task.await.unwrap();
        outcomes
    }

    fn samples(&self, metric: &str) -> Vec<DateTime<Utc>> {
        self.metrics
            .samples(
                &MetricSelector::new(NS, metric),
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .into_iter()
            .map(|s| s.timestamp)
            .collect()
    }
}

fn order(should_fail: bool) -> Event {
    Event::json("orders", "OrderPlaced", &json!({ "shouldFail": should_fail }))
}

fn subscribed_fanout(
    n: usize,
) -> (Arc<NotificationFanout>, Vec<UnboundedReceiver<AlarmTransition>>) {
    let fanout = Arc::new(NotificationFanout::new(Duration::from_secs(1)));
    let receivers = (0..n)
        .map(|i| {
            let (subscriber, rx) = ChannelSubscriber::new(format!("subscriber-{i}"));
            fanout.subscribe(Arc::new(subscriber));
            rx
        })
        .collect();
    (fanout, receivers)
}

#[tokio::test]
async fn test_exhausted_event_is_dead_lettered_and_alarms_once() {
    let harness = Harness::new(2, Arc::new(MemoryDeadLetterStore::default()));

    let outcomes = harness.dispatch_all(vec![order(true)]).await;
    assert!(outcomes[0].is_dead_lettered());
    assert_eq!(outcomes[0].attempts(), 3);

    // Exactly one record, carrying the full attempt count.
    assert_eq!(harness.store.depth().await.unwrap(), 1);
    let records = harness.store.drain(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(
        records[0].reason,
        FailureReason::transient("failed to process message")
    );

    // One errorsLogged sample per failed attempt.
    let errors = harness.samples(ERRORS_LOGGED);
    assert_eq!(errors.len(), 3);

    let (fanout, mut receivers) = subscribed_fanout(2);
    let rule = AlarmRule::errors_logged(NS);
    let window = chrono::Duration::from_std(rule.window).unwrap();
    let evaluator = AlertEvaluator::new(vec![rule], harness.metrics.clone(), fanout).unwrap();

    // Before the failures: the window that closed earlier is clean.
    let first = evaluator.evaluate_all(errors[0]).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].to, AlarmStatus::Ok);

    // Once the window holding the failures has closed, the alarm fires.
    let fired = evaluator.evaluate_all(errors[2] + window).await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].from, AlarmStatus::Ok);
    assert_eq!(fired[0].to, AlarmStatus::Alarm);

    // A later quiet window recovers without notifying.
    let recovered = evaluator.evaluate_all(errors[2] + window * 2).await;
    assert_eq!(recovered[0].to, AlarmStatus::Ok);

    for rx in &mut receivers {
        let transition = rx.try_recv().unwrap();
        assert!(transition.is_alarm_raised());
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_successful_event_leaves_no_trace() {
    let harness = Harness::new(2, Arc::new(MemoryDeadLetterStore::default()));

    let outcomes = harness.dispatch_all(vec![order(false)]).await;
    assert_eq!(
        outcomes[0],
        DeliveryOutcome::Delivered {
            sequence: 1,
            attempts: 1
        }
    );

    assert_eq!(harness.store.depth().await.unwrap(), 0);
    assert!(harness.samples(ERRORS_LOGGED).is_empty());
    assert_eq!(harness.samples(INVOCATIONS).len(), 1);
}

#[tokio::test]
async fn test_error_rate_threshold() {
    async fn rate_after(failing: usize) -> AlarmStatus {
        let harness = Harness::new(0, Arc::new(MemoryDeadLetterStore::default()));
        let events = (0..10).map(|i| order(i < failing)).collect();
        harness.dispatch_all(events).await;

        let invocations = harness.samples(INVOCATIONS);
        assert_eq!(invocations.len(), 10);

        let rule = AlarmRule::error_rate(NS, 0.4).with_window(Duration::from_secs(3600));
        let window = chrono::Duration::from_std(rule.window).unwrap();
        let (fanout, _receivers) = subscribed_fanout(1);
        let evaluator = AlertEvaluator::new(vec![rule], harness.metrics.clone(), fanout).unwrap();

        // Ten dispatches finish well inside one hour-long window.
        let last = *invocations.last().unwrap();
        evaluator.evaluate_all(last + window).await;
        evaluator.states().await[0].1.status
    }

    assert_eq!(rate_after(3).await, AlarmStatus::Ok);
    assert_eq!(rate_after(5).await, AlarmStatus::Alarm);
}

#[tokio::test]
async fn test_error_rate_ignores_errors_outside_attempts() {
    let metrics = Arc::new(MetricStore::new());
    let pipeline = Pipeline::from_config(&MetricsConfig::default(), metrics.clone());

    for sequence in 1..=10 {
        let level = if sequence <= 3 { "error" } else { "info" };
        let record = ExecutionRecord::new(level, "on-event", "attempt finished")
            .with_field("sequence", sequence)
            .with_field("attempt", 0);
        pipeline.process(&record);
    }
    for _ in 0..2 {
        pipeline.process(&ExecutionRecord::new("ERROR", "http", "502 Bad Gateway"));
    }
    assert_eq!(
        metrics
            .values(
                &MetricSelector::new(NS, ERRORS_LOGGED),
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .len(),
        5
    );

    let rule = AlarmRule::error_rate(NS, 0.4).with_window(Duration::from_secs(3600));
    let window = chrono::Duration::from_std(rule.window).unwrap();
    let (fanout, mut receivers) = subscribed_fanout(1);
    let evaluator = AlertEvaluator::new(vec![rule], metrics, fanout).unwrap();

    let transitions = evaluator.evaluate_all(Utc::now() + window).await;
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].to, AlarmStatus::Ok);
    assert_eq!(transitions[0].value, Some(0.3));
    assert!(receivers[0].try_recv().is_err());
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("EventHandlerDLQ.ndjson");
    let retention = Duration::from_secs(14 * 24 * 3600);

    {
        let store = Arc::new(FileDeadLetterStore::open(&path, retention).await.unwrap());
        let harness = Harness::new(1, store);
        let outcomes = harness
            .dispatch_all(vec![order(true), order(false), order(true)])
            .await;
        assert_eq!(outcomes.iter().filter(|o| o.is_dead_lettered()).count(), 2);
    }

    let reopened = FileDeadLetterStore::open(&path, retention).await.unwrap();
    assert_eq!(reopened.depth().await.unwrap(), 2);

    let drained = reopened.drain(10).await.unwrap();
    let sequences: Vec<u64> = drained.iter().map(|r| r.event.sequence).collect();
    assert_eq!(sequences, vec![1, 3]);
    assert!(drained.iter().all(|r| r.attempts == 2));
}
