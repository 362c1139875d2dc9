//! Alarm rule evaluation engine
//!
//! Time is cut into fixed, epoch-aligned windows of the rule's length. Each tick
//! judges every window that closed since the previous tick, oldest first, and
//! feeds the resulting datapoints through the rule's M-of-N and recovery policy.
//! A window is judged exactly once; samples that arrive for it later are ignored.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collector::MetricStore;
use crate::error::{Error, Result};
use crate::models::{
    AlarmRule, AlarmState, AlarmStatus, AlarmTransition, MetricSample, MetricSelector,
    MetricSource, MissingDataPolicy,
};

use super::notifier::NotificationFanout;

/// Aggregated value of one window
#[derive(Debug, Clone, Copy, PartialEq)]
enum WindowValue {
    Value(f64),
    Missing,
}

/// Evaluation state of one rule
struct RuleState {
    rule: AlarmRule,
    state: AlarmState,
    /// Index of the newest judged window
    last_window: Option<i64>,
    /// Judged datapoints, newest last; `None` is an unknown datapoint
    history: VecDeque<Option<bool>>,
}

impl RuleState {
    fn new(rule: AlarmRule) -> Self {
        Self {
            state: AlarmState::new(rule.id),
            rule,
            last_window: None,
            history: VecDeque::new(),
        }
    }

    /// Windows to judge at `now`, oldest first
    fn pending_windows(&self, now: DateTime<Utc>) -> std::ops::RangeInclusive<i64> {
        let width = self.rule.window_millis();
        let last_closed = now.timestamp_millis().div_euclid(width) - 1;
        let cap = i64::try_from(self.rule.history_len()).unwrap_or(i64::MAX);

        let first = match self.last_window {
            None => last_closed,
            Some(last) => (last + 1).max(last_closed.saturating_sub(cap - 1)),
        };

        first..=last_closed
    }

    fn push(&mut self, datapoint: Option<bool>) {
        self.history.push_back(datapoint);
        while self.history.len() > self.rule.history_len() {
            self.history.pop_front();
        }
    }

    fn recent(&self, n: u32) -> impl Iterator<Item = &Option<bool>> {
        let skip = self.history.len().saturating_sub(n as usize);
        self.history.iter().skip(skip)
    }

    /// Next status given the current history
    fn decide(&self) -> (AlarmStatus, String) {
        let rule = &self.rule;
        let considered: Vec<Option<bool>> = self.recent(rule.evaluation_periods).copied().collect();

        if considered.iter().all(Option::is_none) {
            return (
                AlarmStatus::InsufficientData,
                format!("no datapoints in the last {} windows", considered.len()),
            );
        }

        let breaching = considered.iter().filter(|d| **d == Some(true)).count();
        if breaching >= rule.datapoints_to_alarm as usize {
            return (
                AlarmStatus::Alarm,
                format!(
                    "{breaching} of the last {} windows breached {} {} {}",
                    considered.len(),
                    rule.source,
                    rule.operator.symbol(),
                    rule.threshold
                ),
            );
        }

        if self.state.status == AlarmStatus::Alarm {
            let clean = self.history.len() >= rule.recovery_periods as usize
                && self.recent(rule.recovery_periods).all(|d| *d == Some(false));
            if !clean {
                return (AlarmStatus::Alarm, "waiting for recovery".to_string());
            }
        }

        (
            AlarmStatus::Ok,
            format!(
                "{} {} {} not met in the last {} windows",
                rule.source,
                rule.operator.symbol(),
                rule.threshold,
                considered.len()
            ),
        )
    }
}

/// Alarm evaluator that periodically checks rules against the metric store
pub struct AlertEvaluator {
    rules: Mutex<Vec<RuleState>>,
    store: Arc<MetricStore>,
    fanout: Arc<NotificationFanout>,
    interval: Duration,
}

impl AlertEvaluator {
    /// Create a new evaluator; every rule is validated first
    pub fn new(
        rules: Vec<AlarmRule>,
        store: Arc<MetricStore>,
        fanout: Arc<NotificationFanout>,
    ) -> Result<Self> {
        for rule in &rules {
            rule.validate()?;
        }

        Ok(Self {
            rules: Mutex::new(rules.into_iter().map(RuleState::new).collect()),
            store,
            fanout,
            interval: Duration::from_secs(60),
        })
    }

    /// Set the evaluation interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the evaluation loop
    pub async fn start(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "Starting alert evaluator");

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Alert evaluator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let transitions = self.evaluate_all(Utc::now()).await;
                    debug!(transitions = transitions.len(), "Evaluation tick finished");
                }
            }
        }
    }

    /// Evaluate all rules as of `now`
    ///
    /// Every state change is returned and logged. Changes into ALARM are published
    /// to the fan-out before this returns, in the order they happened.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Vec<AlarmTransition> {
        self.evaluate_with(now, false).await
    }

    /// Evaluate all rules as of `now`, judging the still open window too.
    ///
    /// Meant for the last evaluation before shutdown: samples of the current window
    /// would otherwise never be judged. That window counts as judged afterwards.
    pub async fn evaluate_final(&self, now: DateTime<Utc>) -> Vec<AlarmTransition> {
        self.evaluate_with(now, true).await
    }

    async fn evaluate_with(&self, now: DateTime<Utc>, close_current: bool) -> Vec<AlarmTransition> {
        let mut rules = self.rules.lock().await;

        let mut transitions = Vec::new();
        for rule_state in rules.iter_mut() {
            match self.evaluate_rule(rule_state, now, close_current) {
                Ok(mut changed) => transitions.append(&mut changed),
                Err(e) => error!(rule = %rule_state.rule.name, error = %e, "Error evaluating rule"),
            }
        }

        for transition in &transitions {
            metrics::counter!(
                "deadletter_alarm_transitions_total",
                "rule" => transition.rule_name.clone(),
                "to" => transition.to.to_string()
            )
            .increment(1);

            if transition.is_alarm_raised() {
                warn!(
                    rule = %transition.rule_name,
                    from = %transition.from,
                    value = ?transition.value,
                    threshold = transition.threshold,
                    "Alarm raised"
                );
                self.fanout.publish(transition).await;
            } else {
                info!(
                    rule = %transition.rule_name,
                    from = %transition.from,
                    to = %transition.to,
                    "Alarm state changed"
                );
            }
        }

        transitions
    }

    /// Judge every pending window of one rule
    fn evaluate_rule(
        &self,
        rule_state: &mut RuleState,
        now: DateTime<Utc>,
        close_current: bool,
    ) -> Result<Vec<AlarmTransition>> {
        let mut transitions = Vec::new();
        let width = rule_state.rule.window_millis();

        let horizon = if close_current {
            let current = now.timestamp_millis().div_euclid(width);
            millis_to_time(current.saturating_add(1).saturating_mul(width))?
        } else {
            now
        };

        for window in rule_state.pending_windows(horizon) {
            let start = millis_to_time(window.saturating_mul(width))?;
            let end = millis_to_time(window.saturating_add(1).saturating_mul(width))?;

            let value = self.window_value(&rule_state.rule, start, end);
            rule_state.last_window = Some(window);

            let datapoint = match value {
                WindowValue::Value(v) => Some(rule_state.rule.check(v)),
                WindowValue::Missing => match rule_state.rule.missing_data {
                    MissingDataPolicy::NotBreaching => Some(false),
                    MissingDataPolicy::Breaching => Some(true),
                    MissingDataPolicy::Missing => None,
                    MissingDataPolicy::Ignore => {
                        debug!(rule = %rule_state.rule.name, %start, "Ignoring window without data");
                        continue;
                    }
                },
            };

            debug!(
                rule = %rule_state.rule.name,
                %start,
                value = ?value,
                breaching = ?datapoint,
                "Judged window"
            );

            rule_state.push(datapoint);

            let (status, reason) = rule_state.decide();
            if status == rule_state.state.status {
                continue;
            }

            let transition = AlarmTransition {
                id: Uuid::new_v4(),
                rule_id: rule_state.rule.id,
                rule_name: rule_state.rule.name.clone(),
                severity: rule_state.rule.severity,
                from: rule_state.state.status,
                to: status,
                window_start: start,
                window_end: end,
                value: match value {
                    WindowValue::Value(v) => Some(v),
                    WindowValue::Missing => None,
                },
                threshold: rule_state.rule.threshold,
                reason,
                timestamp: now,
            };

            rule_state.state.status = status;
            rule_state.state.last_transition = Some(now);
            transitions.push(transition);
        }

        Ok(transitions)
    }

    /// Aggregate the samples of `[start, end)` for a rule
    fn window_value(&self, rule: &AlarmRule, start: DateTime<Utc>, end: DateTime<Utc>) -> WindowValue {
        match &rule.source {
            MetricSource::Count { metric } => {
                let Some(values) = self.well_formed_values(rule, metric, start, end) else {
                    return WindowValue::Missing;
                };
                rule.statistic
                    .apply(&values)
                    .map_or(WindowValue::Missing, WindowValue::Value)
            }
            MetricSource::Ratio { failures, total } => {
                let (Some(failures), Some(total)) = (
                    self.well_formed_values(rule, failures, start, end),
                    self.well_formed_values(rule, total, start, end),
                ) else {
                    return WindowValue::Missing;
                };

                let total: f64 = total.iter().sum();
                if total == 0.0 {
                    return WindowValue::Missing;
                }
                WindowValue::Value(failures.iter().sum::<f64>() / total)
            }
        }
    }

    /// Sample values of one series, or `None` if any sample is malformed
    fn well_formed_values(
        &self,
        rule: &AlarmRule,
        selector: &MetricSelector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<f64>> {
        let samples = self.store.samples(selector, start, end);

        if let Some(bad) = samples.iter().find(|s| !s.is_well_formed()) {
            warn!(
                rule = %rule.name,
                metric = %bad.key,
                value = bad.value,
                %start,
                "Malformed sample, treating window as missing data"
            );
            return None;
        }

        Some(samples.iter().map(|s: &MetricSample| s.value).collect())
    }

    /// Current state of every rule
    pub async fn states(&self) -> Vec<(AlarmRule, AlarmState)> {
        self.rules
            .lock()
            .await
            .iter()
            .map(|r| (r.rule.clone(), r.state.clone()))
            .collect()
    }

    /// Current state of one rule
    pub async fn state(&self, rule_id: Uuid) -> Option<AlarmState> {
        self.rules
            .lock()
            .await
            .iter()
            .find(|r| r.rule.id == rule_id)
            .map(|r| r.state.clone())
    }
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::internal(format!("window boundary {millis}ms is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::ChannelSubscriber;
    use crate::models::{MetricKey, Operator, ERRORS_LOGGED, FAILED_INVOCATIONS, INVOCATIONS};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    const NS: &str = "DeadLetterPipeline";

    /// Start of an epoch-aligned five minute window
    const T0: i64 = 1_700_000_100;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(T0 + secs, 0).unwrap()
    }

    fn window(k: i64) -> DateTime<Utc> {
        at(k * 300)
    }

    fn error_sample(store: &MetricStore, ts: DateTime<Utc>) {
        store.append(MetricSample::new(MetricKey::new(NS, ERRORS_LOGGED, "on-event"), 1.0, ts));
    }

    fn invocation_sample(store: &MetricStore, ts: DateTime<Utc>) {
        store.append(MetricSample::new(MetricKey::new(NS, INVOCATIONS, "on-event"), 1.0, ts));
    }

    fn failed_invocation_sample(store: &MetricStore, ts: DateTime<Utc>) {
        store.append(MetricSample::new(MetricKey::new(NS, FAILED_INVOCATIONS, "on-event"), 1.0, ts));
    }

    fn evaluator(rule: AlarmRule) -> (AlertEvaluator, Arc<MetricStore>, UnboundedReceiver<AlarmTransition>) {
        let store = Arc::new(MetricStore::new());
        let fanout = Arc::new(NotificationFanout::new(Duration::from_secs(1)));
        let (subscriber, rx) = ChannelSubscriber::new("test");
        fanout.subscribe(Arc::new(subscriber));

        let evaluator = AlertEvaluator::new(vec![rule], store.clone(), fanout).unwrap();
        (evaluator, store, rx)
    }

    async fn status(evaluator: &AlertEvaluator) -> AlarmStatus {
        evaluator.states().await[0].1.status
    }

    #[tokio::test]
    async fn test_errors_logged_fires_once_and_recovers() {
        let (evaluator, store, mut rx) = evaluator(AlarmRule::errors_logged(NS));

        error_sample(&store, at(10));
        error_sample(&store, at(20));

        let transitions = evaluator.evaluate_all(window(1)).await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, AlarmStatus::InsufficientData);
        assert_eq!(transitions[0].to, AlarmStatus::Alarm);
        assert_eq!(transitions[0].value, Some(2.0));
        assert_eq!(transitions[0].window_start, window(0));

        // Same instant again: nothing new to judge.
        assert!(evaluator.evaluate_all(window(1) + chrono::Duration::seconds(30)).await.is_empty());

        let recovered = evaluator.evaluate_all(window(2)).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].to, AlarmStatus::Ok);

        // Only the transition into ALARM was published.
        assert_eq!(rx.try_recv().unwrap().to, AlarmStatus::Alarm);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_continued_breach_does_not_renotify() {
        let (evaluator, store, mut rx) = evaluator(AlarmRule::errors_logged(NS));

        for k in 0..4 {
            error_sample(&store, window(k) + chrono::Duration::seconds(1));
        }

        evaluator.evaluate_all(window(1)).await;
        for k in 2..=4 {
            assert!(evaluator.evaluate_all(window(k)).await.is_empty());
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_m_of_n_datapoints() {
        let rule = AlarmRule::errors_logged(NS).with_periods(3, 2);
        let (evaluator, store, _rx) = evaluator(rule);

        error_sample(&store, at(10));
        evaluator.evaluate_all(window(1)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Ok);

        // Second breaching window among the last three.
        error_sample(&store, window(2) + chrono::Duration::seconds(5));
        evaluator.evaluate_all(window(2)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Ok);
        evaluator.evaluate_all(window(3)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Alarm);
    }

    #[tokio::test]
    async fn test_recovery_requires_consecutive_clean_windows() {
        let rule = AlarmRule::errors_logged(NS).with_recovery_periods(3);
        let (evaluator, store, _rx) = evaluator(rule);

        error_sample(&store, at(10));
        evaluator.evaluate_all(window(1)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Alarm);

        evaluator.evaluate_all(window(2)).await;
        evaluator.evaluate_all(window(3)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Alarm);

        // A breach in between resets the clean streak.
        error_sample(&store, window(3) + chrono::Duration::seconds(1));
        evaluator.evaluate_all(window(4)).await;
        evaluator.evaluate_all(window(5)).await;
        evaluator.evaluate_all(window(6)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Alarm);

        evaluator.evaluate_all(window(7)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Ok);
    }

    #[tokio::test]
    async fn test_catch_up_judges_every_closed_window() {
        let rule = AlarmRule::errors_logged(NS).with_periods(3, 3);
        let (evaluator, store, mut rx) = evaluator(rule);

        evaluator.evaluate_all(window(1)).await;
        for k in 1..4 {
            error_sample(&store, window(k) + chrono::Duration::seconds(1));
        }

        // One tick late by three windows.
        let transitions = evaluator.evaluate_all(window(4)).await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, AlarmStatus::Alarm);
        assert_eq!(transitions[0].window_start, window(3));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_late_samples_for_judged_windows_are_ignored() {
        let (evaluator, store, _rx) = evaluator(AlarmRule::errors_logged(NS));

        evaluator.evaluate_all(window(1)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Ok);

        error_sample(&store, at(10));
        evaluator.evaluate_all(window(1) + chrono::Duration::seconds(10)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Ok);
    }

    #[tokio::test]
    async fn test_final_evaluation_judges_open_window() {
        let (evaluator, store, mut rx) = evaluator(AlarmRule::errors_logged(NS));

        error_sample(&store, window(1) + chrono::Duration::seconds(10));
        let first = evaluator.evaluate_all(window(1) + chrono::Duration::seconds(20)).await;
        assert_eq!(first[0].to, AlarmStatus::Ok);

        let last = evaluator.evaluate_final(window(1) + chrono::Duration::seconds(30)).await;
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].to, AlarmStatus::Alarm);
        assert_eq!(last[0].window_start, window(1));
        assert_eq!(rx.try_recv().unwrap().to, AlarmStatus::Alarm);

        // Already judged: a regular tick after the window closes changes nothing.
        assert!(evaluator.evaluate_all(window(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_error_rate_scenario() {
        let (evaluator, store, mut rx) = evaluator(AlarmRule::error_rate(NS, 0.4));

        // 10 attempts, 3 failing: 30% stays below 40%.
        for i in 0..10 {
            invocation_sample(&store, at(i));
        }
        for i in 0..3 {
            failed_invocation_sample(&store, at(i));
        }
        // Errors logged outside of delivery attempts do not count.
        for i in 0..2 {
            store.append(MetricSample::new(MetricKey::new(NS, ERRORS_LOGGED, "http"), 1.0, at(i)));
        }
        let transitions = evaluator.evaluate_all(window(1)).await;
        assert_eq!(transitions[0].to, AlarmStatus::Ok);
        assert_eq!(transitions[0].value, Some(0.3));

        // 10 attempts, 5 failing: 50% fires.
        for i in 0..10 {
            invocation_sample(&store, window(1) + chrono::Duration::seconds(i));
        }
        for i in 0..5 {
            failed_invocation_sample(&store, window(1) + chrono::Duration::seconds(i));
        }
        let transitions = evaluator.evaluate_all(window(2)).await;
        assert_eq!(transitions[0].to, AlarmStatus::Alarm);
        assert_eq!(transitions[0].value, Some(0.5));
        assert_eq!(rx.try_recv().unwrap().value, Some(0.5));
    }

    #[tokio::test]
    async fn test_rate_without_traffic_is_missing_data() {
        let rule = AlarmRule::error_rate(NS, 0.4).with_missing_data(MissingDataPolicy::Breaching);
        let (evaluator, _store, _rx) = evaluator(rule);

        let transitions = evaluator.evaluate_all(window(1)).await;
        assert_eq!(transitions[0].to, AlarmStatus::Alarm);
        assert_eq!(transitions[0].value, None);
    }

    #[tokio::test]
    async fn test_missing_policy_reports_insufficient_data() {
        let rule = AlarmRule::errors_logged(NS).with_missing_data(MissingDataPolicy::Missing);
        let (evaluator, store, _rx) = evaluator(rule);

        error_sample(&store, at(10));
        evaluator.evaluate_all(window(1)).await;
        assert_eq!(status(&evaluator).await, AlarmStatus::Alarm);

        let transitions = evaluator.evaluate_all(window(2)).await;
        assert_eq!(transitions[0].to, AlarmStatus::InsufficientData);
    }

    #[tokio::test]
    async fn test_ignore_policy_keeps_state() {
        let rule = AlarmRule::errors_logged(NS).with_missing_data(MissingDataPolicy::Ignore);
        let (evaluator, store, _rx) = evaluator(rule);

        assert!(evaluator.evaluate_all(window(1)).await.is_empty());
        assert_eq!(status(&evaluator).await, AlarmStatus::InsufficientData);

        error_sample(&store, window(1) + chrono::Duration::seconds(1));
        evaluator.evaluate_all(window(2)).await;
        assert!(evaluator.evaluate_all(window(3)).await.is_empty());
        assert_eq!(status(&evaluator).await, AlarmStatus::Alarm);
    }

    #[tokio::test]
    async fn test_malformed_sample_is_treated_as_missing() {
        let (evaluator, store, _rx) = evaluator(AlarmRule::errors_logged(NS));

        error_sample(&store, at(10));
        store.append(MetricSample::new(
            MetricKey::new(NS, ERRORS_LOGGED, "on-event"),
            f64::NAN,
            at(11),
        ));

        let transitions = evaluator.evaluate_all(window(1)).await;
        assert_eq!(transitions[0].to, AlarmStatus::Ok);
        assert_eq!(transitions[0].value, None);
    }

    #[tokio::test]
    async fn test_depth_rule_uses_maximum() {
        let rule = AlarmRule::dead_letter_depth(NS, "EventHandlerDLQ");
        let (evaluator, store, _rx) = evaluator(rule);

        let key = MetricKey::new(NS, crate::models::DEAD_LETTER_DEPTH, "EventHandlerDLQ");
        store.append(MetricSample::new(key.clone(), 0.0, at(0)));
        store.append(MetricSample::new(key.clone(), 2.0, at(60)));
        store.append(MetricSample::new(key, 1.0, at(120)));

        let transitions = evaluator.evaluate_all(window(1)).await;
        assert_eq!(transitions[0].to, AlarmStatus::Alarm);
        assert_eq!(transitions[0].value, Some(2.0));
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let rule = AlarmRule::errors_logged(NS).with_periods(1, 2);
        let result = AlertEvaluator::new(
            vec![rule],
            Arc::new(MetricStore::new()),
            Arc::new(NotificationFanout::new(Duration::from_secs(1))),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_operator_threshold_in_reason() {
        let rule = AlarmRule::new(
            "latency",
            MetricSource::Count {
                metric: MetricSelector::new(NS, "latency"),
            },
            Operator::Lt,
            5.0,
        );
        let mut state = RuleState::new(rule);
        state.push(Some(true));

        let (status, reason) = state.decide();
        assert_eq!(status, AlarmStatus::Alarm);
        assert!(reason.contains("< 5"), "{reason}");
    }

    proptest! {
        #[test]
        fn prop_no_data_never_alarms_when_not_breaching(
            steps in proptest::collection::vec(1i64..2000, 1..30),
            periods in 1u32..4,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let rule = AlarmRule::errors_logged(NS).with_periods(periods, 1);
                let (evaluator, _store, mut rx) = evaluator(rule);

                let mut now = at(0);
                for step in steps {
                    now += chrono::Duration::seconds(step);
                    for t in evaluator.evaluate_all(now).await {
                        assert_ne!(t.to, AlarmStatus::Alarm);
                    }
                }
                assert!(rx.try_recv().is_err());
            });
        }

        #[test]
        fn prop_first_breach_fires_exactly_once(
            breach_window in 0i64..20,
            periods in 1u32..4,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let rule = AlarmRule::errors_logged(NS).with_periods(periods, 1);
                let (evaluator, store, mut rx) = evaluator(rule);
                error_sample(&store, window(breach_window) + chrono::Duration::seconds(7));

                for k in 1..=25 {
                    evaluator.evaluate_all(window(k)).await;
                }

                assert!(rx.try_recv().is_ok());
                assert!(rx.try_recv().is_err());
            });
        }
    }
}
