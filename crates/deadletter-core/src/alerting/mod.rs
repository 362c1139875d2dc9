//! Alerting for the dead-letter pipeline
//!
//! Evaluates alarm rules over the metric store and fans transitions into ALARM out
//! to every subscriber.

mod evaluator;
mod notifier;

pub use evaluator::AlertEvaluator;
pub use notifier::{
    ChannelSubscriber, LogSubscriber, NotificationChannel, NotificationError, NotificationFanout,
    NotificationResult, RedisSubscriber, SlackSubscriber, Subscriber, WebhookSubscriber,
};
