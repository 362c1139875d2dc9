//! Handler boundary and the reference handler

use std::future::Future;
use std::marker::PhantomData;

use serde::Deserialize;
use tracing::info;

use crate::models::{DispatchedEvent, FailureReason};

/// Business logic invoked for every delivery attempt
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Process one event; an `Err` makes the attempt a failure
    async fn handle(&self, event: &DispatchedEvent) -> Result<(), FailureReason>;
}

/// Adapts an async closure into a [`Handler`]
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Build a handler from an async closure
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(DispatchedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), FailureReason>> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(DispatchedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), FailureReason>> + Send,
{
    async fn handle(&self, event: &DispatchedEvent) -> Result<(), FailureReason> {
        (self.f)(event.clone()).await
    }
}

#[derive(Debug, Deserialize)]
struct Fields {
    #[serde(rename = "shouldFail", default)]
    should_fail: bool,
}

/// Reference handler: fails whenever the payload says `{"shouldFail": true}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShouldFailHandler;

#[async_trait::async_trait]
impl Handler for ShouldFailHandler {
    async fn handle(&self, event: &DispatchedEvent) -> Result<(), FailureReason> {
        let fields: Fields = serde_json::from_slice(&event.event.payload)
            .map_err(|e| FailureReason::payload(format!("failed to unmarshal message: {e}")))?;

        info!(
            source = %event.event.source,
            detail_type = %event.event.detail_type,
            should_fail = fields.should_fail,
            "message received"
        );

        if fields.should_fail {
            return Err(FailureReason::transient("failed to process message"));
        }

        Ok(())
    }
}
