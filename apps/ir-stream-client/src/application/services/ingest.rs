//! Message ingestion: applies feed events to the cache in arrival order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::services::cache::SubscriptionCache;
use crate::domain::subscription::FeedEvent;

/// Drain `events` into `cache` until the channel closes or `cancel` fires.
pub async fn run_ingestion(
    mut events: mpsc::Receiver<FeedEvent>,
    cache: Arc<SubscriptionCache>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            tracing::debug!("feed event channel closed");
            break;
        };

        match event {
            FeedEvent::Data { key, payload } => {
                cache.update(&key, payload);
            }
            FeedEvent::Rejected {
                key,
                subscription,
                rejection,
            } => {
                cache.reject(&key, subscription, rejection);
            }
            FeedEvent::ServerError(message) => {
                tracing::warn!(error = %message, "exchange reported an error");
            }
        }
    }
}
