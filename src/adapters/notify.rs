//! Notification sinks for the pipeline event feed.
//!
//! Sinks observe events derived from attestations. `emit` never blocks the
//! caller and never fails the operation that produced the event.

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::PipelineEvent;

/// Consumer of pipeline events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Logs each event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        info!(
            change_id = %event.change_id,
            event = ?event.event_type,
            subject = event.subject.as_deref().unwrap_or("-"),
            hash = %event.attestation_hash,
            "{}",
            event.summary
        );
    }
}

/// Fans events out to in-process subscribers
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event.clone());
    }
}

/// POSTs each event as JSON to a webhook, fire-and-forget
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl EventSink for WebhookSink {
    fn emit(&self, event: &PipelineEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(url = %self.url, "No runtime available; webhook event dropped");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let event = event.clone();

        handle.spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(%url, status = %response.status(), "Webhook rejected event");
                }
                Ok(_) => {}
                Err(e) => warn!(%url, error = %e, "Failed to deliver webhook event"),
            }
        });
    }
}
