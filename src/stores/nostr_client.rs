//! Relay publishing
//!
//! Everything the checkout sends (gift wraps, wallet records, deletions) goes
//! out through [`publish_first_ack`]: the event is offered to every target
//! relay at once and the publish counts as delivered as soon as one relay
//! accepts it.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::{select_ok, BoxFuture, FutureExt};
use nostr_sdk::prelude::*;

/// Default write relays
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];

/// Relay appended to every publish
pub const BROADCAST_RELAY: &str = "wss://sendit.nosflare.com";

/// Sends one signed event to one relay
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RelayPublisher: Send + Sync {
    /// Ok once the relay acknowledged the event
    async fn publish_to(&self, relay_url: &str, event: &Event) -> Result<(), String>;
}

/// Publish failure across every target relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    NoRelays,
    AllRejected { attempted: usize, last_error: String },
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRelays => write!(f, "No relays configured"),
            Self::AllRejected { attempted, last_error } => write!(
                f,
                "Event rejected by all {} relays (last error: {})",
                attempted, last_error
            ),
        }
    }
}

impl std::error::Error for PublishError {}

fn normalize_relay_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

/// Write relays plus the broadcast relay, without duplicates
pub fn relay_targets(write_relays: &[String], broadcast_relay: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::with_capacity(write_relays.len() + 1);

    for relay in write_relays.iter().map(String::as_str).chain(std::iter::once(broadcast_relay)) {
        if relay.trim().is_empty() {
            continue;
        }
        let normalized = normalize_relay_url(relay);
        if !targets.iter().any(|t| normalize_relay_url(t) == normalized) {
            targets.push(relay.trim().to_string());
        }
    }

    targets
}

/// Offer `event` to all `relays` concurrently; return the first relay that acks
///
/// Acks still outstanding when the first arrives are no longer awaited.
pub async fn publish_first_ack(
    publisher: &dyn RelayPublisher,
    relays: &[String],
    event: &Event,
) -> Result<String, PublishError> {
    if relays.is_empty() {
        return Err(PublishError::NoRelays);
    }

    #[cfg(target_arch = "wasm32")]
    type PublishFuture<'a> = futures::future::LocalBoxFuture<'a, Result<String, String>>;
    #[cfg(not(target_arch = "wasm32"))]
    type PublishFuture<'a> = BoxFuture<'a, Result<String, String>>;

    let attempts: Vec<PublishFuture<'_>> = relays
        .iter()
        .map(|relay| {
            let fut = async move {
                publisher
                    .publish_to(relay, event)
                    .await
                    .map(|_| relay.clone())
                    .map_err(|e| {
                        log::debug!("Relay {} rejected event {}: {}", relay, event.id, e);
                        format!("{}: {}", relay, e)
                    })
            };
            #[cfg(target_arch = "wasm32")]
            let fut = fut.boxed_local();
            #[cfg(not(target_arch = "wasm32"))]
            let fut = fut.boxed();
            fut
        })
        .collect();

    match select_ok(attempts).await {
        Ok((relay, _pending)) => {
            log::info!("Event {} (kind {}) accepted by {}", event.id, event.kind, relay);
            Ok(relay)
        }
        Err(last_error) => {
            log::error!("Event {} rejected by all {} relays", event.id, relays.len());
            Err(PublishError::AllRejected {
                attempted: relays.len(),
                last_error,
            })
        }
    }
}

// =============================================================================
// nostr-sdk Publisher
// =============================================================================

/// Publisher backed by a nostr-sdk client
#[derive(Debug, Clone)]
pub struct NostrSdkPublisher {
    client: Client,
}

impl NostrSdkPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client without a signer; every event we publish is signed up front
    pub fn unsigned() -> Self {
        Self::new(Client::builder().build())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RelayPublisher for NostrSdkPublisher {
    async fn publish_to(&self, relay_url: &str, event: &Event) -> Result<(), String> {
        self.client
            .add_relay(relay_url)
            .await
            .map_err(|e| format!("Failed to add relay: {}", e))?;

        self.client
            .try_connect_relay(relay_url, Duration::from_secs(5))
            .await
            .map_err(|e| format!("Failed to connect: {}", e))?;

        let output = self
            .client
            .send_event_to([relay_url], event)
            .await
            .map_err(|e| e.to_string())?;

        if output.success.is_empty() {
            let reason = output
                .failed
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| "no acknowledgement".to_string());
            return Err(reason);
        }

        Ok(())
    }
}
