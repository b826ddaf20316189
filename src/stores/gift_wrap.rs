//! Gift-wrapped order messages (NIP-17 / NIP-59)
//!
//! Each order message is an unsigned kind 14 rumor, sealed (kind 13) by the
//! sender and wrapped (kind 1059) by a throwaway key, so relays only learn
//! that someone wrote to the recipient. Seal and wrap timestamps are pushed a
//! random distance into the past.
//!
//! Keys are generated inside [`wrap_message`] and dropped when it returns.
//! Two calls never share a seal key (when the sender is ephemeral) or a wrap
//! key.

use std::fmt;
use std::sync::Arc;

use nostr::nips::nip44::{self, Version};
use nostr_sdk::prelude::*;
use rand::Rng;
use sha2::{Digest, Sha256};

use super::nostr_client::{publish_first_ack, relay_targets, PublishError, RelayPublisher};
use super::settings_store::CheckoutSettings;
use crate::utils::format::short_key;
use crate::utils::time::now_secs;

/// Default timestamp jitter for seals and wraps (48 hours)
pub const DEFAULT_TIMESTAMP_WINDOW_SECS: u64 = 48 * 60 * 60;

// =============================================================================
// Types
// =============================================================================

/// Who the seal claims the message is from
#[derive(Clone)]
pub enum SenderIdentity {
    /// A fresh key per message, never stored
    Ephemeral,
    /// A long-lived identity (local keys, extension or remote signer)
    Signer(Arc<dyn NostrSigner>),
}

impl SenderIdentity {
    pub fn keys(keys: Keys) -> Self {
        Self::Signer(Arc::new(keys))
    }
}

impl fmt::Debug for SenderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ephemeral => write!(f, "SenderIdentity::Ephemeral"),
            Self::Signer(_) => write!(f, "SenderIdentity::Signer(..)"),
        }
    }
}

/// Subject tag of an order message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSubject {
    /// Carries the payment token to the seller
    OrderPayment,
    /// Shipping address, pickup contact or size note for the seller
    OrderInfo,
    /// Confirmation back to the buyer
    OrderReceipt,
}

impl MessageSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderPayment => "order-payment",
            Self::OrderInfo => "order-info",
            Self::OrderReceipt => "order-receipt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "order-payment" => Some(Self::OrderPayment),
            "order-info" => Some(Self::OrderInfo),
            "order-receipt" => Some(Self::OrderReceipt),
            _ => None,
        }
    }
}

/// Plaintext message plus addressing
#[derive(Debug, Clone, PartialEq)]
pub struct OrderMessage {
    pub recipient: PublicKey,
    pub content: String,
    pub subject: MessageSubject,
    /// Relay hint placed in the rumor's p tag
    pub relay_hint: Option<String>,
    /// Listing coordinate (`30402:<pubkey>:<d>`) the message refers to
    pub listing: Option<String>,
    /// Shared by every message of one order
    pub order_id: Option<String>,
}

impl OrderMessage {
    pub fn new(recipient: PublicKey, subject: MessageSubject, content: impl Into<String>) -> Self {
        Self {
            recipient,
            content: content.into(),
            subject,
            relay_hint: None,
            listing: None,
            order_id: None,
        }
    }

    pub fn with_relay_hint(mut self, relay: impl Into<String>) -> Self {
        self.relay_hint = Some(relay.into());
        self
    }

    pub fn with_listing(mut self, listing: Option<String>) -> Self {
        self.listing = listing;
        self
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }
}

/// A wrapped message ready to publish
#[derive(Debug, Clone)]
pub struct GiftWrapped {
    pub wrap: Event,
    pub rumor: UnsignedEvent,
    /// Seal signer, equal to the rumor author
    pub sender_pubkey: PublicKey,
}

impl GiftWrapped {
    /// Throwaway key that signed the outer layer
    pub fn wrap_pubkey(&self) -> PublicKey {
        self.wrap.pubkey
    }
}

/// A message recovered by its recipient
#[derive(Debug, Clone)]
pub struct UnwrappedMessage {
    pub sender: PublicKey,
    pub rumor: UnsignedEvent,
}

impl UnwrappedMessage {
    pub fn subject(&self) -> Option<MessageSubject> {
        self.tag_value("subject").and_then(MessageSubject::parse)
    }

    pub fn order_id(&self) -> Option<&str> {
        self.tag_value("order")
    }

    /// First value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.rumor.tags.iter().find_map(|tag| {
            let values = tag.as_slice();
            match values.first() {
                Some(kind) if kind == name => values.get(1).map(String::as_str),
                _ => None,
            }
        })
    }
}

/// Envelope failures
#[derive(Debug)]
pub enum EnvelopeError {
    Signer(String),
    Encryption(String),
    Decryption(String),
    InvalidEnvelope(String),
    Publish(PublishError),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signer(msg) => write!(f, "Signer error: {}", msg),
            Self::Encryption(msg) => write!(f, "Failed to encrypt message: {}", msg),
            Self::Decryption(msg) => write!(f, "Failed to decrypt message: {}", msg),
            Self::InvalidEnvelope(msg) => write!(f, "Invalid gift wrap: {}", msg),
            Self::Publish(err) => write!(f, "Failed to publish message: {}", err),
        }
    }
}

impl std::error::Error for EnvelopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Publish(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PublishError> for EnvelopeError {
    fn from(err: PublishError) -> Self {
        Self::Publish(err)
    }
}

// =============================================================================
// Wrapping
// =============================================================================

/// Content-addressed id of an unsigned event
///
/// SHA-256 over the compact JSON array
/// `[0, <lowercase pubkey hex>, created_at, kind, tags, content]`.
pub fn rumor_id(
    pubkey: &PublicKey,
    created_at: Timestamp,
    kind: Kind,
    tags: &Tags,
    content: &str,
) -> EventId {
    let tags: Vec<&[String]> = tags.iter().map(|t| t.as_slice()).collect();
    let canonical = serde_json::json!([
        0,
        pubkey.to_hex().to_lowercase(),
        created_at.as_u64(),
        kind.as_u16(),
        tags,
        content
    ]);
    let hash: [u8; 32] = Sha256::digest(canonical.to_string().as_bytes()).into();
    EventId::from_byte_array(hash)
}

fn randomized_timestamp(window_secs: u64) -> Timestamp {
    let now = now_secs();
    let offset = rand::thread_rng().gen_range(0..=window_secs.min(now));
    Timestamp::from(now - offset)
}

fn rumor_tags(message: &OrderMessage) -> Result<Vec<Tag>, EnvelopeError> {
    let mut p_tag = vec!["p".to_string(), message.recipient.to_hex()];
    if let Some(relay) = &message.relay_hint {
        p_tag.push(relay.clone());
    }

    let mut tags = vec![
        Tag::parse(p_tag).map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?,
        Tag::custom(TagKind::custom("subject"), [message.subject.as_str()]),
    ];

    if let Some(listing) = &message.listing {
        tags.push(Tag::custom(TagKind::custom("a"), [listing.clone()]));
    }
    if let Some(order_id) = &message.order_id {
        tags.push(Tag::custom(TagKind::custom("order"), [order_id.clone()]));
    }

    Ok(tags)
}

/// Build rumor, seal and gift wrap for one message
pub async fn wrap_message(
    sender: &SenderIdentity,
    message: &OrderMessage,
    window_secs: u64,
) -> Result<GiftWrapped, EnvelopeError> {
    let signer: Arc<dyn NostrSigner> = match sender {
        SenderIdentity::Ephemeral => Arc::new(Keys::generate()),
        SenderIdentity::Signer(signer) => signer.clone(),
    };

    let sender_pubkey = signer
        .get_public_key()
        .await
        .map_err(|e| EnvelopeError::Signer(e.to_string()))?;

    // Rumor (kind 14, unsigned)
    let created_at = Timestamp::now();
    let mut rumor = EventBuilder::new(Kind::PrivateDirectMessage, message.content.clone())
        .tags(rumor_tags(message)?)
        .custom_created_at(created_at)
        .build(sender_pubkey);
    rumor.id = Some(rumor_id(
        &rumor.pubkey,
        rumor.created_at,
        rumor.kind,
        &rumor.tags,
        &rumor.content,
    ));

    // Seal (kind 13), encrypted to the recipient by the sender
    let sealed_rumor = signer
        .nip44_encrypt(&message.recipient, &rumor.as_json())
        .await
        .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;
    let seal = EventBuilder::new(Kind::Seal, sealed_rumor)
        .custom_created_at(randomized_timestamp(window_secs))
        .sign(&signer)
        .await
        .map_err(|e| EnvelopeError::Signer(e.to_string()))?;

    // Gift wrap (kind 1059), encrypted and signed by a second throwaway key
    let wrap_keys = Keys::generate();
    let wrapped_seal = nip44::encrypt(
        wrap_keys.secret_key(),
        &message.recipient,
        seal.as_json(),
        Version::V2,
    )
    .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;
    let wrap = EventBuilder::new(Kind::GiftWrap, wrapped_seal)
        .tag(Tag::public_key(message.recipient))
        .custom_created_at(randomized_timestamp(window_secs))
        .sign_with_keys(&wrap_keys)
        .map_err(|e| EnvelopeError::Signer(e.to_string()))?;

    Ok(GiftWrapped {
        wrap,
        rumor,
        sender_pubkey,
    })
}

/// Open a gift wrap addressed to `recipient`
///
/// Rejects seals signed by someone other than the rumor author and rumors
/// whose id does not match their content.
pub fn unwrap_gift_wrap(recipient: &Keys, wrap: &Event) -> Result<UnwrappedMessage, EnvelopeError> {
    if wrap.kind != Kind::GiftWrap {
        return Err(EnvelopeError::InvalidEnvelope(format!(
            "expected kind 1059, got {}",
            wrap.kind
        )));
    }
    wrap.verify()
        .map_err(|e| EnvelopeError::InvalidEnvelope(format!("wrap signature: {}", e)))?;

    let seal_json = nip44::decrypt(recipient.secret_key(), &wrap.pubkey, &wrap.content)
        .map_err(|e| EnvelopeError::Decryption(e.to_string()))?;
    let seal = Event::from_json(seal_json)
        .map_err(|e| EnvelopeError::InvalidEnvelope(format!("seal: {}", e)))?;

    if seal.kind != Kind::Seal {
        return Err(EnvelopeError::InvalidEnvelope(format!(
            "expected kind 13 seal, got {}",
            seal.kind
        )));
    }
    seal.verify()
        .map_err(|e| EnvelopeError::InvalidEnvelope(format!("seal signature: {}", e)))?;

    let rumor_json = nip44::decrypt(recipient.secret_key(), &seal.pubkey, &seal.content)
        .map_err(|e| EnvelopeError::Decryption(e.to_string()))?;
    let rumor = UnsignedEvent::from_json(rumor_json)
        .map_err(|e| EnvelopeError::InvalidEnvelope(format!("rumor: {}", e)))?;

    if rumor.pubkey != seal.pubkey {
        return Err(EnvelopeError::InvalidEnvelope(
            "seal signer does not match rumor author".to_string(),
        ));
    }

    let expected = rumor_id(&rumor.pubkey, rumor.created_at, rumor.kind, &rumor.tags, &rumor.content);
    if rumor.id != Some(expected) {
        return Err(EnvelopeError::InvalidEnvelope("rumor id mismatch".to_string()));
    }

    Ok(UnwrappedMessage {
        sender: seal.pubkey,
        rumor,
    })
}

// =============================================================================
// Sending
// =============================================================================

/// Proof that a wrap reached at least one relay
#[derive(Debug, Clone, PartialEq)]
pub struct SentEnvelope {
    pub wrap_id: EventId,
    pub sender_pubkey: PublicKey,
    pub wrap_pubkey: PublicKey,
    pub acked_by: String,
}

/// Wraps messages and publishes them to the configured relays
pub struct EnvelopeBuilder {
    publisher: Arc<dyn RelayPublisher>,
    relays: Vec<String>,
    window_secs: u64,
}

impl EnvelopeBuilder {
    pub fn new(publisher: Arc<dyn RelayPublisher>, write_relays: &[String], broadcast_relay: &str) -> Self {
        Self {
            publisher,
            relays: relay_targets(write_relays, broadcast_relay),
            window_secs: DEFAULT_TIMESTAMP_WINDOW_SECS,
        }
    }

    pub fn from_settings(publisher: Arc<dyn RelayPublisher>, settings: &CheckoutSettings) -> Self {
        Self::new(publisher, &settings.write_relays, &settings.broadcast_relay)
            .with_timestamp_window(settings.seal_timestamp_window_secs)
    }

    pub fn with_timestamp_window(mut self, window_secs: u64) -> Self {
        self.window_secs = window_secs;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Wrap `message` and publish it; succeeds once any relay accepts
    pub async fn build_and_send(
        &self,
        sender: &SenderIdentity,
        message: &OrderMessage,
    ) -> Result<SentEnvelope, EnvelopeError> {
        let wrapped = wrap_message(sender, message, self.window_secs).await?;

        log::info!(
            "Sending {} to {} via {} relays",
            message.subject.as_str(),
            short_key(&message.recipient.to_hex()),
            self.relays.len()
        );

        match publish_first_ack(self.publisher.as_ref(), &self.relays, &wrapped.wrap).await {
            Ok(acked_by) => Ok(SentEnvelope {
                wrap_id: wrapped.wrap.id,
                sender_pubkey: wrapped.sender_pubkey,
                wrap_pubkey: wrapped.wrap_pubkey(),
                acked_by,
            }),
            Err(e) => {
                log::error!("Failed to deliver {}: {}", message.subject.as_str(), e);
                Err(e.into())
            }
        }
    }
}
