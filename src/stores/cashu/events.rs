//! NIP-60 wallet publication
//!
//! After the ledger changes, the wallet is mirrored to relays so the user's
//! other sessions see the same balance: a proof record (kind 7375) for the
//! proofs that remain, a spending-history record (kind 7376), the wallet
//! snapshot (kind 37375) and, for spends, a deletion (kind 5) of the proof
//! records the spend touched. Proofs in those records that were not spent are
//! republished in the new proof record first. All content is NIP-44 encrypted
//! to the user's own key.
//!
//! Nothing here is retried. A failed step is logged and reported; the
//! remaining steps still run.

use std::sync::Arc;

use nostr::nips::nip60::{SpendingHistory, TransactionDirection};
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use super::ledger::{proofs_in_events, TokenLedger};
use super::types::{ProofData, ReceivedPayment, SettledPayment};
use crate::stores::nostr_client::{publish_first_ack, relay_targets, RelayPublisher};
use crate::stores::settings_store::CheckoutSettings;

/// Replaceable wallet snapshot kind
pub const WALLET_KIND: u16 = 37375;

/// Decrypted content of a kind 7375 proof record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEventContent {
    pub mint: String,
    pub proofs: Vec<ProofData>,
    /// Proof records this one supersedes
    #[serde(default)]
    pub del: Vec<String>,
}

/// Event IDs published by one sync, and what went wrong
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub proof_event: Option<EventId>,
    pub history_event: Option<EventId>,
    pub wallet_event: Option<EventId>,
    pub deletion_event: Option<EventId>,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, step: &str, result: Result<EventId, String>) -> Option<EventId> {
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("Wallet sync: {} failed: {}", step, e);
                self.errors.push(format!("{}: {}", step, e));
                None
            }
        }
    }
}

/// Build the decrypted spending-history content
pub fn history_content(history: &SpendingHistory) -> Vec<Vec<String>> {
    let mut content = vec![
        vec!["direction".to_string(), history.direction.to_string()],
        vec!["amount".to_string(), history.amount.to_string()],
        vec!["unit".to_string(), "sat".to_string()],
    ];

    for event_id in &history.created {
        content.push(vec![
            "e".to_string(),
            event_id.to_hex(),
            String::new(),
            "created".to_string(),
        ]);
    }

    for event_id in &history.destroyed {
        content.push(vec![
            "e".to_string(),
            event_id.to_hex(),
            String::new(),
            "destroyed".to_string(),
        ]);
    }

    content
}

/// Build the decrypted wallet snapshot content
pub fn wallet_content(balance: u64, mints: &[String], relays: &[String]) -> Vec<Vec<String>> {
    let mut content = vec![vec!["balance".to_string(), balance.to_string(), "sat".to_string()]];
    content.extend(mints.iter().map(|m| vec!["mint".to_string(), m.clone()]));
    content.extend(relays.iter().map(|r| vec!["relay".to_string(), r.clone()]));
    content
}

fn parse_event_ids(ids: &[String]) -> Vec<EventId> {
    ids.iter()
        .filter_map(|id| match EventId::from_hex(id) {
            Ok(event_id) => Some(event_id),
            Err(_) => {
                log::warn!("Skipping invalid event ID: {}", id);
                None
            }
        })
        .collect()
}

/// Publishes the wallet mirror for one user
pub struct WalletSync {
    signer: Arc<dyn NostrSigner>,
    publisher: Arc<dyn RelayPublisher>,
    ledger: Arc<TokenLedger>,
    relays: Vec<String>,
    wallet_id: String,
}

impl WalletSync {
    pub fn new(
        signer: Arc<dyn NostrSigner>,
        publisher: Arc<dyn RelayPublisher>,
        ledger: Arc<TokenLedger>,
        settings: &CheckoutSettings,
    ) -> Self {
        Self {
            signer,
            publisher,
            ledger,
            relays: relay_targets(&settings.write_relays, &settings.broadcast_relay),
            wallet_id: settings.wallet_id.clone(),
        }
    }

    /// Mirror an ecash spend
    pub async fn sync_send(&self, payment: &SettledPayment) -> SyncReport {
        let mut report = SyncReport::default();

        let pubkey = match self.signer.get_public_key().await {
            Ok(pubkey) => pubkey,
            Err(e) => {
                report.errors.push(format!("signer: {}", e));
                return report;
            }
        };

        // Untouched proofs from the retired events roll over into the new one
        let carried = match self.ledger.read().await {
            Ok(snapshot) => proofs_in_events(&snapshot, &payment.spent_event_ids),
            Err(e) => {
                report.errors.push(format!("ledger: {}", e));
                return report;
            }
        };
        let mut remaining = payment.kept_proofs.clone();
        for proof in carried {
            if !remaining.iter().any(|p| p.secret == proof.secret) {
                remaining.push(proof);
            }
        }
        let rolls_over = remaining.len() > payment.kept_proofs.len();

        if !remaining.is_empty() {
            let result = self
                .publish_proof_event(&pubkey, &payment.mint_url, &remaining, &payment.spent_event_ids)
                .await;
            report.proof_event = report.record("proof event", result);
        }

        let mut history = SpendingHistory::new(TransactionDirection::Out, payment.amount);
        for event_id in parse_event_ids(&payment.spent_event_ids) {
            history = history.add_destroyed(event_id);
        }
        if let Some(created) = report.proof_event {
            history = history.add_created(created);
        }
        let result = self.publish_history_event(&pubkey, &history).await;
        report.history_event = report.record("history event", result);

        let result = self.publish_wallet_event(&pubkey).await;
        report.wallet_event = report.record("wallet event", result);

        if !payment.spent_event_ids.is_empty() {
            if rolls_over && report.proof_event.is_none() {
                // The retired events are the only relay copy of the carried proofs
                let reason = "retired events still hold unspent proofs".to_string();
                report.deletion_event = report.record("deletion", Err(reason));
            } else {
                let result = self.publish_deletion(&payment.spent_event_ids).await;
                report.deletion_event = report.record("deletion", result);
            }
        }

        report
    }

    /// Mirror a top-up
    pub async fn sync_receive(&self, received: &ReceivedPayment) -> SyncReport {
        let mut report = SyncReport::default();

        let pubkey = match self.signer.get_public_key().await {
            Ok(pubkey) => pubkey,
            Err(e) => {
                report.errors.push(format!("signer: {}", e));
                return report;
            }
        };

        let result = self
            .publish_proof_event(&pubkey, &received.mint_url, &received.proofs, &[])
            .await;
        report.proof_event = report.record("proof event", result);

        let mut history = SpendingHistory::new(TransactionDirection::In, received.amount);
        if let Some(created) = report.proof_event {
            history = history.add_created(created);
        }
        let result = self.publish_history_event(&pubkey, &history).await;
        report.history_event = report.record("history event", result);

        let result = self.publish_wallet_event(&pubkey).await;
        report.wallet_event = report.record("wallet event", result);

        report
    }

    fn wallet_address(&self, pubkey: &PublicKey) -> String {
        format!("{}:{}:{}", WALLET_KIND, pubkey.to_hex(), self.wallet_id)
    }

    async fn encrypt_to_self(&self, pubkey: &PublicKey, plaintext: &str) -> Result<String, String> {
        self.signer
            .nip44_encrypt(pubkey, plaintext)
            .await
            .map_err(|e| format!("Failed to encrypt: {}", e))
    }

    async fn sign_and_publish(&self, builder: EventBuilder) -> Result<EventId, String> {
        let event = builder
            .sign(&self.signer)
            .await
            .map_err(|e| format!("Failed to sign: {}", e))?;

        publish_first_ack(self.publisher.as_ref(), &self.relays, &event)
            .await
            .map_err(|e| e.to_string())?;

        Ok(event.id)
    }

    async fn publish_proof_event(
        &self,
        pubkey: &PublicKey,
        mint_url: &str,
        proofs: &[ProofData],
        superseded: &[String],
    ) -> Result<EventId, String> {
        let content = TokenEventContent {
            mint: mint_url.to_string(),
            proofs: proofs.to_vec(),
            del: superseded.to_vec(),
        };
        let json = serde_json::to_string(&content)
            .map_err(|e| format!("Failed to serialize proof event: {}", e))?;
        let encrypted = self.encrypt_to_self(pubkey, &json).await?;

        let builder = EventBuilder::new(Kind::CashuWalletUnspentProof, encrypted).tag(Tag::custom(
            TagKind::custom("a"),
            [self.wallet_address(pubkey)],
        ));

        let event_id = self.sign_and_publish(builder).await?;
        log::info!("Published proof event {} ({} proofs)", event_id, proofs.len());

        if let Err(e) = self.ledger.register_proof_event(&event_id.to_hex(), proofs).await {
            log::warn!("Failed to record proof event mapping: {}", e);
        }

        Ok(event_id)
    }

    async fn publish_history_event(&self, pubkey: &PublicKey, history: &SpendingHistory) -> Result<EventId, String> {
        let json = serde_json::to_string(&history_content(history))
            .map_err(|e| format!("Failed to serialize history event: {}", e))?;
        let encrypted = self.encrypt_to_self(pubkey, &json).await?;

        let builder = EventBuilder::new(Kind::CashuWalletSpendingHistory, encrypted).tag(Tag::custom(
            TagKind::custom("a"),
            [self.wallet_address(pubkey)],
        ));

        let event_id = self.sign_and_publish(builder).await?;
        log::info!("Published history event {} ({} {})", event_id, history.direction, history.amount);
        Ok(event_id)
    }

    async fn publish_wallet_event(&self, pubkey: &PublicKey) -> Result<EventId, String> {
        let snapshot = self
            .ledger
            .read()
            .await
            .map_err(|e| format!("Failed to read ledger: {}", e))?;

        let content = wallet_content(snapshot.balance(), &snapshot.mints, &self.relays);
        let json = serde_json::to_string(&content)
            .map_err(|e| format!("Failed to serialize wallet event: {}", e))?;
        let encrypted = self.encrypt_to_self(pubkey, &json).await?;

        let builder = EventBuilder::new(Kind::from(WALLET_KIND), encrypted)
            .tag(Tag::identifier(self.wallet_id.clone()));

        let event_id = self.sign_and_publish(builder).await?;
        log::info!("Published wallet event {} (balance {})", event_id, snapshot.balance());
        Ok(event_id)
    }

    async fn publish_deletion(&self, event_ids: &[String]) -> Result<EventId, String> {
        let mut tags: Vec<Tag> = parse_event_ids(event_ids).into_iter().map(Tag::event).collect();
        if tags.is_empty() {
            return Err("No valid event IDs to delete".to_string());
        }
        tags.push(Tag::custom(TagKind::custom("k"), ["7375"]));

        let builder = EventBuilder::new(Kind::EventDeletion, "Proofs spent").tags(tags);

        let event_id = self.sign_and_publish(builder).await?;
        log::info!("Retired {} proof events", event_ids.len());
        Ok(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::ledger::{apply_send, register_proof_event};
    use crate::stores::cashu::types::{PaymentMethod, SendSplit};
    use crate::stores::test_support::{proof, RecordingPublisher};

    fn decrypt_json(keys: &Keys, event: &Event) -> serde_json::Value {
        let plain = nostr::nips::nip44::decrypt(keys.secret_key(), &keys.public_key(), &event.content).unwrap();
        serde_json::from_str(&plain).unwrap()
    }

    fn tag_values(event: &Event) -> Vec<Vec<String>> {
        event.tags.iter().map(|t| t.as_slice().to_vec()).collect()
    }

    fn sync_with(keys: &Keys, publisher: Arc<RecordingPublisher>, ledger: Arc<TokenLedger>) -> WalletSync {
        WalletSync::new(Arc::new(keys.clone()), publisher, ledger, &CheckoutSettings::default())
    }

    #[test]
    fn test_history_content_layout() {
        let destroyed = EventId::all_zeros();
        let history = SpendingHistory::new(TransactionDirection::Out, 21).add_destroyed(destroyed);

        assert_eq!(
            history_content(&history),
            vec![
                vec!["direction".to_string(), "out".to_string()],
                vec!["amount".to_string(), "21".to_string()],
                vec!["unit".to_string(), "sat".to_string()],
                vec!["e".to_string(), destroyed.to_hex(), String::new(), "destroyed".to_string()],
            ]
        );
    }

    #[test]
    fn test_wallet_content_layout() {
        assert_eq!(
            wallet_content(42, &["https://mint.example.com".to_string()], &["wss://nos.lol".to_string()]),
            vec![
                vec!["balance".to_string(), "42".to_string(), "sat".to_string()],
                vec!["mint".to_string(), "https://mint.example.com".to_string()],
                vec!["relay".to_string(), "wss://nos.lol".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_send_publishes_and_retires() {
        let keys = Keys::generate();
        let publisher = Arc::new(RecordingPublisher::default());
        let ledger = Arc::new(TokenLedger::in_memory());
        ledger
            .apply_receive("https://mint.example.com", &[proof("A", 2, "change1")], 1)
            .await
            .unwrap();

        let spent = EventId::all_zeros().to_hex();
        let payment = SettledPayment {
            method: PaymentMethod::Cashu,
            mint_url: "https://mint.example.com".to_string(),
            amount: 10,
            token: "cashuBtest".to_string(),
            sent_proofs: vec![proof("A", 10, "out1")],
            kept_proofs: vec![proof("A", 2, "change1")],
            spent_event_ids: vec![spent.clone()],
        };

        let report = sync_with(&keys, publisher.clone(), ledger.clone()).sync_send(&payment).await;
        assert!(report.is_complete(), "{:?}", report.errors);

        let events = publisher.events();
        let kinds: Vec<u16> = events.iter().map(|e| e.kind.as_u16()).collect();
        assert_eq!(kinds, vec![7375, 7376, 37375, 5]);

        let address = format!("37375:{}:nostrmarket-wallet", keys.public_key().to_hex());
        assert_eq!(tag_values(&events[0]), vec![vec!["a".to_string(), address.clone()]]);
        assert_eq!(tag_values(&events[1]), vec![vec!["a".to_string(), address]]);

        let proof_content: TokenEventContent =
            serde_json::from_value(decrypt_json(&keys, &events[0])).unwrap();
        assert_eq!(proof_content.proofs, payment.kept_proofs);
        assert_eq!(proof_content.del, vec![spent.clone()]);

        let history = decrypt_json(&keys, &events[1]);
        assert_eq!(history[0], serde_json::json!(["direction", "out"]));
        assert_eq!(history[1], serde_json::json!(["amount", "10"]));

        let wallet = decrypt_json(&keys, &events[2]);
        assert_eq!(wallet[0], serde_json::json!(["balance", "2", "sat"]));

        assert_eq!(
            tag_values(&events[3]),
            vec![
                vec!["e".to_string(), spent],
                vec!["k".to_string(), "7375".to_string()],
            ]
        );

        let snapshot = ledger.read().await.unwrap();
        assert_eq!(
            snapshot.proof_events.get("change1"),
            Some(&events[0].id.to_hex())
        );
    }

    /// Ledger after spending `a1` out of an event that also held `c1`
    async fn ledger_after_mixed_spend(spent: &str) -> Arc<TokenLedger> {
        let ledger = Arc::new(TokenLedger::in_memory());
        ledger
            .write_atomic(|snapshot| {
                snapshot.proofs = vec![proof("A", 4096, "a1"), proof("C", 32, "c1")];
                register_proof_event(snapshot, spent, &[proof("A", 4096, "a1"), proof("C", 32, "c1")]);
                let split = SendSplit {
                    keep: vec![proof("A", 64, "change1")],
                    send: vec![proof("A", 4000, "out1")],
                };
                apply_send(snapshot, &[proof("A", 4096, "a1")], &split);
                Ok(())
            })
            .await
            .unwrap();
        ledger
    }

    fn mixed_payment(spent: &str) -> SettledPayment {
        SettledPayment {
            method: PaymentMethod::Cashu,
            mint_url: "https://mint.example.com".to_string(),
            amount: 4000,
            token: "cashuBtest".to_string(),
            sent_proofs: vec![proof("A", 4000, "out1")],
            kept_proofs: vec![proof("A", 64, "change1")],
            spent_event_ids: vec![spent.to_string()],
        }
    }

    #[tokio::test]
    async fn test_sync_send_carries_untouched_proofs() {
        let keys = Keys::generate();
        let publisher = Arc::new(RecordingPublisher::default());
        let spent = EventId::all_zeros().to_hex();
        let ledger = ledger_after_mixed_spend(&spent).await;

        let report = sync_with(&keys, publisher.clone(), ledger.clone())
            .sync_send(&mixed_payment(&spent))
            .await;
        assert!(report.is_complete(), "{:?}", report.errors);

        let events = publisher.events();
        let proof_content: TokenEventContent =
            serde_json::from_value(decrypt_json(&keys, &events[0])).unwrap();
        assert_eq!(
            proof_content.proofs,
            vec![proof("A", 64, "change1"), proof("C", 32, "c1")]
        );
        assert_eq!(events[3].kind, Kind::EventDeletion);

        let wallet = decrypt_json(&keys, &events[2]);
        assert_eq!(wallet[0], serde_json::json!(["balance", "96", "sat"]));

        let snapshot = ledger.read().await.unwrap();
        let new_event = events[0].id.to_hex();
        assert_eq!(snapshot.proof_events.get("c1"), Some(&new_event));
        assert_eq!(snapshot.proof_events.get("change1"), Some(&new_event));
    }

    #[tokio::test]
    async fn test_sync_send_keeps_old_event_when_rollover_fails() {
        let keys = Keys::generate();
        let publisher = Arc::new(RecordingPublisher::rejecting(&[
            "wss://relay.damus.io",
            "wss://nos.lol",
            "wss://sendit.nosflare.com",
        ]));
        let spent = EventId::all_zeros().to_hex();
        let ledger = ledger_after_mixed_spend(&spent).await;

        let report = sync_with(&keys, publisher.clone(), ledger.clone())
            .sync_send(&mixed_payment(&spent))
            .await;

        assert!(report.deletion_event.is_none());
        assert!(report.errors.iter().any(|e| e.starts_with("deletion")));
        assert!(publisher.events().is_empty());
        assert_eq!(
            ledger.read().await.unwrap().proof_events.get("c1"),
            Some(&spent)
        );
    }

    #[tokio::test]
    async fn test_sync_receive_has_no_deletion() {
        let keys = Keys::generate();
        let publisher = Arc::new(RecordingPublisher::default());
        let ledger = Arc::new(TokenLedger::in_memory());

        let received = ReceivedPayment {
            mint_url: "https://mint.example.com".to_string(),
            amount: 20,
            proofs: vec![proof("A", 16, "m1"), proof("A", 4, "m2")],
        };

        let report = sync_with(&keys, publisher.clone(), ledger).sync_receive(&received).await;
        assert!(report.is_complete());
        assert!(report.deletion_event.is_none());

        let kinds: Vec<u16> = publisher.events().iter().map(|e| e.kind.as_u16()).collect();
        assert_eq!(kinds, vec![7375, 7376, 37375]);
    }

    #[tokio::test]
    async fn test_sync_reports_publish_failures() {
        let keys = Keys::generate();
        let publisher = Arc::new(RecordingPublisher::rejecting(&[
            "wss://relay.damus.io",
            "wss://nos.lol",
            "wss://sendit.nosflare.com",
        ]));

        let received = ReceivedPayment {
            mint_url: "https://mint.example.com".to_string(),
            amount: 1,
            proofs: vec![proof("A", 1, "m1")],
        };

        let report = sync_with(&keys, publisher, Arc::new(TokenLedger::in_memory()))
            .sync_receive(&received)
            .await;
        assert!(!report.is_complete());
        assert_eq!(report.errors.len(), 3);
    }
}
