//! Order orchestration
//!
//! Runs a ready [`CheckoutSession`] through pricing, settlement, order
//! messages and ledger bookkeeping. Every failure ends here as a
//! [`CheckoutOutcome`]; nothing is rolled back once the payment settled.

use std::fmt;
use std::sync::Arc;

use nostr_sdk::PublicKey;
use uuid::Uuid;

use super::messages::{fulfillment_message, payment_message, receipt_message};
use super::order::{CheckoutError, CheckoutSession, CheckoutStage, Order};
use crate::services::fiat_rates::{to_sats, PriceError, RateSource};
use crate::stores::cashu::errors::{CashuResult, CashuWalletError, NonFatal};
use crate::stores::cashu::events::{SyncReport, WalletSync};
use crate::stores::cashu::settlement::{CancelSignal, SettlementEngine};
use crate::stores::cashu::types::{
    HistoryEntry, HistoryType, PaymentMethod, ReceivedPayment, SettledPayment,
};
use crate::stores::gift_wrap::{
    EnvelopeBuilder, EnvelopeError, MessageSubject, OrderMessage, SenderIdentity, SentEnvelope,
};
use crate::stores::settings_store::CheckoutSettings;
use crate::utils::format::format_sats;
use crate::utils::time::now_secs;

// =============================================================================
// Outcomes
// =============================================================================

/// Why a checkout did not complete
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The order itself is unusable (incomplete session, price under 1 sat)
    InvalidOrder(String),
    /// The mint answered with data we could not read
    MintValidation,
    /// Mint, wallet or rate service failure
    Mint(String),
    Cancelled,
    /// Payment settled but the seller was not told; the token is kept for display
    Delivery { token: String, message: String },
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOrder(msg) => write!(f, "{}", msg),
            Self::MintValidation => write!(f, "Failed to validate invoice, check your mint"),
            Self::Mint(msg) => write!(f, "{}", msg),
            Self::Cancelled => write!(f, "Payment cancelled"),
            Self::Delivery { message, .. } => {
                write!(f, "Payment went through but the seller could not be notified: {}", message)
            }
            Self::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<&CheckoutError> for FailureReason {
    fn from(err: &CheckoutError) -> Self {
        match err {
            CheckoutError::Price(PriceError::RateUnavailable { .. }) => Self::Mint(err.to_string()),
            CheckoutError::Settlement(e) => match e {
                CashuWalletError::MalformedResponse(_) => Self::MintValidation,
                CashuWalletError::Cancelled => Self::Cancelled,
                CashuWalletError::InvalidAmount { .. } => Self::InvalidOrder(e.to_string()),
                CashuWalletError::Storage(_) | CashuWalletError::Internal(_) => Self::Internal(e.to_string()),
                _ => Self::Mint(e.to_string()),
            },
            CheckoutError::Delivery { token, source } => Self::Delivery {
                token: token.clone(),
                message: source.to_string(),
            },
            _ => Self::InvalidOrder(err.to_string()),
        }
    }
}

/// Terminal state shown to the buyer
#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    PaymentConfirmed,
    CashuPaymentSent,
    InvoiceGenerationFailed(FailureReason),
    CashuPaymentFailed(FailureReason),
}

impl CheckoutOutcome {
    fn failed(method: Option<PaymentMethod>, reason: FailureReason) -> Self {
        match method {
            Some(PaymentMethod::Lightning) => Self::InvoiceGenerationFailed(reason),
            Some(PaymentMethod::Cashu) | None => Self::CashuPaymentFailed(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::PaymentConfirmed | Self::CashuPaymentSent)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::InvoiceGenerationFailed(reason) | Self::CashuPaymentFailed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Everything one checkout attempt did
#[derive(Debug, Clone)]
pub struct CheckoutReport {
    pub outcome: CheckoutOutcome,
    /// Shared by every message of this order
    pub order_id: String,
    /// Charged amount, once the price was converted
    pub amount: Option<u64>,
    /// Messages that reached a relay, in send order
    pub messages: Vec<SentEnvelope>,
    pub wallet_sync: Option<SyncReport>,
    /// Best-effort steps that failed without failing the checkout
    pub warnings: Vec<NonFatal>,
}

impl CheckoutReport {
    fn new(order_id: String) -> Self {
        Self {
            outcome: CheckoutOutcome::CashuPaymentFailed(FailureReason::Internal("not started".to_string())),
            order_id,
            amount: None,
            messages: Vec::new(),
            wallet_sync: None,
            warnings: Vec::new(),
        }
    }
}

/// A wallet top-up and its relay mirror
#[derive(Debug, Clone)]
pub struct TopUpReport {
    pub received: ReceivedPayment,
    /// Absent when no wallet sync is configured
    pub wallet_sync: Option<SyncReport>,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct CheckoutOrchestrator {
    engine: SettlementEngine,
    envelopes: EnvelopeBuilder,
    rates: Arc<dyn RateSource>,
    wallet_sync: Option<WalletSync>,
    marketplace_name: String,
    unconverted_price_fallback: bool,
}

impl CheckoutOrchestrator {
    pub fn new(
        engine: SettlementEngine,
        envelopes: EnvelopeBuilder,
        rates: Arc<dyn RateSource>,
        settings: &CheckoutSettings,
    ) -> Self {
        Self {
            engine,
            envelopes,
            rates,
            wallet_sync: None,
            marketplace_name: settings.marketplace_name.clone(),
            unconverted_price_fallback: settings.unconverted_price_fallback,
        }
    }

    /// Mirror ecash spends to the buyer's NIP-60 wallet
    pub fn with_wallet_sync(mut self, wallet_sync: WalletSync) -> Self {
        self.wallet_sync = Some(wallet_sync);
        self
    }

    pub fn engine(&self) -> &SettlementEngine {
        &self.engine
    }

    /// Pay for the session's order and notify the seller
    ///
    /// `buyer` is the buyer's real pubkey; without it no receipt is sent and
    /// the payment message names an anonymous buyer.
    pub async fn checkout(
        &self,
        session: &mut CheckoutSession,
        buyer: Option<PublicKey>,
        cancel: &CancelSignal,
    ) -> CheckoutReport {
        let mut report = CheckoutReport::new(Uuid::new_v4().to_string());
        let method = session.payment_method();

        match self.run(session, buyer, cancel, &mut report).await {
            Ok(method) => {
                log::info!("Checkout {} complete", report.order_id);
                report.outcome = match method {
                    PaymentMethod::Lightning => CheckoutOutcome::PaymentConfirmed,
                    PaymentMethod::Cashu => CheckoutOutcome::CashuPaymentSent,
                };
            }
            Err(e) => {
                log::error!("Checkout {} failed: {}", report.order_id, e);
                session.fail();
                report.outcome = CheckoutOutcome::failed(method, FailureReason::from(&e));
            }
        }

        report
    }

    /// Mint `amount` sats into the buyer's wallet and mirror it to relays
    pub async fn top_up(&self, amount: u64, cancel: &CancelSignal) -> CashuResult<TopUpReport> {
        let received = self.engine.mint_to_wallet(amount, cancel).await?;

        let wallet_sync = match &self.wallet_sync {
            Some(wallet_sync) => Some(wallet_sync.sync_receive(&received).await),
            None => None,
        };

        Ok(TopUpReport { received, wallet_sync })
    }

    async fn run(
        &self,
        session: &mut CheckoutSession,
        buyer: Option<PublicKey>,
        cancel: &CancelSignal,
        report: &mut CheckoutReport,
    ) -> Result<PaymentMethod, CheckoutError> {
        let order = session.order()?;

        let price = to_sats(
            order.total(),
            &order.product.currency,
            self.rates.as_ref(),
            self.unconverted_price_fallback,
        )
        .await?;
        report.warnings.extend(price.fallback);
        report.amount = Some(price.sats);

        log::info!(
            "Checkout {}: {} for {} x{} via {:?}",
            report.order_id,
            format_sats(price.sats),
            order.product.title,
            order.quantity,
            order.payment_method
        );

        let payment = self.engine.settle(order.payment_method, price.sats, cancel).await?;

        session.advance(CheckoutStage::DispatchingMessages)?;
        let delivery = self.dispatch_messages(&order, &payment, buyer, report).await;

        // The token has left the wallet whether or not the seller heard about it
        session.advance(CheckoutStage::UpdatingLedgerAndHistory)?;
        self.update_ledger_and_history(&payment, report).await;

        if let Err(source) = delivery {
            return Err(CheckoutError::Delivery {
                token: payment.token,
                source,
            });
        }

        session.advance(CheckoutStage::Done)?;
        Ok(order.payment_method)
    }

    /// Payment, then details, then receipt; each under a fresh ephemeral key
    async fn dispatch_messages(
        &self,
        order: &Order,
        payment: &SettledPayment,
        buyer: Option<PublicKey>,
        report: &mut CheckoutReport,
    ) -> Result<(), EnvelopeError> {
        let title = &order.product.title;
        let seller = order.product.seller;

        let mut messages = vec![OrderMessage::new(
            seller,
            MessageSubject::OrderPayment,
            payment_message(title, buyer.as_ref(), &self.marketplace_name, &payment.token),
        )];

        if let Some(details) = fulfillment_message(order) {
            messages.push(OrderMessage::new(seller, MessageSubject::OrderInfo, details));
        }

        if let Some(buyer) = buyer {
            messages.push(OrderMessage::new(
                buyer,
                MessageSubject::OrderReceipt,
                receipt_message(title, &seller),
            ));
        }

        let relay_hint = self.envelopes.relays().first().cloned();

        for message in messages {
            let mut message = message
                .with_listing(order.product.listing.clone())
                .with_order_id(report.order_id.clone());
            if let Some(hint) = &relay_hint {
                message = message.with_relay_hint(hint.clone());
            }

            let sent = self
                .envelopes
                .build_and_send(&SenderIdentity::Ephemeral, &message)
                .await?;
            report.messages.push(sent);
        }

        Ok(())
    }

    async fn update_ledger_and_history(&self, payment: &SettledPayment, report: &mut CheckoutReport) {
        let entry = HistoryEntry::new(HistoryType::CashuPurchase, payment.amount, now_secs());
        if let Err(e) = self.engine.ledger().record_history(entry).await {
            let warning = NonFatal::new("history", e.to_string());
            log::warn!("{}", warning);
            report.warnings.push(warning);
        }

        if payment.method != PaymentMethod::Cashu {
            return;
        }

        if let Some(wallet_sync) = &self.wallet_sync {
            let sync = wallet_sync.sync_send(payment).await;
            for error in &sync.errors {
                report.warnings.push(NonFatal::new("wallet-sync", error.clone()));
            }
            report.wallet_sync = Some(sync);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use nostr_sdk::{Event, Keys, Kind};

    use crate::stores::cashu::ledger::TokenLedger;
    use crate::stores::cashu::types::ProofData;
    use crate::stores::checkout::order::tests::{jane_doe, product};
    use crate::stores::checkout::order::{DeliveryChoice, Product, ShippingType};
    use crate::stores::gift_wrap::unwrap_gift_wrap;
    use crate::stores::test_support::{proof, FixedRates, MintStep, RecordingPublisher, ScriptedMint};

    struct Harness {
        mint: Arc<ScriptedMint>,
        ledger: Arc<TokenLedger>,
        publisher: Arc<RecordingPublisher>,
        rates: Arc<FixedRates>,
        orchestrator: CheckoutOrchestrator,
    }

    fn harness(mint: ScriptedMint, publisher: RecordingPublisher, wallet_keys: Option<&Keys>) -> Harness {
        let settings = CheckoutSettings::default();
        let mint = Arc::new(mint);
        let ledger = Arc::new(TokenLedger::in_memory());
        let publisher = Arc::new(publisher);
        let rates = Arc::new(FixedRates::new(&[("USD", 100_000.0)]));

        let engine = SettlementEngine::new(mint.clone(), ledger.clone()).with_auto_pay(false);
        let envelopes = EnvelopeBuilder::from_settings(publisher.clone(), &settings);
        let mut orchestrator = CheckoutOrchestrator::new(engine, envelopes, rates.clone(), &settings);
        if let Some(keys) = wallet_keys {
            orchestrator = orchestrator.with_wallet_sync(WalletSync::new(
                Arc::new(keys.clone()),
                publisher.clone(),
                ledger.clone(),
                &settings,
            ));
        }

        Harness {
            mint,
            ledger,
            publisher,
            rates,
            orchestrator,
        }
    }

    fn shipped_session(product: Product, method: PaymentMethod) -> CheckoutSession {
        let mut session = CheckoutSession::new(product, 1).unwrap();
        session.choose_payment_method(method).unwrap();
        session.choose_delivery(None).unwrap();
        session.provide_shipping(jane_doe()).unwrap();
        session
    }

    fn gift_wraps(events: &[Event]) -> Vec<Event> {
        events.iter().filter(|e| e.kind == Kind::GiftWrap).cloned().collect()
    }

    async fn fund(ledger: &TokenLedger, proofs: Vec<ProofData>) {
        ledger
            .write_atomic(|snapshot| {
                snapshot.mints.push("https://mint.example.com".to_string());
                snapshot.proofs = proofs;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_below_one_sat_rejected_before_mint() {
        let h = harness(ScriptedMint::new(vec![]), RecordingPublisher::default(), None);

        let mut product = product(ShippingType::Free);
        product.price = 0.0000001;
        product.currency = "USD".to_string();
        let mut session = shipped_session(product, PaymentMethod::Lightning);

        let report = h.orchestrator.checkout(&mut session, None, &CancelSignal::never()).await;

        assert!(matches!(
            report.outcome,
            CheckoutOutcome::InvoiceGenerationFailed(FailureReason::InvalidOrder(_))
        ));
        assert_eq!(h.rates.lookups(), 1);
        assert_eq!(h.mint.calls().total(), 0);
        assert!(h.publisher.events().is_empty());
        assert_eq!(session.stage(), CheckoutStage::Failed);
    }

    #[tokio::test]
    async fn test_cashu_checkout_sends_three_messages_with_distinct_keys() {
        let seller_keys = Keys::generate();
        let buyer_keys = Keys::generate();
        let h = harness(ScriptedMint::new(vec![]), RecordingPublisher::default(), Some(&buyer_keys));
        fund(&h.ledger, vec![proof("A", 4096, "s1")]).await;

        let mut product = product(ShippingType::Free);
        product.seller = seller_keys.public_key();
        let mut session = shipped_session(product, PaymentMethod::Cashu);

        let report = h
            .orchestrator
            .checkout(&mut session, Some(buyer_keys.public_key()), &CancelSignal::never())
            .await;

        assert_eq!(report.outcome, CheckoutOutcome::CashuPaymentSent);
        assert_eq!(session.stage(), CheckoutStage::Done);
        assert_eq!(report.amount, Some(2100));
        assert_eq!(report.messages.len(), 3);

        let mut keys = HashSet::new();
        for sent in &report.messages {
            assert!(keys.insert(sent.sender_pubkey));
            assert!(keys.insert(sent.wrap_pubkey));
        }
        assert_eq!(keys.len(), 6);
        assert!(!keys.contains(&buyer_keys.public_key()));

        let wraps = gift_wraps(&h.publisher.events());
        assert_eq!(wraps.len(), 3);

        let payment = unwrap_gift_wrap(&seller_keys, &wraps[0]).unwrap();
        assert_eq!(payment.subject(), Some(MessageSubject::OrderPayment));
        assert!(payment.rumor.content.ends_with(": cashuBtest1x2100"));
        assert_eq!(payment.order_id(), Some(report.order_id.as_str()));

        let info = unwrap_gift_wrap(&seller_keys, &wraps[1]).unwrap();
        assert_eq!(
            info.rumor.content,
            "Please ship the product to Jane Doe at 123 Main St, Springfield, 00000, IL, USA."
        );

        let receipt = unwrap_gift_wrap(&buyer_keys, &wraps[2]).unwrap();
        assert_eq!(receipt.subject(), Some(MessageSubject::OrderReceipt));
        assert_eq!(receipt.order_id(), Some(report.order_id.as_str()));
        assert!(unwrap_gift_wrap(&seller_keys, &wraps[2]).is_err());

        let snapshot = h.ledger.read().await.unwrap();
        assert_eq!(snapshot.balance(), 4096 - 2100);
        assert_eq!(snapshot.history[0].kind, HistoryType::CashuPurchase);
        assert_eq!(snapshot.history[0].amount, 2100);

        let sync = report.wallet_sync.unwrap();
        assert!(sync.is_complete());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lightning_checkout_without_buyer() {
        let seller_keys = Keys::generate();
        let h = harness(
            ScriptedMint::new(vec![MintStep::NotPaid, MintStep::Proofs(vec![proof("A", 2100, "m1")])]),
            RecordingPublisher::default(),
            None,
        );

        let mut product = product(ShippingType::Pickup);
        product.seller = seller_keys.public_key();
        let mut session = CheckoutSession::new(product, 1).unwrap();
        session.choose_payment_method(PaymentMethod::Lightning).unwrap();
        session.choose_delivery(Some(DeliveryChoice::InPerson)).unwrap();

        let report = h.orchestrator.checkout(&mut session, None, &CancelSignal::never()).await;

        assert_eq!(report.outcome, CheckoutOutcome::PaymentConfirmed);
        assert_eq!(h.mint.calls().mint_attempts, 2);
        // Payment only: in-person delivery and no size, no buyer to receive a receipt
        assert_eq!(report.messages.len(), 1);

        let wraps = gift_wraps(&h.publisher.events());
        let payment = unwrap_gift_wrap(&seller_keys, &wraps[0]).unwrap();
        assert!(payment.rumor.content.contains("from an anonymous buyer"));

        let snapshot = h.ledger.read().await.unwrap();
        assert!(snapshot.proofs.is_empty());
        assert_eq!(snapshot.history.len(), 1);
        assert!(report.wallet_sync.is_none());
    }

    #[tokio::test]
    async fn test_undelivered_messages_keep_the_token() {
        let h = harness(
            ScriptedMint::new(vec![]),
            RecordingPublisher::rejecting(&["wss://relay.damus.io", "wss://nos.lol", "wss://sendit.nosflare.com"]),
            None,
        );
        fund(&h.ledger, vec![proof("A", 2100, "s1")]).await;

        let mut session = shipped_session(product(ShippingType::Free), PaymentMethod::Cashu);
        let report = h.orchestrator.checkout(&mut session, None, &CancelSignal::never()).await;

        match report.outcome {
            CheckoutOutcome::CashuPaymentFailed(FailureReason::Delivery { token, .. }) => {
                assert_eq!(token, "cashuBtest1x2100");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(report.messages.is_empty());

        // Spend is not rolled back
        let snapshot = h.ledger.read().await.unwrap();
        assert_eq!(snapshot.balance(), 0);
        assert_eq!(snapshot.history[0].kind, HistoryType::CashuPurchase);
        assert_eq!(session.stage(), CheckoutStage::Failed);
    }

    #[tokio::test]
    async fn test_malformed_mint_maps_to_validation_failure() {
        let h = harness(
            ScriptedMint::new(vec![MintStep::Malformed]),
            RecordingPublisher::default(),
            None,
        );

        let mut session = shipped_session(product(ShippingType::Free), PaymentMethod::Lightning);
        let report = h.orchestrator.checkout(&mut session, None, &CancelSignal::never()).await;

        assert_eq!(
            report.outcome,
            CheckoutOutcome::InvoiceGenerationFailed(FailureReason::MintValidation)
        );
        assert_eq!(
            report.outcome.failure().unwrap().to_string(),
            "Failed to validate invoice, check your mint"
        );
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_session_fails_without_side_effects() {
        let h = harness(ScriptedMint::new(vec![]), RecordingPublisher::default(), None);

        let mut session = CheckoutSession::new(product(ShippingType::Free), 1).unwrap();
        session.choose_payment_method(PaymentMethod::Cashu).unwrap();

        let report = h.orchestrator.checkout(&mut session, None, &CancelSignal::never()).await;
        assert!(matches!(
            report.outcome,
            CheckoutOutcome::CashuPaymentFailed(FailureReason::InvalidOrder(_))
        ));
        assert_eq!(h.rates.lookups(), 0);
        assert_eq!(h.mint.calls().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_top_up_publishes_wallet_events() {
        let buyer_keys = Keys::generate();
        let h = harness(
            ScriptedMint::new(vec![MintStep::NotPaid, MintStep::Proofs(vec![proof("A", 16, "m1"), proof("A", 4, "m2")])]),
            RecordingPublisher::default(),
            Some(&buyer_keys),
        );

        let report = h.orchestrator.top_up(20, &CancelSignal::never()).await.unwrap();
        assert_eq!(report.received.amount, 20);

        let sync = report.wallet_sync.unwrap();
        assert!(sync.is_complete(), "{:?}", sync.errors);
        assert!(sync.deletion_event.is_none());

        let events = h.publisher.events();
        let kinds: Vec<u16> = events.iter().map(|e| e.kind.as_u16()).collect();
        assert_eq!(kinds, vec![7375, 7376, 37375]);
        assert!(events.iter().all(|e| e.pubkey == buyer_keys.public_key()));

        let history = nostr::nips::nip44::decrypt(
            buyer_keys.secret_key(),
            &buyer_keys.public_key(),
            &events[1].content,
        )
        .unwrap();
        assert!(history.contains(r#"["direction","in"]"#));

        let snapshot = h.ledger.read().await.unwrap();
        assert_eq!(snapshot.balance(), 20);
        assert_eq!(snapshot.proof_events.get("m1"), Some(&events[0].id.to_hex()));
    }

    #[tokio::test]
    async fn test_top_up_without_wallet_sync() {
        let h = harness(
            ScriptedMint::new(vec![MintStep::Proofs(vec![proof("A", 8, "m1")])]),
            RecordingPublisher::default(),
            None,
        );

        let report = h.orchestrator.top_up(8, &CancelSignal::never()).await.unwrap();
        assert!(report.wallet_sync.is_none());
        assert!(h.publisher.events().is_empty());
        assert_eq!(h.ledger.read().await.unwrap().balance(), 8);
    }

    #[tokio::test]
    async fn test_rate_failure_falls_back_when_enabled() {
        let mut h = harness(ScriptedMint::new(vec![]), RecordingPublisher::default(), None);
        h.orchestrator.unconverted_price_fallback = true;
        fund(&h.ledger, vec![proof("A", 50, "s1")]).await;

        let mut product = product(ShippingType::Free);
        product.price = 21.0;
        product.currency = "EUR".to_string();
        let mut session = shipped_session(product, PaymentMethod::Cashu);

        let report = h.orchestrator.checkout(&mut session, None, &CancelSignal::never()).await;

        assert_eq!(report.outcome, CheckoutOutcome::CashuPaymentSent);
        assert_eq!(report.amount, Some(21));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].source, "fiat-rate");
    }
}
