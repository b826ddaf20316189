//! Mint settlement engine
//!
//! Turns an order total into a token the seller can redeem, either by minting
//! against a lightning invoice the buyer pays or by spending proofs from the
//! local ledger.
//!
//! Invoice polling retries forever at a fixed interval. It only stops on
//! success, on an error that says the mint's answer has the wrong shape, or
//! when the caller cancels through its [`PollHandle`].

use std::sync::Arc;

use qrcode::{render::svg, QrCode};
use tokio::sync::watch;

use super::errors::{CashuResult, CashuWalletError, NonFatal};
use super::keyset::{partition_by_keysets, summarize_by_keyset};
use super::ledger::{apply_send, TokenLedger};
use super::mint::MintConnector;
use super::types::{
    MintQuoteInfo, PaymentMethod, ProofData, ReceivedPayment, SettledPayment, SettlementState,
};
use super::utils::{checked_sum_proofs, normalize_mint_url, sum_proofs};
use crate::stores::nwc_store::InvoicePayer;
use crate::stores::settings_store::CheckoutSettings;
use crate::utils::format::format_sats;
use crate::utils::time::{now_secs, sleep_ms};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

// =============================================================================
// Cancellation
// =============================================================================

/// Held by the UI to abort a stuck invoice poll
#[derive(Debug)]
pub struct PollHandle {
    tx: watch::Sender<bool>,
}

impl PollHandle {
    pub fn cancel(&self) {
        log::info!("Settlement cancelled by user");
        let _ = self.tx.send(true);
    }
}

/// Observed by the engine between poll attempts
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal nobody can fire
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the value at false forever
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called; pends forever otherwise
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked handle/signal pair
pub fn cancel_pair() -> (PollHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (PollHandle { tx }, CancelSignal { rx })
}

/// Sleep that wakes early with `Cancelled`
async fn cancellable_sleep(ms: u64, cancel: &CancelSignal) -> CashuResult<()> {
    let mut cancel = cancel.clone();
    tokio::select! {
        _ = sleep_ms(ms) => Ok(()),
        _ = cancel.cancelled() => Err(CashuWalletError::Cancelled),
    }
}

// =============================================================================
// Observers
// =============================================================================

/// Progress callbacks for whoever renders the checkout
pub trait SettlementObserver: Send + Sync {
    fn on_state(&self, _state: &SettlementState) {}

    /// A lightning invoice is ready to be shown; `qr_svg` is absent if
    /// rendering failed
    fn on_invoice(&self, _quote: &MintQuoteInfo, _qr_svg: Option<&str>) {}

    /// The invoice is no longer payable or no longer needed
    fn on_invoice_cleared(&self) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SettlementObserver for NoopObserver {}

/// Render a payment request as an SVG QR code
pub fn invoice_qr_svg(data: &str) -> Result<String, String> {
    let code = QrCode::new(data.to_uppercase().as_bytes())
        .map_err(|e| format!("Failed to generate QR code: {}", e))?;

    Ok(code
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

// =============================================================================
// Engine
// =============================================================================

/// Drives one payment per call; holds no per-order state
pub struct SettlementEngine {
    mint: Arc<dyn MintConnector>,
    ledger: Arc<TokenLedger>,
    payer: Option<Arc<dyn InvoicePayer>>,
    observer: Arc<dyn SettlementObserver>,
    poll_interval_ms: u64,
    auto_pay: bool,
}

impl SettlementEngine {
    pub fn new(mint: Arc<dyn MintConnector>, ledger: Arc<TokenLedger>) -> Self {
        Self {
            mint,
            ledger,
            payer: None,
            observer: Arc::new(NoopObserver),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            auto_pay: true,
        }
    }

    pub fn from_settings(
        mint: Arc<dyn MintConnector>,
        ledger: Arc<TokenLedger>,
        settings: &CheckoutSettings,
    ) -> Self {
        Self::new(mint, ledger)
            .with_poll_interval_ms(settings.poll_interval_ms)
            .with_auto_pay(settings.auto_pay)
    }

    pub fn with_payer(mut self, payer: Arc<dyn InvoicePayer>) -> Self {
        self.payer = Some(payer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SettlementObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_auto_pay(mut self, auto_pay: bool) -> Self {
        self.auto_pay = auto_pay;
        self
    }

    pub fn mint_url(&self) -> String {
        normalize_mint_url(&self.mint.mint_url())
    }

    pub fn ledger(&self) -> &Arc<TokenLedger> {
        &self.ledger
    }

    /// Settle `amount` sats with the chosen method
    pub async fn settle(
        &self,
        method: PaymentMethod,
        amount: u64,
        cancel: &CancelSignal,
    ) -> CashuResult<SettledPayment> {
        self.observer.on_state(&SettlementState::Idle);

        let result = match method {
            PaymentMethod::Lightning => self.settle_lightning(amount, cancel).await,
            PaymentMethod::Cashu => self.settle_cashu(amount).await,
        };

        match &result {
            Ok(_) => self.observer.on_state(&SettlementState::Settled),
            Err(e) => {
                log::error!("Settlement failed: {}", e);
                self.observer.on_state(&SettlementState::Failed {
                    error: e.to_string(),
                });
            }
        }

        result
    }

    /// Lightning path: invoice, optional auto-pay, poll, encode
    async fn settle_lightning(&self, amount: u64, cancel: &CancelSignal) -> CashuResult<SettledPayment> {
        let quote = self.request_invoice(amount).await?;

        let minted = self.await_invoice(&quote, cancel).await;
        self.observer.on_invoice_cleared();
        let minted = minted?;

        let token = self.mint.encode_token(&minted)?;
        log::info!(
            "Minted {} for the seller ({} proofs, token length {})",
            format_sats(sum_proofs(&minted)),
            minted.len(),
            token.len()
        );

        Ok(SettledPayment {
            method: PaymentMethod::Lightning,
            mint_url: self.mint_url(),
            amount,
            token,
            sent_proofs: minted,
            kept_proofs: Vec::new(),
            spent_event_ids: Vec::new(),
        })
    }

    /// Direct transfer path: spend ledger proofs recognized by the mint
    ///
    /// The ledger stays locked from the proof read until the new proof set is
    /// written, so two checkouts in one process never present the same proofs.
    async fn settle_cashu(&self, amount: u64) -> CashuResult<SettledPayment> {
        if amount == 0 {
            return Err(CashuWalletError::InvalidAmount { amount });
        }

        let mint_url = self.mint_url();
        let mut txn = self.ledger.begin().await?;

        let keysets = self.mint.get_keysets().await?;
        let partition = partition_by_keysets(&txn.snapshot().proofs, &keysets);

        log::info!(
            "Cashu payment of {} from {}: {} candidate proofs, {} left untouched",
            format_sats(amount),
            mint_url,
            partition.candidates.len(),
            partition.untouched.len()
        );
        for (keyset, count, value) in summarize_by_keyset(&partition.candidates) {
            log::debug!("  keyset {}: {} proofs, {} sats", keyset, count, value);
        }

        if partition.candidates.is_empty() {
            return Err(CashuWalletError::NoSpendableProofs);
        }

        let available = checked_sum_proofs(&partition.candidates)
            .ok_or_else(|| CashuWalletError::Internal("Proof amounts overflow".to_string()))?;
        if available < amount {
            return Err(CashuWalletError::InsufficientFunds {
                available,
                required: amount,
            });
        }

        let split = self.mint.send(amount, &partition.candidates, true).await?;

        // The mint has consumed the candidates from here on; the token is the
        // only copy of the sent value.
        let token = self.mint.encode_token(&split.send)?;

        let spent_event_ids = apply_send(txn.snapshot_mut(), &partition.candidates, &split);
        if let Err(e) = txn.commit() {
            log::error!("Failed to persist ledger after send, local proofs are stale: {}", e);
        }

        log::info!(
            "Token created: {} sent, {} kept, token length {}",
            format_sats(sum_proofs(&split.send)),
            format_sats(sum_proofs(&split.keep)),
            token.len()
        );

        Ok(SettledPayment {
            method: PaymentMethod::Cashu,
            mint_url,
            amount,
            token,
            sent_proofs: split.send,
            kept_proofs: split.keep,
            spent_event_ids,
        })
    }

    /// Mint `amount` sats into the local ledger (wallet top-up)
    pub async fn mint_to_wallet(&self, amount: u64, cancel: &CancelSignal) -> CashuResult<ReceivedPayment> {
        let quote = self.request_invoice(amount).await?;

        let minted = self.await_invoice(&quote, cancel).await;
        self.observer.on_invoice_cleared();
        let minted = match minted {
            Ok(minted) => minted,
            Err(e) => {
                self.observer.on_state(&SettlementState::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let mint_url = self.mint_url();
        let received = self
            .ledger
            .apply_receive(&mint_url, &minted, now_secs())
            .await?;

        self.observer.on_state(&SettlementState::Settled);
        log::info!("Wallet topped up with {}", format_sats(received));

        Ok(ReceivedPayment {
            mint_url,
            amount: received,
            proofs: minted,
        })
    }

    /// Request an invoice and publish it to the observer
    async fn request_invoice(&self, amount: u64) -> CashuResult<MintQuoteInfo> {
        if amount == 0 {
            return Err(CashuWalletError::InvalidAmount { amount });
        }

        let quote = self.mint.request_quote(amount).await?;
        self.observer.on_state(&SettlementState::InvoiceRequested {
            quote_id: quote.quote_id.clone(),
        });

        let qr = match invoice_qr_svg(&quote.invoice) {
            Ok(svg) => Some(svg),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        };
        self.observer.on_invoice(&quote, qr.as_deref());

        Ok(quote)
    }

    /// Optional auto-pay followed by the poll
    async fn await_invoice(&self, quote: &MintQuoteInfo, cancel: &CancelSignal) -> CashuResult<Vec<ProofData>> {
        if self.auto_pay {
            if let Err(e) = self.auto_pay(&quote.invoice).await {
                log::warn!("{}", e);
            }
        }

        self.poll_until_minted(quote.amount.max(1), &quote.quote_id, cancel)
            .await
    }

    /// Try the connected wallet; never blocks settlement
    pub async fn auto_pay(&self, invoice: &str) -> Result<String, NonFatal> {
        let payer = self
            .payer
            .as_ref()
            .ok_or_else(|| NonFatal::new("auto-pay", "no wallet connected"))?;

        if !payer.is_enabled() {
            payer
                .enable()
                .await
                .map_err(|e| NonFatal::new("auto-pay", e))?;
        }

        let preimage = payer
            .send_payment(invoice)
            .await
            .map_err(|e| NonFatal::new("auto-pay", e))?;

        log::info!("Invoice paid by connected wallet");
        Ok(preimage)
    }

    /// Poll the mint until the quote's proofs can be claimed
    ///
    /// Sleeps `poll_interval_ms` between attempts. There is no attempt limit.
    pub async fn poll_until_minted(
        &self,
        amount: u64,
        quote_id: &str,
        cancel: &CancelSignal,
    ) -> CashuResult<Vec<ProofData>> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                log::info!("Polling for quote {} cancelled", quote_id);
                return Err(CashuWalletError::Cancelled);
            }

            attempt = attempt.saturating_add(1);
            self.observer
                .on_state(&SettlementState::PollingForSettlement { attempt });

            match self.mint.mint_proofs(amount, quote_id).await {
                Ok(proofs) => {
                    log::info!("Quote {} settled after {} attempts", quote_id, attempt);
                    return Ok(proofs);
                }
                Err(e) if e.is_fatal_for_polling() => {
                    log::error!("Failed to validate invoice for quote {}: {}", quote_id, e);
                    return Err(e);
                }
                Err(e) => {
                    log::debug!("Quote {} not settled (attempt {}): {}", quote_id, attempt, e);
                }
            }

            cancellable_sleep(self.poll_interval_ms, cancel).await?;
        }
    }
}
