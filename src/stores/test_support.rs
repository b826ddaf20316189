//! In-crate collaborators for tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use nostr_sdk::Event;
use tokio::time::{Duration, Instant};

use super::cashu::errors::{CashuResult, CashuWalletError};
use super::cashu::mint::MintConnector;
use super::cashu::settlement::SettlementObserver;
use super::cashu::types::{MintQuoteInfo, ProofData, SendSplit, SettlementState};
use super::cashu::utils::sum_proofs;
use super::nostr_client::RelayPublisher;
use super::nwc_store::InvoicePayer;
use crate::services::fiat_rates::RateSource;

pub fn proof(id: &str, amount: u64, secret: &str) -> ProofData {
    ProofData {
        id: id.to_string(),
        amount,
        secret: secret.to_string(),
        c: format!("02{}", secret),
    }
}

// =============================================================================
// Mint
// =============================================================================

/// One scripted answer to `mint_proofs`
#[derive(Debug, Clone)]
pub enum MintStep {
    NotPaid,
    Malformed,
    Proofs(Vec<ProofData>),
}

#[derive(Debug, Clone, Default)]
pub struct MintCalls {
    pub quotes: u32,
    pub mint_attempts: u32,
    pub mint_attempt_times: Vec<Duration>,
    pub keyset_lookups: u32,
    /// (amount, candidates, include_fees)
    pub sends: Vec<(u64, Vec<ProofData>, bool)>,
}

impl MintCalls {
    pub fn total(&self) -> u32 {
        self.quotes + self.mint_attempts + self.keyset_lookups + self.sends.len() as u32
    }
}

pub struct ScriptedMint {
    mint_url: String,
    keysets: Vec<String>,
    steps: Mutex<VecDeque<MintStep>>,
    calls: Mutex<MintCalls>,
    started: Instant,
}

impl ScriptedMint {
    pub fn new(steps: Vec<MintStep>) -> Self {
        Self {
            mint_url: "https://mint.example.com".to_string(),
            keysets: vec!["A".to_string()],
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(MintCalls::default()),
            started: Instant::now(),
        }
    }

    pub fn with_keysets(mut self, keysets: &[&str]) -> Self {
        self.keysets = keysets.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn calls(&self) -> MintCalls {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MintConnector for ScriptedMint {
    fn mint_url(&self) -> String {
        self.mint_url.clone()
    }

    async fn request_quote(&self, amount: u64) -> CashuResult<MintQuoteInfo> {
        let mut calls = self.calls.lock().unwrap();
        calls.quotes += 1;
        Ok(MintQuoteInfo {
            quote_id: format!("quote-{}", calls.quotes),
            invoice: format!("lnbc{}n1ptestinvoice", amount * 10),
            amount,
            expiry: None,
            mint_url: self.mint_url.clone(),
        })
    }

    async fn mint_proofs(&self, _amount: u64, quote_id: &str) -> CashuResult<Vec<ProofData>> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.mint_attempts += 1;
            calls.mint_attempt_times.push(self.started.elapsed());
        }

        match self.steps.lock().unwrap().pop_front() {
            Some(MintStep::Proofs(proofs)) => Ok(proofs),
            Some(MintStep::Malformed) => Err(CashuWalletError::MalformedResponse(
                "missing field `signatures`".to_string(),
            )),
            Some(MintStep::NotPaid) | None => Err(CashuWalletError::QuoteUnpaid {
                quote_id: quote_id.to_string(),
            }),
        }
    }

    async fn get_keysets(&self) -> CashuResult<Vec<String>> {
        self.calls.lock().unwrap().keyset_lookups += 1;
        Ok(self.keysets.clone())
    }

    /// Greedy selection, no fee; change comes back as one proof
    async fn send(&self, amount: u64, proofs: &[ProofData], include_fees: bool) -> CashuResult<SendSplit> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.sends.push((amount, proofs.to_vec(), include_fees));
            calls.sends.len()
        };

        let mut selected = Vec::new();
        let mut keep = Vec::new();
        for p in proofs {
            if sum_proofs(&selected) < amount {
                selected.push(p.clone());
            } else {
                keep.push(p.clone());
            }
        }

        let total = sum_proofs(&selected);
        if total < amount {
            return Err(CashuWalletError::InsufficientFunds {
                available: total,
                required: amount,
            });
        }

        let keyset = selected[0].id.clone();
        if total > amount {
            keep.push(proof(&keyset, total - amount, &format!("change-{}", n)));
        }

        Ok(SendSplit {
            keep,
            send: vec![proof(&keyset, amount, &format!("sent-{}", n))],
        })
    }

    fn encode_token(&self, proofs: &[ProofData]) -> CashuResult<String> {
        Ok(format!("cashuBtest{}x{}", proofs.len(), sum_proofs(proofs)))
    }
}

// =============================================================================
// Relays
// =============================================================================

#[derive(Default)]
pub struct RecordingPublisher {
    rejecting: Vec<String>,
    accepted: Mutex<Vec<(String, Event)>>,
}

impl RecordingPublisher {
    pub fn rejecting(relays: &[&str]) -> Self {
        Self {
            rejecting: relays.iter().map(|r| r.to_string()).collect(),
            accepted: Mutex::new(Vec::new()),
        }
    }

    /// Accepted events, first acceptance only, in publish order
    pub fn events(&self) -> Vec<Event> {
        let mut seen = Vec::new();
        for (_, event) in self.accepted.lock().unwrap().iter() {
            if !seen.iter().any(|e: &Event| e.id == event.id) {
                seen.push(event.clone());
            }
        }
        seen
    }
}

#[async_trait]
impl RelayPublisher for RecordingPublisher {
    async fn publish_to(&self, relay_url: &str, event: &Event) -> Result<(), String> {
        if self.rejecting.iter().any(|r| r == relay_url) {
            return Err("blocked: test relay".to_string());
        }
        self.accepted
            .lock()
            .unwrap()
            .push((relay_url.to_string(), event.clone()));
        Ok(())
    }
}

// =============================================================================
// Wallet / rates / observer
// =============================================================================

pub struct ScriptedPayer {
    result: Result<String, String>,
    enabled: Mutex<bool>,
    invoices: Mutex<Vec<String>>,
}

impl ScriptedPayer {
    pub fn paying(preimage: &str) -> Self {
        Self {
            result: Ok(preimage.to_string()),
            enabled: Mutex::new(false),
            invoices: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            enabled: Mutex::new(false),
            invoices: Mutex::new(Vec::new()),
        }
    }

    pub fn invoices(&self) -> Vec<String> {
        self.invoices.lock().unwrap().clone()
    }
}

#[async_trait]
impl InvoicePayer for ScriptedPayer {
    async fn enable(&self) -> Result<(), String> {
        *self.enabled.lock().unwrap() = true;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    async fn send_payment(&self, invoice: &str) -> Result<String, String> {
        self.invoices.lock().unwrap().push(invoice.to_string());
        self.result.clone()
    }
}

/// BTC price per currency; missing currencies fail the lookup
#[derive(Default)]
pub struct FixedRates {
    rates: HashMap<String, f64>,
    lookups: Mutex<u32>,
}

impl FixedRates {
    pub fn new(rates: &[(&str, f64)]) -> Self {
        Self {
            rates: rates.iter().map(|(c, r)| (c.to_uppercase(), *r)).collect(),
            lookups: Mutex::new(0),
        }
    }

    pub fn lookups(&self) -> u32 {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl RateSource for FixedRates {
    async fn btc_price(&self, currency: &str) -> Result<f64, String> {
        *self.lookups.lock().unwrap() += 1;
        self.rates
            .get(&currency.to_uppercase())
            .copied()
            .ok_or_else(|| format!("no rate for {}", currency))
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    states: Mutex<Vec<SettlementState>>,
    invoices: Mutex<Vec<MintQuoteInfo>>,
    cleared: Mutex<u32>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<SettlementState> {
        self.states.lock().unwrap().clone()
    }

    pub fn invoices(&self) -> Vec<MintQuoteInfo> {
        self.invoices.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> u32 {
        *self.cleared.lock().unwrap()
    }
}

impl SettlementObserver for RecordingObserver {
    fn on_state(&self, state: &SettlementState) {
        self.states.lock().unwrap().push(state.clone());
    }

    fn on_invoice(&self, quote: &MintQuoteInfo, _qr_svg: Option<&str>) {
        self.invoices.lock().unwrap().push(quote.clone());
    }

    fn on_invoice_cleared(&self) {
        *self.cleared.lock().unwrap() += 1;
    }
}
