//! Cashu wallet data types
//!
//! All data structures shared by the ledger, the settlement engine and the
//! wallet publication sync.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Proof Types
// =============================================================================

/// A single bearer-token unit issued by a mint
///
/// Written with uppercase "C" as in NIP-60 events; lowercase is accepted on read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProofData {
    /// Keyset ID the proof was signed under
    pub id: String,
    pub amount: u64,
    pub secret: String,
    #[serde(rename = "C", alias = "c")]
    pub c: String,
}

/// Result of asking a mint to split proofs for a send
///
/// `keep` holds the untouched candidates plus any change issued by the mint;
/// `send` is what gets encoded into the token for the recipient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendSplit {
    pub keep: Vec<ProofData>,
    pub send: Vec<ProofData>,
}

// =============================================================================
// History Types
// =============================================================================

/// Numeric history row type, persisted as a bare integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum HistoryType {
    /// Lightning invoice minted into the wallet
    Mint = 1,
    /// Ecash sent out of the wallet
    Send = 2,
    /// Ecash token received into the wallet
    Receive = 3,
    /// Ecash melted to pay a lightning invoice
    Melt = 4,
    /// Marketplace purchase paid with ecash
    CashuPurchase = 5,
}

impl From<HistoryType> for u8 {
    fn from(value: HistoryType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for HistoryType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Mint),
            2 => Ok(Self::Send),
            3 => Ok(Self::Receive),
            4 => Ok(Self::Melt),
            5 => Ok(Self::CashuPurchase),
            other => Err(format!("Unknown history type: {}", other)),
        }
    }
}

/// One row of the local transaction log (most recent first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub kind: HistoryType,
    /// Amount in sats
    pub amount: u64,
    /// Unix seconds
    pub date: u64,
}

impl HistoryEntry {
    pub fn new(kind: HistoryType, amount: u64, date: u64) -> Self {
        Self { kind, amount, date }
    }
}

// =============================================================================
// Ledger Snapshot
// =============================================================================

/// Everything the local wallet cache holds
///
/// The mint is ground truth; this is a cache that may go stale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub mints: Vec<String>,
    pub proofs: Vec<ProofData>,
    pub history: Vec<HistoryEntry>,
    /// Proof secret -> id of the kind 7375 event currently holding it
    pub proof_events: HashMap<String, String>,
}

impl LedgerSnapshot {
    /// Sum of all locally held proof amounts
    pub fn balance(&self) -> u64 {
        super::utils::sum_proofs(&self.proofs)
    }

    /// Unique event IDs holding any of the given proofs
    pub fn event_ids_for_proofs(&self, proofs: &[ProofData]) -> Vec<String> {
        let mut event_ids: Vec<String> = proofs
            .iter()
            .filter_map(|p| self.proof_events.get(&p.secret).cloned())
            .collect();
        event_ids.sort();
        event_ids.dedup();
        event_ids
    }
}

// =============================================================================
// Quote Types
// =============================================================================

/// Mint quote information (lightning receive)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MintQuoteInfo {
    pub quote_id: String,
    /// BOLT11 payment request to show the payer
    pub invoice: String,
    pub amount: u64,
    pub expiry: Option<u64>,
    pub mint_url: String,
}

impl MintQuoteInfo {
    /// Create from CDK MintQuote response
    pub fn from_cdk(quote: &cdk::wallet::MintQuote, mint_url: String) -> Self {
        Self {
            quote_id: quote.id.clone(),
            invoice: quote.request.clone(),
            amount: quote.amount.map(u64::from).unwrap_or(0),
            expiry: Some(quote.expiry),
            mint_url,
        }
    }
}

// =============================================================================
// Settlement Types
// =============================================================================

/// How the buyer pays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Pay a mint-issued lightning invoice; the mint issues fresh proofs
    Lightning,
    /// Spend proofs already held in the local ledger
    Cashu,
}

/// Settlement engine progress, reported to observers
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementState {
    Idle,
    InvoiceRequested { quote_id: String },
    PollingForSettlement { attempt: u32 },
    Settled,
    Failed { error: String },
}

/// A completed payment, ready to be handed to the seller
#[derive(Debug, Clone, PartialEq)]
pub struct SettledPayment {
    pub method: PaymentMethod,
    pub mint_url: String,
    /// Amount charged to the buyer in sats
    pub amount: u64,
    /// Encoded cashu token for the seller
    pub token: String,
    /// Proofs encoded in `token`
    pub sent_proofs: Vec<ProofData>,
    /// Proofs retained locally for this mint after a direct transfer
    pub kept_proofs: Vec<ProofData>,
    /// Proof events whose contents were spent by this payment
    pub spent_event_ids: Vec<String>,
}

/// Proofs minted into the local wallet by a top-up
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPayment {
    pub mint_url: String,
    pub amount: u64,
    pub proofs: Vec<ProofData>,
}
