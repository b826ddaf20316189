//! Mint collaborator
//!
//! The settlement engine talks to a Cashu mint only through [`MintConnector`].
//! [`CdkMintConnector`] drives a CDK wallet; tests script their own.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cdk::amount::SplitTarget;
use cdk::cdk_database::{self, WalletDatabase};
use cdk::mint_url::MintUrl;
use cdk::nuts::{CurrencyUnit, ProofsMethods, State, Token};
use cdk::types::ProofInfo;
use cdk::wallet::{SendKind, SendOptions};
use cdk::{Amount, Wallet};

use super::errors::{CashuResult, CashuWalletError};
use super::types::{MintQuoteInfo, ProofData, SendSplit};
use super::utils::normalize_mint_url;
use crate::stores::settings_store::CheckoutSettings;

/// Operations the checkout needs from a mint
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait MintConnector: Send + Sync {
    /// Normalized URL of the mint
    fn mint_url(&self) -> String;

    /// Ask the mint for a lightning invoice covering `amount` sats
    async fn request_quote(&self, amount: u64) -> CashuResult<MintQuoteInfo>;

    /// Claim the proofs for a quote; fails until the invoice is paid
    async fn mint_proofs(&self, amount: u64, quote_id: &str) -> CashuResult<Vec<ProofData>>;

    /// Keyset IDs the mint currently signs with
    async fn get_keysets(&self) -> CashuResult<Vec<String>>;

    /// Split `proofs` into what to keep and what to send
    ///
    /// With `include_fees` the mint's input fee comes out of `send` and the
    /// recipient can redeem the full amount.
    async fn send(&self, amount: u64, proofs: &[ProofData], include_fees: bool) -> CashuResult<SendSplit>;

    /// Encode proofs of this mint as a transferable token string
    fn encode_token(&self, proofs: &[ProofData]) -> CashuResult<String>;
}

// =============================================================================
// Proof Conversion
// =============================================================================

/// Convert stored proof data into a CDK proof
pub fn proof_data_to_cdk_proof(data: &ProofData) -> CashuResult<cdk::nuts::Proof> {
    use cdk::nuts::{Id, Proof, PublicKey};
    use cdk::secret::Secret;

    let keyset_id = Id::from_str(&data.id).map_err(|e| CashuWalletError::InvalidToken {
        reason: format!("Invalid keyset ID '{}': {}", data.id, e),
    })?;

    let secret = Secret::from_str(&data.secret).map_err(|e| CashuWalletError::InvalidToken {
        reason: format!("Invalid secret: {}", e),
    })?;

    let c = PublicKey::from_hex(&data.c).map_err(|e| CashuWalletError::InvalidToken {
        reason: format!("Invalid C point: {}", e),
    })?;

    Ok(Proof {
        keyset_id,
        amount: Amount::from(data.amount),
        secret,
        c,
        witness: None,
        dleq: None,
    })
}

/// Convert a CDK proof into stored proof data
pub fn cdk_proof_to_proof_data(proof: &cdk::nuts::Proof) -> ProofData {
    ProofData {
        id: proof.keyset_id.to_string(),
        amount: u64::from(proof.amount),
        secret: proof.secret.to_string(),
        c: proof.c.to_hex(),
    }
}

fn parse_mint_url(mint_url: &str) -> CashuResult<MintUrl> {
    MintUrl::from_str(mint_url).map_err(|e| CashuWalletError::MintConnection {
        mint_url: mint_url.to_string(),
        message: format!("Invalid mint URL: {}", e),
    })
}

/// The settings' mint, normalized and checked
pub fn configured_mint_url(settings: &CheckoutSettings) -> CashuResult<String> {
    let mint_url = normalize_mint_url(&settings.mint_url);
    parse_mint_url(&mint_url)?;
    Ok(mint_url)
}

/// Encode proofs as a V4 token for `mint_url`
pub fn encode_token(mint_url: &str, proofs: &[ProofData]) -> CashuResult<String> {
    if proofs.is_empty() {
        return Err(CashuWalletError::InvalidToken {
            reason: "Cannot create token with no proofs".to_string(),
        });
    }

    let mint_url = parse_mint_url(&normalize_mint_url(mint_url))?;
    let cdk_proofs = proofs
        .iter()
        .map(proof_data_to_cdk_proof)
        .collect::<CashuResult<Vec<_>>>()?;

    let token = Token::new(mint_url, cdk_proofs.into(), None, CurrencyUnit::Sat);
    Ok(token.to_string())
}

// =============================================================================
// CDK Implementation
// =============================================================================

/// Mint connector backed by a CDK wallet
///
/// The wallet's local store is scratch space and holds nothing between calls.
/// Minted proofs are taken out of it as soon as `mint` returns, and a send
/// empties it before injecting the candidates and again after reading the
/// change back out.
pub struct CdkMintConnector {
    wallet: Arc<Wallet>,
    mint_url: String,
}

impl CdkMintConnector {
    pub fn new(wallet: Arc<Wallet>) -> Self {
        let mint_url = normalize_mint_url(&wallet.mint_url.to_string());
        Self { wallet, mint_url }
    }

    /// Connector for the configured mint
    pub fn from_settings(
        settings: &CheckoutSettings,
        localstore: Arc<dyn WalletDatabase<Err = cdk_database::Error> + Send + Sync>,
        seed: [u8; 64],
    ) -> CashuResult<Self> {
        let mint_url = configured_mint_url(settings)?;
        let wallet = Wallet::new(&mint_url, CurrencyUnit::Sat, localstore, seed, None)?;
        log::info!("Mint connector ready for {}", mint_url);
        Ok(Self::new(Arc::new(wallet)))
    }

    async fn inject_proofs(&self, proofs: &[ProofData]) -> CashuResult<()> {
        let mint_url = parse_mint_url(&self.mint_url)?;

        let proof_infos = proofs
            .iter()
            .map(|p| {
                let proof = proof_data_to_cdk_proof(p)?;
                ProofInfo::new(proof, mint_url.clone(), State::Unspent, CurrencyUnit::Sat)
                    .map_err(|e| CashuWalletError::Internal(format!("Failed to create proof info: {}", e)))
            })
            .collect::<CashuResult<Vec<_>>>()?;

        self.wallet
            .localstore
            .update_proofs(proof_infos, vec![])
            .await
            .map_err(|e| CashuWalletError::Storage(format!("Failed to inject proofs: {}", e)))
    }

    async fn remove_proofs(&self, ys: Vec<cdk::nuts::PublicKey>) -> CashuResult<()> {
        if ys.is_empty() {
            return Ok(());
        }
        self.wallet
            .localstore
            .update_proofs(vec![], ys)
            .await
            .map_err(|e| CashuWalletError::Storage(format!("Failed to clear wallet store: {}", e)))
    }

    /// Drop every proof from the store, in any state; returns their secrets
    async fn clear_store(&self) -> CashuResult<HashSet<String>> {
        let infos = self
            .wallet
            .localstore
            .get_proofs(None, None, None, None)
            .await
            .map_err(|e| CashuWalletError::Storage(format!("Failed to read wallet store: {}", e)))?;

        let secrets = infos.iter().map(|i| i.proof.secret.to_string()).collect();
        self.remove_proofs(infos.iter().map(|i| i.y).collect()).await?;
        Ok(secrets)
    }
}

/// What a send leaves the ledger with
///
/// Only unselected candidates and change issued by the mint qualify: proofs
/// that were in the store before the candidates went in, or that ended up in
/// the token, are dropped.
fn kept_after_send(
    unspent: Vec<ProofData>,
    candidates: &[ProofData],
    foreign: &HashSet<String>,
    sent: &[ProofData],
) -> Vec<ProofData> {
    unspent
        .into_iter()
        .filter(|p| {
            let candidate = candidates.iter().any(|c| c.secret == p.secret);
            let stray = foreign.contains(&p.secret) && !candidate;
            !stray && !sent.iter().any(|s| s.secret == p.secret)
        })
        .collect()
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl MintConnector for CdkMintConnector {
    fn mint_url(&self) -> String {
        self.mint_url.clone()
    }

    async fn request_quote(&self, amount: u64) -> CashuResult<MintQuoteInfo> {
        log::info!("Creating mint quote for {} sats at {}", amount, self.mint_url);

        let quote = self.wallet.mint_quote(Amount::from(amount), None).await?;

        log::info!("Mint quote created: {}", quote.id);
        Ok(MintQuoteInfo::from_cdk(&quote, self.mint_url.clone()))
    }

    async fn mint_proofs(&self, amount: u64, quote_id: &str) -> CashuResult<Vec<ProofData>> {
        let proofs = self
            .wallet
            .mint(quote_id, SplitTarget::default(), None)
            .await?;

        // CDK stores what it mints; these proofs belong to the caller
        let ys = proofs
            .ys()
            .map_err(|e| CashuWalletError::Internal(format!("Failed to hash minted proofs: {}", e)))?;
        self.remove_proofs(ys).await?;

        let minted: Vec<ProofData> = proofs.iter().map(cdk_proof_to_proof_data).collect();
        let total = super::utils::sum_proofs(&minted);
        if total < amount {
            log::warn!("Mint issued {} sats for a {} sat quote", total, amount);
        }

        log::info!("Mint succeeded, received {} proofs", minted.len());
        Ok(minted)
    }

    async fn get_keysets(&self) -> CashuResult<Vec<String>> {
        let keysets = self.wallet.get_mint_keysets().await?;
        Ok(keysets
            .iter()
            .filter(|k| k.active)
            .map(|k| k.id.to_string())
            .collect())
    }

    async fn send(&self, amount: u64, proofs: &[ProofData], include_fees: bool) -> CashuResult<SendSplit> {
        let foreign = self.clear_store().await?;
        if !foreign.is_empty() {
            log::warn!("Discarded {} stray proofs from the wallet store", foreign.len());
        }
        self.inject_proofs(proofs).await?;

        let prepared = self
            .wallet
            .prepare_send(
                Amount::from(amount),
                SendOptions {
                    include_fee: include_fees,
                    send_kind: SendKind::OnlineTolerance(Amount::from(1)),
                    ..Default::default()
                },
            )
            .await?;

        log::info!("Prepared send of {} sats, fee {}", amount, u64::from(prepared.fee()));

        let token = prepared.confirm(None).await?;

        let keysets = self.wallet.get_mint_keysets().await?;
        let send: Vec<ProofData> = token
            .proofs(&keysets)
            .map_err(|e| CashuWalletError::InvalidToken {
                reason: format!("Failed to extract proofs from token: {}", e),
            })?
            .iter()
            .map(cdk_proof_to_proof_data)
            .collect();

        let unspent = self
            .wallet
            .get_unspent_proofs()
            .await?
            .iter()
            .map(cdk_proof_to_proof_data)
            .collect();
        let keep = kept_after_send(unspent, proofs, &foreign, &send);

        if let Err(e) = self.clear_store().await {
            log::warn!("Wallet store not cleared after send: {}", e);
        }

        Ok(SendSplit { keep, send })
    }

    fn encode_token(&self, proofs: &[ProofData]) -> CashuResult<String> {
        encode_token(&self.mint_url, proofs)
    }
}
