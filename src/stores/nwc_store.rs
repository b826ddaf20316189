//! Wallet auto-pay
//!
//! When the buyer has a lightning wallet connected, the checkout tries to pay
//! the mint's invoice without a QR round trip. Every failure here is
//! best-effort: the invoice stays on screen for manual payment.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nwc::prelude::*;

/// A lightning wallet the checkout can ask to pay an invoice
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait InvoicePayer: Send + Sync {
    /// Connect to the wallet, prompting if the provider needs it
    async fn enable(&self) -> Result<(), String>;

    /// Whether `enable` has succeeded
    fn is_enabled(&self) -> bool;

    /// Pay a BOLT11 invoice, returning the preimage
    async fn send_payment(&self, invoice: &str) -> Result<String, String>;
}

/// Nostr Wallet Connect backed payer
pub struct NwcInvoicePayer {
    uri: NostrWalletConnectURI,
    client: Mutex<Option<Arc<NWC>>>,
}

impl NwcInvoicePayer {
    pub fn new(uri: NostrWalletConnectURI) -> Self {
        Self {
            uri,
            client: Mutex::new(None),
        }
    }

    /// Parse a `nostr+walletconnect://` URI
    pub fn from_uri(uri_string: &str) -> Result<Self, String> {
        let uri = NostrWalletConnectURI::from_str(uri_string.trim())
            .map_err(|e| format!("Invalid NWC URI: {}", e))?;
        Ok(Self::new(uri))
    }

    fn connected_client(&self) -> Option<Arc<NWC>> {
        self.client.lock().ok().and_then(|guard| guard.clone())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl InvoicePayer for NwcInvoicePayer {
    async fn enable(&self) -> Result<(), String> {
        if self.is_enabled() {
            return Ok(());
        }

        let nwc = Arc::new(NWC::new(self.uri.clone()));

        // Test connection by getting wallet info
        let info = nwc.get_info().await.map_err(format_nwc_error)?;
        log::info!(
            "Connected to NWC wallet: {}",
            info.alias.as_deref().unwrap_or("Unknown")
        );

        let mut guard = self
            .client
            .lock()
            .map_err(|e| format!("NWC client lock poisoned: {}", e))?;
        *guard = Some(nwc);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.connected_client().is_some()
    }

    async fn send_payment(&self, invoice: &str) -> Result<String, String> {
        let client = self.connected_client().ok_or("NWC not connected")?;

        let response = client
            .pay_invoice(PayInvoiceRequest::new(invoice))
            .await
            .map_err(format_nwc_error)?;

        log::info!("NWC payment sent");
        Ok(response.preimage)
    }
}

/// Format NWC errors into user-friendly messages
fn format_nwc_error(error: nwc::Error) -> String {
    if let nwc::Error::NIP47(nip47_err) = error {
        return format!("{}", nip47_err);
    }
    format!("{}", error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_uri() {
        assert!(NwcInvoicePayer::from_uri("https://not-a-wallet").is_err());
    }

    #[test]
    fn test_new_payer_is_not_enabled() {
        let uri = "nostr+walletconnect://b889ff5b1513b641e2a139f661a661364979c5beee91842f8f0ef42ab558e9d4?relay=wss%3A%2F%2Frelay.damus.io&secret=71a8c14c1407c113601079c4302dab36460f0ccd0ad506f1f2dc73b5100e4f3c";
        let payer = NwcInvoicePayer::from_uri(uri).unwrap();
        assert!(!payer.is_enabled());
    }
}
