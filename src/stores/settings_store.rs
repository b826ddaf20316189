//! Checkout configuration
//!
//! Every field has a default, so partial JSON (or none at all) yields a
//! working configuration.

use serde::{Deserialize, Serialize};

use super::nostr_client::{BROADCAST_RELAY, DEFAULT_RELAYS};

pub const DEFAULT_MINT_URL: &str = "https://mint.minibits.cash/Bitcoin";

/// LocalStorage key the browser build reads settings from
pub const SETTINGS_STORAGE_KEY: &str = "checkoutSettings";

fn default_mint_url() -> String {
    DEFAULT_MINT_URL.to_string()
}

fn default_write_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect()
}

fn default_broadcast_relay() -> String {
    BROADCAST_RELAY.to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_seal_timestamp_window_secs() -> u64 {
    48 * 60 * 60
}

fn default_wallet_id() -> String {
    "nostrmarket-wallet".to_string()
}

fn default_marketplace_name() -> String {
    "Nostr Market".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckoutSettings {
    /// Mint used for lightning settlement and ecash sends
    #[serde(default = "default_mint_url")]
    pub mint_url: String,
    #[serde(default = "default_write_relays")]
    pub write_relays: Vec<String>,
    /// Always added to the publish set
    #[serde(default = "default_broadcast_relay")]
    pub broadcast_relay: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_seal_timestamp_window_secs")]
    pub seal_timestamp_window_secs: u64,
    /// `d` tag of the NIP-60 wallet event
    #[serde(default = "default_wallet_id")]
    pub wallet_id: String,
    /// Named in the payment message to the seller
    #[serde(default = "default_marketplace_name")]
    pub marketplace_name: String,
    /// Try the connected wallet before showing the invoice
    #[serde(default = "default_true")]
    pub auto_pay: bool,
    /// Charge the listed fiat number as sats when the rate lookup fails
    #[serde(default)]
    pub unconverted_price_fallback: bool,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            mint_url: default_mint_url(),
            write_relays: default_write_relays(),
            broadcast_relay: default_broadcast_relay(),
            poll_interval_ms: default_poll_interval_ms(),
            seal_timestamp_window_secs: default_seal_timestamp_window_secs(),
            wallet_id: default_wallet_id(),
            marketplace_name: default_marketplace_name(),
            auto_pay: true,
            unconverted_price_fallback: false,
        }
    }
}

impl CheckoutSettings {
    /// Parse settings JSON; invalid input falls back to defaults
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str(json) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Invalid checkout settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Read settings from browser LocalStorage
    #[cfg(target_arch = "wasm32")]
    pub fn load() -> Self {
        use gloo_storage::{LocalStorage, Storage};

        match LocalStorage::get::<CheckoutSettings>(SETTINGS_STORAGE_KEY) {
            Ok(settings) => settings,
            Err(gloo_storage::errors::StorageError::KeyNotFound(_)) => Self::default(),
            Err(e) => {
                log::warn!("Failed to load checkout settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Persist settings to browser LocalStorage
    #[cfg(target_arch = "wasm32")]
    pub fn save(&self) -> Result<(), String> {
        use gloo_storage::{LocalStorage, Storage};

        LocalStorage::set(SETTINGS_STORAGE_KEY, self)
            .map_err(|e| format!("Failed to save checkout settings: {}", e))
    }
}
