//! Checkout and settlement core for a Nostr marketplace
//!
//! Buyers pay with Cashu ecash, either minted fresh from a lightning invoice
//! or spent from the local wallet, and the seller is told about the order
//! through gift-wrapped messages.

// Modules
pub mod services;
pub mod stores;
pub mod utils;

pub use stores::checkout::{CheckoutOrchestrator, CheckoutOutcome, CheckoutSession};
pub use stores::settings_store::CheckoutSettings;

/// Browser console logging and panic messages
#[cfg(target_arch = "wasm32")]
pub fn init_logging() {
    console_error_panic_hook::set_once();
    // INFO keeps per-attempt polling and relay noise out of the console
    wasm_logger::init(wasm_logger::Config::new(log::Level::Info));
    log::info!("nostrmarket {} ready", env!("CARGO_PKG_VERSION"));
}
