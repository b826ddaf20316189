// Checkout state and the wallet, relay and messaging plumbing behind it

pub mod cashu;
pub mod checkout;
pub mod gift_wrap;
pub mod nostr_client;
pub mod nwc_store;
pub mod settings_store;

#[cfg(test)]
pub mod test_support;
