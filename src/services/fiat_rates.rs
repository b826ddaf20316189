//! Currency normalization
//!
//! Listings are priced in sats, BTC or a fiat currency. Everything is turned
//! into whole sats before a mint is contacted.

use async_trait::async_trait;
use serde::Deserialize;

use crate::stores::cashu::errors::NonFatal;

pub const SATS_PER_BTC: f64 = 100_000_000.0;

pub const ALBY_RATES_URL: &str = "https://getalby.com/api/rates";

/// Spot price lookup
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait RateSource: Send + Sync {
    /// Price of one BTC in `currency`
    async fn btc_price(&self, currency: &str) -> Result<f64, String>;
}

#[derive(Debug, Deserialize)]
struct AlbyRate {
    rate_float: f64,
}

/// Rates from the Alby public API
#[derive(Debug, Clone)]
pub struct AlbyRateSource {
    base_url: String,
}

impl Default for AlbyRateSource {
    fn default() -> Self {
        Self::new(ALBY_RATES_URL)
    }
}

impl AlbyRateSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RateSource for AlbyRateSource {
    async fn btc_price(&self, currency: &str) -> Result<f64, String> {
        let url = format!("{}/{}.json", self.base_url, currency.to_lowercase());

        let response = reqwest::get(&url)
            .await
            .map_err(|e| format!("Fetch error: {}", e))?;

        let rate: AlbyRate = response
            .json()
            .await
            .map_err(|e| format!("Parse error: {}", e))?;

        if !rate.rate_float.is_finite() || rate.rate_float <= 0.0 {
            return Err(format!("Unusable rate for {}: {}", currency, rate.rate_float));
        }

        Ok(rate.rate_float)
    }
}

/// Why a price could not be charged
#[derive(Debug, Clone, PartialEq)]
pub enum PriceError {
    InvalidPrice(f64),
    BelowOneSat { amount: f64, currency: String },
    RateUnavailable { currency: String, reason: String },
}

impl std::fmt::Display for PriceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPrice(amount) => write!(f, "Invalid price: {}", amount),
            Self::BelowOneSat { amount, currency } => {
                write!(f, "Price {} {} is less than 1 sat", amount, currency)
            }
            Self::RateUnavailable { currency, reason } => {
                write!(f, "No exchange rate for {}: {}", currency, reason)
            }
        }
    }
}

impl std::error::Error for PriceError {}

/// A price converted to sats
#[derive(Debug, Clone, PartialEq)]
pub struct SatsAmount {
    pub sats: u64,
    /// Set when the rate lookup failed and the listed number was used as-is
    pub fallback: Option<NonFatal>,
}

fn is_sats(currency: &str) -> bool {
    matches!(currency.to_lowercase().as_str(), "sat" | "sats" | "satoshi" | "satoshis")
}

/// Convert `amount` in `currency` to whole sats, rounding to nearest
///
/// With `unconverted_fallback`, a failed rate lookup charges `amount` as if
/// it were already sats instead of failing.
pub async fn to_sats(
    amount: f64,
    currency: &str,
    rates: &dyn RateSource,
    unconverted_fallback: bool,
) -> Result<SatsAmount, PriceError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(PriceError::InvalidPrice(amount));
    }

    let mut fallback = None;

    let sats = if is_sats(currency) {
        amount
    } else if currency.eq_ignore_ascii_case("btc") {
        amount * SATS_PER_BTC
    } else {
        match rates.btc_price(currency).await {
            Ok(price) => amount / price * SATS_PER_BTC,
            Err(reason) if unconverted_fallback => {
                let nonfatal = NonFatal::new("fiat-rate", reason);
                log::warn!("{}; charging {} {} as sats", nonfatal, amount, currency);
                fallback = Some(nonfatal);
                amount
            }
            Err(reason) => {
                log::error!("Rate lookup for {} failed: {}", currency, reason);
                return Err(PriceError::RateUnavailable {
                    currency: currency.to_string(),
                    reason,
                });
            }
        }
    };

    let sats = sats.round();
    // 2^64 is the first value that no longer fits
    if !sats.is_finite() || sats >= u64::MAX as f64 {
        return Err(PriceError::InvalidPrice(amount));
    }
    if sats < 1.0 {
        return Err(PriceError::BelowOneSat {
            amount,
            currency: currency.to_string(),
        });
    }

    Ok(SatsAmount {
        sats: sats as u64,
        fallback,
    })
}
