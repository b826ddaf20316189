pub mod fiat_rates;
