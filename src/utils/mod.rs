// Helper functions for common operations

pub mod format;
pub mod time;

pub use format::{format_sats, short_key};
