//! Cashu ecash wallet
//!
//! Holds the local token ledger and settles marketplace payments against a
//! mint:
//! - Token ledger with serialized read-modify-write transactions
//! - Lightning settlement (mint quote + polling) and direct ecash sends
//! - Keyset filtering so only proofs the mint still honours are spent
//! - NIP-60 publication of proofs, history and wallet state

pub mod errors;
pub mod events;
pub mod keyset;
pub mod ledger;
pub mod mint;
pub mod settlement;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use errors::{CashuResult, CashuWalletError, NonFatal};
pub use events::{SyncReport, WalletSync};
pub use ledger::{LedgerStore, MemoryLedgerStore, TokenLedger};
pub use mint::{CdkMintConnector, MintConnector};
pub use settlement::{cancel_pair, CancelSignal, PollHandle, SettlementEngine, SettlementObserver};
pub use types::*;
pub use utils::normalize_mint_url;
