//! podkit-tx: transaction confirmation and gas pricing.
//!
//! - [`PendingTransaction`]: polls (and optionally races a push stream) until a
//!   submitted transaction is confirmed, reverted or timed out
//! - [`GasPriceManager`]: cached gas price with single-flight refresh

pub mod gas;
pub mod pending;

pub use gas::{
    GasPriceConfig, GasPriceError, GasPriceManager, GasPriceSnapshot, GasPriceStrategy,
};
pub use pending::{PendingTransaction, TxError, TxOutcome, TxStatus};
