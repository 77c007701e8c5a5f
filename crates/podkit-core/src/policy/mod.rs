//! Pure timing policies: receipt polling and connection reconnects.

pub mod polling;
pub mod reconnect;

pub use polling::{has_timed_out, jittered, next_delay, PollingConfig, PollingOverrides};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
