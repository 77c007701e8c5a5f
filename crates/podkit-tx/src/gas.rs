//! Gas price manager: cached snapshot, single-flight refresh, bounded staleness.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use podkit_core::config::{GasMode, GasSettings};
use podkit_core::{GasPriceSource, TransportError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(12_000);
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_millis(60_000);

/// Where prices come from.
#[derive(Clone)]
pub enum GasPriceStrategy {
    /// Always this value; never touches the network.
    Fixed(u128),
    Fetched(Arc<dyn GasPriceSource>),
    /// Fetched price scaled by `multiplier_percent / 100`.
    FetchedWithMultiplier {
        source: Arc<dyn GasPriceSource>,
        multiplier_percent: u32,
    },
}

impl GasPriceStrategy {
    /// Build from config; `source` backs every non-fixed mode.
    pub fn from_mode(mode: GasMode, source: Arc<dyn GasPriceSource>) -> Self {
        match mode {
            GasMode::Fixed { price_wei } => Self::Fixed(u128::from(price_wei)),
            GasMode::Fetched => Self::Fetched(source),
            GasMode::FetchedWithMultiplier { multiplier_percent } => Self::FetchedWithMultiplier {
                source,
                multiplier_percent,
            },
        }
    }
}

impl std::fmt::Debug for GasPriceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(v) => f.debug_tuple("Fixed").field(v).finish(),
            Self::Fetched(_) => f.write_str("Fetched"),
            Self::FetchedWithMultiplier {
                multiplier_percent, ..
            } => f
                .debug_struct("FetchedWithMultiplier")
                .field("multiplier_percent", multiplier_percent)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceConfig {
    /// Snapshot lifetime. Zero fetches on every call.
    pub refresh_interval: Duration,
    /// Oldest snapshot still served when a refresh fails.
    pub max_staleness: Duration,
    /// Served when the source fails and no snapshot is usable.
    pub fallback_price: Option<u128>,
}

impl Default for GasPriceConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_staleness: DEFAULT_MAX_STALENESS,
            fallback_price: None,
        }
    }
}

impl From<&GasSettings> for GasPriceConfig {
    fn from(s: &GasSettings) -> Self {
        Self {
            refresh_interval: Duration::from_millis(s.refresh_interval_ms),
            max_staleness: Duration::from_millis(s.max_staleness_ms),
            fallback_price: s.fallback_price_wei.map(u128::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceSnapshot {
    pub value: u128,
    pub fetched_at: Instant,
}

#[derive(Debug, Clone, Error)]
pub enum GasPriceError {
    #[error("gas price unavailable: {source}")]
    Unavailable {
        #[source]
        source: TransportError,
    },
}

/// Resolves to the fetched price and the instant the fetch completed.
type Refresh = Shared<BoxFuture<'static, Result<(u128, Instant), TransportError>>>;

#[derive(Default)]
struct State {
    snapshot: Option<GasPriceSnapshot>,
    snapshot_generation: u64,
    inflight: Option<(u64, Refresh)>,
    generation: u64,
}

/// Serves gas prices to concurrent callers with at most one fetch in flight.
pub struct GasPriceManager {
    strategy: GasPriceStrategy,
    config: GasPriceConfig,
    state: Mutex<State>,
}

impl GasPriceManager {
    pub fn new(strategy: GasPriceStrategy, config: GasPriceConfig) -> Self {
        Self {
            strategy,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn fixed(price: u128) -> Self {
        Self::new(GasPriceStrategy::Fixed(price), GasPriceConfig::default())
    }

    pub fn fetched(source: Arc<dyn GasPriceSource>) -> Self {
        Self::new(GasPriceStrategy::Fetched(source), GasPriceConfig::default())
    }

    pub fn strategy(&self) -> &GasPriceStrategy {
        &self.strategy
    }

    pub fn config(&self) -> &GasPriceConfig {
        &self.config
    }

    /// The current snapshot, fresh or not.
    pub fn snapshot(&self) -> Option<GasPriceSnapshot> {
        self.lock().snapshot
    }

    /// Drop the cached snapshot so the next call refreshes.
    pub fn clear_cache(&self) {
        self.lock().snapshot = None;
        debug!("gas price cache cleared");
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current gas price in wei.
    ///
    /// Returns the snapshot while it is younger than `refresh_interval`.
    /// Otherwise joins (or starts) the single in-flight refresh. If that
    /// fails, falls back to a snapshot younger than `max_staleness`, then to
    /// `fallback_price`, then errors.
    pub async fn get_price(&self) -> Result<u128, GasPriceError> {
        let (source, multiplier_percent) = match &self.strategy {
            GasPriceStrategy::Fixed(value) => return Ok(*value),
            GasPriceStrategy::Fetched(source) => (source, 100),
            GasPriceStrategy::FetchedWithMultiplier {
                source,
                multiplier_percent,
            } => (source, *multiplier_percent),
        };

        let (generation, refresh) = {
            let mut state = self.lock();
            if let Some(snapshot) = state.snapshot {
                if snapshot.fetched_at.elapsed() < self.config.refresh_interval {
                    return Ok(snapshot.value);
                }
            }
            match &state.inflight {
                Some((generation, refresh)) => (*generation, refresh.clone()),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let source = Arc::clone(source);
                    let refresh: Refresh = async move { source.gas_price().await.map(|v| (v, Instant::now())) }
                        .boxed()
                        .shared();
                    state.inflight = Some((generation, refresh.clone()));
                    debug!(generation, "refreshing gas price");
                    (generation, refresh)
                }
            }
        };

        let result = refresh.await;

        let mut state = self.lock();
        if matches!(&state.inflight, Some((g, _)) if *g == generation) {
            state.inflight = None;
        }

        match result {
            Ok((raw, fetched_at)) => {
                let value = scale(raw, multiplier_percent);
                if generation > state.snapshot_generation {
                    state.snapshot = Some(GasPriceSnapshot { value, fetched_at });
                    state.snapshot_generation = generation;
                    debug!(gas_price = value, "gas price refreshed");
                }
                Ok(value)
            }
            Err(source) => {
                if let Some(snapshot) = state.snapshot {
                    if snapshot.fetched_at.elapsed() < self.config.max_staleness {
                        warn!(error = %source, gas_price = snapshot.value, "gas price refresh failed, serving last snapshot");
                        return Ok(snapshot.value);
                    }
                }
                if let Some(fallback) = self.config.fallback_price {
                    warn!(error = %source, gas_price = fallback, "gas price refresh failed, using fallback");
                    return Ok(fallback);
                }
                warn!(error = %source, "gas price unavailable");
                Err(GasPriceError::Unavailable { source })
            }
        }
    }
}

fn scale(raw: u128, multiplier_percent: u32) -> u128 {
    if multiplier_percent == 100 {
        return raw;
    }
    raw.saturating_mul(u128::from(multiplier_percent)) / 100
}
