//! Client-side sync layer for environmental telemetry.
//!
//! Readings come from one of two REST backends ([`ApiVariant`]), are mapped to
//! a single [`Reading`] shape by the [`normalize`] module, and are exposed
//! through a [`TelemetryStore`] that keeps the last-known snapshot in a local
//! [`SnapshotCache`] so it survives restarts and network loss.
//!
//! ```no_run
//! use telemetry_sync::{ApiClient, Config, SqliteCache, StoreSettings, TelemetryStore};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let client = ApiClient::from_config(&config)?;
//! let cache = SqliteCache::open(&config.cache_path)?;
//! let store = TelemetryStore::new(client, cache, StoreSettings::from_config(&config));
//!
//! store.start().await;
//! println!("{:?}", store.snapshot().latest);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod mock;
pub mod net;
pub mod normalize;
pub mod source;
pub mod state;
pub mod storage;
pub mod store;
pub mod types;
pub mod variant;

pub use config::Config;
pub use error::{CacheError, Error, Result};
pub use mock::MockSource;
pub use net::ApiClient;
pub use source::TelemetrySource;
pub use state::{SnapshotReceiver, TelemetrySnapshot};
pub use storage::{MemoryCache, SnapshotCache, SqliteCache};
pub use store::{StoreSettings, TelemetryStore};
pub use types::{DateRange, LightState, Reading, ReadingPayload, SortOrder, TelemetryFilter};
pub use variant::{ApiVariant, Backend, LatestStrategy};
