//! Common utilities and types shared across leasehold

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{AdminConfig, Config, ElectionConfig, StoreConfig};
pub use error::{Error, Result, TransientKind};
pub use metrics::MetricsRegistry;
pub use utils::{parse_duration, resolve_host, validate_key};
