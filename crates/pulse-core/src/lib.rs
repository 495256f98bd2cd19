//! pulse-core: shared domain types for the Pulse metrics service.
//!
//! Everything that crosses a crate boundary lives here: the point and
//! rollup records, the metadata value model, batch validation, the
//! running-statistics accumulator, and the `pulse.toml` configuration.

pub mod config;
pub mod stats;
pub mod types;
pub mod validate;

pub use config::{ConfigError, PulseConfig};
pub use stats::StatsAccumulator;
pub use types::*;
pub use validate::{PointError, validate_metric_batch, validate_system_batch};
