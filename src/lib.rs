//! Provider Fleet — orchestration and context search for a fleet of local
//! capability-provider processes.
//!
//! Each provider is a child process speaking JSON-RPC over stdio that
//! advertises tools, resources and prompts. The engine keeps every provider
//! under a supervisor with a restart policy, probes liveness on a timer,
//! aggregates the fleet's capabilities into one snapshot and answers keyword
//! queries against it. [`FleetHub`] ties the parts together.
//!
//! ```no_run
//! use provider_fleet::{load_fleet_config, ContextQuery, FleetHub};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_fleet_config(std::path::Path::new("fleet.yaml"))?;
//! let hub = FleetHub::from_config(config).await?;
//! for hit in hub.search(&ContextQuery::new("git status")) {
//!     println!("{} ({})", hit.item.name(), hit.score);
//! }
//! hub.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod fleet;
pub mod health;
pub mod hub;
pub mod protocol;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{load_fleet_config, ConfigError, FleetConfig, FleetSettings, ProviderConfig};
pub use context::{ContextAggregator, ContextQuery, ContextSummary, SearchResult};
pub use fleet::{
    EventBus, EventReceiver, FleetContextSnapshot, FleetError, FleetEvent, FleetManager,
    ProviderState, ProviderStatus, ProviderSupervisor,
};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use hub::FleetHub;
pub use telemetry::{init_tracing, TelemetryOptions};
