//! Fleet engine — supervisors, the fleet manager and the notification bus.
//!
//! This module handles:
//! - One lifecycle state machine per provider, with restart policy and
//!   periodic health probes
//! - The set of providers and its aggregated capability snapshot
//! - Broadcasting fleet notifications to independent subscribers

pub mod errors;
pub mod events;
pub mod manager;
pub mod supervisor;
pub mod types;

// Re-exports for convenience
pub use errors::FleetError;
pub use events::{EventBus, EventReceiver, FleetEvent};
pub use manager::FleetManager;
pub use supervisor::{ProviderSupervisor, SupervisorSettings};
pub use types::{
    CapabilityItem, CapabilityKind, FleetContextSnapshot, HealthCheckResult, Prompt,
    ProviderState, ProviderStatus, Resource, ResourceReadOutcome, ResourceReadRequest, Tool,
    ToolCallOutcome, ToolCallRequest,
};
