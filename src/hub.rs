//! Fleet hub — the caller-facing facade.
//!
//! Wires one bus, one fleet manager, one health monitor and one context
//! aggregator together and exposes the operations a host needs.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{FleetConfig, FleetSettings, ProviderConfig};
use crate::context::{ContextAggregator, ContextQuery, ContextSummary, SearchResult};
use crate::fleet::{
    EventBus, EventReceiver, FleetContextSnapshot, FleetError, FleetManager, ProviderStatus,
    ResourceReadOutcome, ResourceReadRequest, ToolCallOutcome, ToolCallRequest,
};
use crate::health::{HealthMonitor, HealthReport, HealthStatus};
use crate::protocol::{ClientFactory, ClientTimeouts, StdioClientFactory};

/// Everything a host talks to.
pub struct FleetHub {
    bus: EventBus,
    manager: FleetManager,
    health: HealthMonitor,
    context: ContextAggregator,
}

impl FleetHub {
    /// A hub spawning real provider processes over stdio.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: FleetSettings) -> Self {
        let factory = StdioClientFactory::new(ClientTimeouts::from(&settings));
        Self::with_factory(settings, Arc::new(factory))
    }

    /// A hub using `factory` to build provider clients.
    pub fn with_factory(settings: FleetSettings, factory: Arc<dyn ClientFactory>) -> Self {
        let bus = EventBus::with_capacity(settings.event_capacity);

        let health = HealthMonitor::new();
        health.attach(&bus);
        let context = ContextAggregator::new(settings.search_limit);
        context.attach(&bus);
        let manager = FleetManager::new(settings, factory, bus.clone());

        Self {
            bus,
            manager,
            health,
            context,
        }
    }

    /// A stdio hub with every configured provider added.
    pub async fn from_config(config: FleetConfig) -> Result<Self, FleetError> {
        let factory = StdioClientFactory::new(ClientTimeouts::from(&config.settings));
        Self::from_config_with_factory(config, Arc::new(factory)).await
    }

    pub async fn from_config_with_factory(
        config: FleetConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self, FleetError> {
        let hub = Self::with_factory(config.settings, factory);
        for provider in config.providers {
            hub.add_provider(provider).await?;
        }
        Ok(hub)
    }

    pub fn manager(&self) -> &FleetManager {
        &self.manager
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn context(&self) -> &ContextAggregator {
        &self.context
    }

    /// Subscribe to fleet notifications.
    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    // ── Providers ────────────────────────────────────────────────────────────

    pub async fn add_provider(&self, config: ProviderConfig) -> Result<(), FleetError> {
        self.manager.add_provider(config).await
    }

    pub async fn remove_provider(&self, id: &str) -> bool {
        self.manager.remove_provider(id).await
    }

    pub async fn start_provider(&self, id: &str) -> Result<(), FleetError> {
        self.manager.start_provider(id).await
    }

    pub async fn stop_provider(&self, id: &str) -> Result<(), FleetError> {
        self.manager.stop_provider(id).await
    }

    pub async fn restart_provider(&self, id: &str) -> Result<(), FleetError> {
        self.manager.restart_provider(id).await
    }

    pub async fn start_all(&self) -> Vec<(String, FleetError)> {
        self.manager.start_all().await
    }

    pub async fn stop_all(&self) {
        self.manager.stop_all().await;
    }

    pub async fn get_server_status(&self, id: &str) -> Option<ProviderStatus> {
        self.manager.get_server_status(id).await
    }

    pub async fn get_server_statuses(&self) -> Vec<ProviderStatus> {
        self.manager.get_server_statuses().await
    }

    // ── Context ──────────────────────────────────────────────────────────────

    /// The most recently published fleet snapshot.
    pub fn get_aggregated_context(&self) -> Arc<FleetContextSnapshot> {
        self.manager.latest_snapshot()
    }

    pub fn search(&self, query: &ContextQuery) -> Vec<SearchResult> {
        self.context.search(query)
    }

    pub fn get_context_summary(&self) -> ContextSummary {
        self.context.get_context_summary()
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Invoke a tool. Every failure comes back as an unsuccessful outcome.
    pub async fn call_tool(&self, request: ToolCallRequest) -> ToolCallOutcome {
        let started = Instant::now();
        let elapsed_ms = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let Some(supervisor) = self.manager.get_supervisor(&request.provider_id).await else {
            let err = FleetError::NotFound {
                id: request.provider_id,
            };
            return ToolCallOutcome::failed(err.to_string(), elapsed_ms());
        };

        let arguments = if request.arguments.is_null() {
            serde_json::json!({})
        } else {
            request.arguments
        };
        match supervisor.call_tool(&request.tool_name, arguments).await {
            Ok(result) if result.is_error => {
                let text = result.text();
                let message = if text.is_empty() {
                    format!("tool '{}' reported an error", request.tool_name)
                } else {
                    text
                };
                tracing::debug!(
                    provider = %request.provider_id,
                    tool = %request.tool_name,
                    error = %message,
                    "tool call returned an error result"
                );
                ToolCallOutcome {
                    success: false,
                    content: serde_json::Value::Array(result.content),
                    error: Some(message),
                    execution_time_ms: elapsed_ms(),
                }
            }
            Ok(result) => ToolCallOutcome {
                success: true,
                content: serde_json::Value::Array(result.content),
                error: None,
                execution_time_ms: elapsed_ms(),
            },
            Err(e) => {
                tracing::warn!(
                    provider = %request.provider_id,
                    tool = %request.tool_name,
                    error = %e,
                    "tool call failed"
                );
                ToolCallOutcome::failed(e.to_string(), elapsed_ms())
            }
        }
    }

    /// Read a resource. Every failure comes back as an unsuccessful outcome.
    pub async fn read_resource(&self, request: ResourceReadRequest) -> ResourceReadOutcome {
        let Some(supervisor) = self.manager.get_supervisor(&request.provider_id).await else {
            let err = FleetError::NotFound {
                id: request.provider_id,
            };
            return ResourceReadOutcome::failed(err.to_string());
        };

        match supervisor.read_resource(&request.uri).await {
            Ok(result) => ResourceReadOutcome {
                success: true,
                contents: serde_json::Value::Array(result.contents),
                error: None,
            },
            Err(e) => {
                tracing::warn!(
                    provider = %request.provider_id,
                    uri = %request.uri,
                    error = %e,
                    "resource read failed"
                );
                ResourceReadOutcome::failed(e.to_string())
            }
        }
    }

    // ── Health ───────────────────────────────────────────────────────────────

    pub fn get_health_report(&self) -> HealthReport {
        self.health.generate_health_report()
    }

    pub fn get_server_health_summary(&self, id: &str) -> HealthStatus {
        self.health.get_server_health_summary(id)
    }

    pub fn is_server_healthy(&self, id: &str) -> bool {
        self.health.is_server_healthy(id)
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Best-effort stop of every provider, then detach the listeners.
    pub async fn cleanup(&self) {
        tracing::info!("fleet cleanup started");
        self.manager.shutdown().await;
        self.health.detach();
        self.context.detach();
        tracing::info!("fleet cleanup complete");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
