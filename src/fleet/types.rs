//! Fleet data model: provider status, capability items, snapshots.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{PromptArgument, PromptInfo, ProviderCapabilities, ResourceInfo, ServerInfo, ToolInfo};

// ─── Provider Status ─────────────────────────────────────────────────────────

/// Lifecycle state of a supervised provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    #[default]
    Stopped,
    Starting,
    Running,
    /// Startup failed.
    Error,
    /// The process exited unexpectedly while running.
    Crashed,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderState::Stopped => "stopped",
            ProviderState::Starting => "starting",
            ProviderState::Running => "running",
            ProviderState::Error => "error",
            ProviderState::Crashed => "crashed",
        }
    }

    /// Starting or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, ProviderState::Starting | ProviderState::Running)
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of one provider's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub state: ProviderState,
    pub last_error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub connected_at: Option<DateTime<Utc>>,
    pub capabilities: ProviderCapabilities,
    pub server_info: Option<ServerInfo>,
}

impl ProviderStatus {
    /// Initial status: Stopped, never connected.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: ProviderState::Stopped,
            last_error: None,
            last_seen: None,
            restart_count: 0,
            connected_at: None,
            capabilities: ProviderCapabilities::default(),
            server_info: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProviderState::Running
    }
}

// ─── Capability Items ────────────────────────────────────────────────────────

/// The three capability families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tool,
        CapabilityKind::Resource,
        CapabilityKind::Prompt,
    ];
}

/// An invokable tool offered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub provider_id: String,
}

impl Tool {
    pub fn from_info(provider_id: &str, info: ToolInfo) -> Self {
        Self {
            name: info.name,
            description: info.description,
            input_schema: info.input_schema,
            provider_id: provider_id.to_string(),
        }
    }
}

/// A readable resource offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub provider_id: String,
}

impl Resource {
    pub fn from_info(provider_id: &str, info: ResourceInfo) -> Self {
        Self {
            uri: info.uri,
            name: info.name,
            description: info.description,
            mime_type: info.mime_type,
            provider_id: provider_id.to_string(),
        }
    }
}

/// A prompt template offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    pub provider_id: String,
}

impl Prompt {
    pub fn from_info(provider_id: &str, info: PromptInfo) -> Self {
        Self {
            name: info.name,
            description: info.description,
            arguments: info.arguments,
            provider_id: provider_id.to_string(),
        }
    }
}

/// Any one capability item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapabilityItem {
    Tool(Tool),
    Resource(Resource),
    Prompt(Prompt),
}

impl CapabilityItem {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            CapabilityItem::Tool(_) => CapabilityKind::Tool,
            CapabilityItem::Resource(_) => CapabilityKind::Resource,
            CapabilityItem::Prompt(_) => CapabilityKind::Prompt,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CapabilityItem::Tool(t) => &t.name,
            CapabilityItem::Resource(r) => &r.name,
            CapabilityItem::Prompt(p) => &p.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            CapabilityItem::Tool(t) => Some(t.description.as_str()),
            CapabilityItem::Resource(r) => r.description.as_deref(),
            CapabilityItem::Prompt(p) => p.description.as_deref(),
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            CapabilityItem::Tool(t) => &t.provider_id,
            CapabilityItem::Resource(r) => &r.provider_id,
            CapabilityItem::Prompt(p) => &p.provider_id,
        }
    }

    /// Name for tools and prompts, uri for resources.
    pub fn identity_key(&self) -> &str {
        match self {
            CapabilityItem::Resource(r) => &r.uri,
            other => other.name(),
        }
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Immutable aggregation of fleet capabilities and statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetContextSnapshot {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
    pub providers: Vec<ProviderStatus>,
    pub timestamp: DateTime<Utc>,
}

impl FleetContextSnapshot {
    /// Build a snapshot, dropping later duplicates of an identity key.
    pub fn new(
        providers: Vec<ProviderStatus>,
        tools: Vec<Tool>,
        resources: Vec<Resource>,
        prompts: Vec<Prompt>,
    ) -> Self {
        Self {
            tools: dedupe(tools, |t| (t.name.clone(), t.provider_id.clone())),
            resources: dedupe(resources, |r| (r.uri.clone(), r.provider_id.clone())),
            prompts: dedupe(prompts, |p| (p.name.clone(), p.provider_id.clone())),
            providers,
            timestamp: Utc::now(),
        }
    }

    /// A snapshot with no providers.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderStatus> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Whether the provider was Running when the snapshot was taken.
    pub fn is_running(&self, id: &str) -> bool {
        self.provider(id).is_some_and(ProviderStatus::is_running)
    }

    pub fn item_count(&self) -> usize {
        self.tools.len() + self.resources.len() + self.prompts.len()
    }
}

impl Default for FleetContextSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

fn dedupe<T>(items: Vec<T>, key: impl Fn(&T) -> (String, String)) -> Vec<T> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(key(item))).collect()
}

// ─── Health Checks ───────────────────────────────────────────────────────────

/// Outcome of one liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub provider_id: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn success(provider_id: &str, response_time_ms: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            healthy: true,
            response_time_ms,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(provider_id: &str, response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            healthy: false,
            response_time_ms,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

// ─── Calls ───────────────────────────────────────────────────────────────────

/// Invoke `tool_name` on `provider_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub provider_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Structured result of a tool call. Failures never surface as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    pub success: bool,
    pub content: serde_json::Value,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolCallOutcome {
    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            content: serde_json::Value::Null,
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

/// Read `uri` from `provider_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReadRequest {
    pub provider_id: String,
    pub uri: String,
}

/// Structured result of a resource read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReadOutcome {
    pub success: bool,
    pub contents: serde_json::Value,
    pub error: Option<String>,
}

impl ResourceReadOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            contents: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, owner: &str, description: &str) -> Tool {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            provider_id: owner.into(),
        }
    }

    #[test]
    fn test_snapshot_drops_later_duplicates() {
        let snapshot = FleetContextSnapshot::new(
            vec![],
            vec![
                tool("search", "web", "first"),
                tool("search", "web", "second"),
                tool("search", "docs", "other owner"),
            ],
            vec![],
            vec![],
        );
        assert_eq!(snapshot.tools.len(), 2);
        assert_eq!(snapshot.tools[0].description, "first");
        assert_eq!(snapshot.tools[1].provider_id, "docs");
    }

    #[test]
    fn test_resource_identity_is_uri() {
        let resource = |uri: &str, name: &str| Resource {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
            provider_id: "fs".into(),
        };
        let snapshot = FleetContextSnapshot::new(
            vec![],
            vec![],
            vec![resource("file:///a", "same"), resource("file:///b", "same")],
            vec![],
        );
        assert_eq!(snapshot.resources.len(), 2);

        let item = CapabilityItem::Resource(resource("file:///a", "a"));
        assert_eq!(item.identity_key(), "file:///a");
        assert_eq!(item.kind(), CapabilityKind::Resource);
    }

    #[test]
    fn test_snapshot_running_lookup() {
        let mut running = ProviderStatus::new("fs");
        running.state = ProviderState::Running;
        let snapshot = FleetContextSnapshot::new(
            vec![running, ProviderStatus::new("git")],
            vec![],
            vec![],
            vec![],
        );
        assert!(snapshot.is_running("fs"));
        assert!(!snapshot.is_running("git"));
        assert!(!snapshot.is_running("missing"));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ProviderStatus::new("fs");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["restartCount"], 0);
        assert!(json.get("lastError").is_some());
    }
}
