//! Capability protocol client — one channel to one spawned provider.
//!
//! [`CapabilityClient`] is the seam the fleet engine talks through. The stdio
//! implementation speaks line-delimited JSON-RPC to a child process; tests
//! substitute in-memory doubles via [`ClientFactory`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::config::{FleetSettings, ProviderConfig};

use super::errors::ProtocolError;
use super::process::{self, ChildProcess, ExitSignal};
use super::transport::StdioTransport;
use super::types::{
    CallToolResult, InitializeResult, PromptInfo, ProviderCapabilities, ReadResourceResult,
    ResourceInfo, ServerInfo, ToolInfo, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on pages followed for one listing call.
const MAX_LIST_PAGES: usize = 100;

// ─── Client Seam ─────────────────────────────────────────────────────────────

/// What a successful `connect` negotiated.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub capabilities: ProviderCapabilities,
    pub server_info: Option<ServerInfo>,
    /// Resolves when the provider process exits.
    pub exit: ExitSignal,
}

/// A channel to one capability provider. Any call may fail.
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    /// Spawn the provider, open the channel, and negotiate capabilities.
    async fn connect(&self) -> Result<ConnectInfo, ProtocolError>;

    /// Close the channel and stop the process. Closing twice is a no-op.
    async fn close(&self) -> Result<(), ProtocolError>;

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ProtocolError>;

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>, ProtocolError>;

    async fn list_prompts(&self) -> Result<Vec<PromptInfo>, ProtocolError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, ProtocolError>;

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ProtocolError>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), ProtocolError>;
}

/// Builds a fresh client for every start of a provider.
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &ProviderConfig) -> Arc<dyn CapabilityClient>;
}

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Time limits applied by the stdio client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Per-request limit for every call after the handshake.
    pub request: Duration,
    /// Limit for the `initialize` handshake.
    ///
    /// Generous by default: providers that load large frameworks at startup
    /// can take tens of seconds to answer.
    pub init: Duration,
    /// Grace period between closing stdin and killing the process.
    pub shutdown: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self::from(&FleetSettings::default())
    }
}

impl From<&FleetSettings> for ClientTimeouts {
    fn from(settings: &FleetSettings) -> Self {
        Self {
            request: settings.request_timeout(),
            init: settings.init_timeout(),
            shutdown: settings.shutdown_timeout(),
        }
    }
}

// ─── Stdio Client ────────────────────────────────────────────────────────────

/// An open session: the process plus its transport.
struct Session {
    process: ChildProcess,
    transport: StdioTransport,
}

/// JSON-RPC client for a provider spawned as a child process.
pub struct StdioCapabilityClient {
    config: ProviderConfig,
    timeouts: ClientTimeouts,
    session: Mutex<Option<Arc<Session>>>,
}

impl StdioCapabilityClient {
    /// Create a client for `config`. Nothing is spawned until `connect`.
    pub fn new(config: ProviderConfig, timeouts: ClientTimeouts) -> Self {
        Self {
            config,
            timeouts,
            session: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Arc<Session>, ProtocolError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| ProtocolError::NotConnected {
                provider: self.config.id.clone(),
            })
    }

    /// Perform the `initialize` handshake followed by `notifications/initialized`.
    async fn initialize(&self, transport: &StdioTransport) -> Result<InitializeResult, ProtocolError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = transport.call("initialize", Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| ProtocolError::InitFailed {
                provider: self.config.id.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        transport.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    /// Collect every page of a `*/list` method.
    async fn list_all<T: DeserializeOwned>(
        &self,
        method: &str,
        field: &str,
    ) -> Result<Vec<T>, ProtocolError> {
        let session = self.session().await?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let mut page = session.transport.call(method, params).await?;

            let entries = page
                .get_mut(field)
                .map(serde_json::Value::take)
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
            let batch: Vec<T> =
                serde_json::from_value(entries).map_err(|e| ProtocolError::InvalidResponse {
                    provider: self.config.id.clone(),
                    method: method.to_string(),
                    reason: e.to_string(),
                })?;
            items.extend(batch);

            let next = page
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            match next {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        tracing::warn!(
            provider = %self.config.id,
            method,
            pages = MAX_LIST_PAGES,
            "listing truncated at page limit"
        );
        Ok(items)
    }

    fn parse<T: DeserializeOwned>(&self, method: &str, value: serde_json::Value) -> Result<T, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidResponse {
            provider: self.config.id.clone(),
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CapabilityClient for StdioCapabilityClient {
    async fn connect(&self) -> Result<ConnectInfo, ProtocolError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(ProtocolError::TransportError {
                provider: self.config.id.clone(),
                reason: "already connected".into(),
            });
        }

        let (process, pipes) = process::spawn_provider(&self.config)?;
        let transport = StdioTransport::new(
            &self.config.id,
            pipes.stdin,
            pipes.stdout,
            self.timeouts.request,
        );

        let init = match tokio::time::timeout(self.timeouts.init, self.initialize(&transport)).await {
            Ok(Ok(init)) => init,
            outcome => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => format!(
                        "initialization timed out after {}s",
                        self.timeouts.init.as_secs()
                    ),
                };
                transport.close_stdin().await;
                if let Err(e) = process.shutdown(Duration::ZERO).await {
                    tracing::warn!(provider = %self.config.id, error = %e, "failed to stop provider after handshake failure");
                }
                let stderr = process.stderr().as_suffix();
                if !stderr.is_empty() {
                    tracing::warn!(
                        provider = %self.config.id,
                        stderr = %stderr,
                        "provider stderr captured on failure"
                    );
                }
                return Err(ProtocolError::InitFailed {
                    provider: self.config.id.clone(),
                    reason: format!("{reason}{stderr}"),
                });
            }
        };

        let info = ConnectInfo {
            capabilities: ProviderCapabilities::from_value(&init.capabilities),
            server_info: init.server_info,
            exit: process.exit_signal(),
        };

        tracing::debug!(
            provider = %self.config.id,
            pid = ?process.pid(),
            protocol_version = init.protocol_version.as_deref().unwrap_or("unknown"),
            "provider handshake complete"
        );

        *slot = Some(Arc::new(Session { process, transport }));
        Ok(info)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Ok(());
        };

        session.transport.close_stdin().await;
        let exit = session.process.shutdown(self.timeouts.shutdown).await?;
        tracing::debug!(provider = %self.config.id, exit = %exit, "provider channel closed");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ProtocolError> {
        self.list_all("tools/list", "tools").await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>, ProtocolError> {
        self.list_all("resources/list", "resources").await
    }

    async fn list_prompts(&self) -> Result<Vec<PromptInfo>, ProtocolError> {
        self.list_all("prompts/list", "prompts").await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, ProtocolError> {
        let session = self.session().await?;
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = session.transport.call("tools/call", Some(params)).await?;
        self.parse("tools/call", result)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ProtocolError> {
        let session = self.session().await?;
        let params = serde_json::json!({ "uri": uri });
        let result = session.transport.call("resources/read", Some(params)).await?;
        self.parse("resources/read", result)
    }

    async fn ping(&self) -> Result<(), ProtocolError> {
        let session = self.session().await?;
        session.transport.call("ping", None).await.map(|_| ())
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Default factory: one [`StdioCapabilityClient`] per start.
#[derive(Debug, Clone, Default)]
pub struct StdioClientFactory {
    timeouts: ClientTimeouts,
}

impl StdioClientFactory {
    pub fn new(timeouts: ClientTimeouts) -> Self {
        Self { timeouts }
    }
}

impl ClientFactory for StdioClientFactory {
    fn create(&self, config: &ProviderConfig) -> Arc<dyn CapabilityClient> {
        Arc::new(StdioCapabilityClient::new(config.clone(), self.timeouts))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
