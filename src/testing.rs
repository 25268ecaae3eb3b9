//! In-memory capability providers for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{FleetSettings, ProviderConfig};
use crate::protocol::{
    CallToolResult, CapabilityClient, ClientFactory, ConnectInfo, ExitNotifier, ExitSignal,
    ProcessExit, PromptInfo, ProtocolError, ProviderCapabilities, ReadResourceResult,
    ResourceInfo, ServerInfo, ToolInfo,
};

/// Settings with short delays so restart paths finish quickly.
pub(crate) fn fast_settings() -> FleetSettings {
    FleetSettings {
        restart_delay_ms: 20,
        request_timeout_ms: 1_000,
        init_timeout_ms: 1_000,
        shutdown_timeout_ms: 100,
        health_check_timeout_ms: 200,
        ..FleetSettings::default()
    }
}

/// A provider config with health probing disabled.
pub(crate) fn mock_config(id: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new(id, "mock-provider");
    config.health_check_interval_ms = 0;
    config
}

pub(crate) fn tool_info(name: &str, description: &str) -> ToolInfo {
    ToolInfo {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: serde_json::json!({"type": "object"}),
    }
}

pub(crate) fn resource_info(uri: &str, name: &str, description: Option<&str>) -> ResourceInfo {
    ResourceInfo {
        uri: uri.to_string(),
        name: name.to_string(),
        description: description.map(str::to_string),
        mime_type: None,
    }
}

pub(crate) fn prompt_info(name: &str, description: &str) -> PromptInfo {
    PromptInfo {
        name: name.to_string(),
        description: Some(description.to_string()),
        arguments: Vec::new(),
    }
}

/// Poll `condition` every 5ms for up to 2s.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ─── Mock Provider ───────────────────────────────────────────────────────────

/// Scripted behavior shared by every client created for one provider id.
pub(crate) struct MockProvider {
    capabilities: Mutex<ProviderCapabilities>,
    tools: Mutex<Vec<ToolInfo>>,
    resources: Mutex<Vec<ResourceInfo>>,
    prompts: Mutex<Vec<PromptInfo>>,
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
    fail_ping: AtomicBool,
    fail_list: AtomicBool,
    fail_tool: AtomicBool,
    exit_after_connect: Mutex<Option<ProcessExit>>,
    notifier: Mutex<Option<ExitNotifier>>,
    connects: AtomicU32,
    closes: AtomicU32,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            capabilities: Mutex::new(ProviderCapabilities {
                tools: true,
                resources: true,
                prompts: true,
                logging: false,
            }),
            tools: Mutex::new(vec![tool_info("echo", "Echo the input back")]),
            resources: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            fail_tool: AtomicBool::new(false),
            exit_after_connect: Mutex::new(None),
            notifier: Mutex::new(None),
            connects: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        }
    }

    pub(crate) fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn set_capabilities(&self, capabilities: ProviderCapabilities) {
        *self.capabilities.lock().unwrap() = capabilities;
    }

    pub(crate) fn set_tools(&self, tools: Vec<ToolInfo>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub(crate) fn set_resources(&self, resources: Vec<ResourceInfo>) {
        *self.resources.lock().unwrap() = resources;
    }

    pub(crate) fn set_prompts(&self, prompts: Vec<PromptInfo>) {
        *self.prompts.lock().unwrap() = prompts;
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_tool(&self, fail: bool) {
        self.fail_tool.store(fail, Ordering::SeqCst);
    }

    /// Make every connected process exit right after the handshake.
    pub(crate) fn set_exit_after_connect(&self, exit: Option<ProcessExit>) {
        *self.exit_after_connect.lock().unwrap() = exit;
    }

    /// Simulate the current process exiting.
    pub(crate) fn exit(&self, exit: ProcessExit) {
        if let Some(notifier) = self.take_exit_notifier() {
            notifier.notify(exit);
        }
    }

    /// Take the current process's exit notifier without firing it.
    pub(crate) fn take_exit_notifier(&self) -> Option<ExitNotifier> {
        self.notifier.lock().unwrap().take()
    }
}

// ─── Mock Factory ────────────────────────────────────────────────────────────

/// Hands out [`MockClient`]s backed by one [`MockProvider`] per id.
pub(crate) struct MockFactory {
    providers: Mutex<HashMap<String, Arc<MockProvider>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            providers: Mutex::new(HashMap::new()),
        })
    }

    /// The scripted provider for `id`, created on first use.
    pub(crate) fn provider(&self, id: &str) -> Arc<MockProvider> {
        self.providers
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MockProvider::new()))
            .clone()
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, config: &ProviderConfig) -> Arc<dyn CapabilityClient> {
        Arc::new(MockClient {
            id: config.id.clone(),
            provider: self.provider(&config.id),
            connected: AtomicBool::new(false),
        })
    }
}

// ─── Mock Client ─────────────────────────────────────────────────────────────

struct MockClient {
    id: String,
    provider: Arc<MockProvider>,
    connected: AtomicBool,
}

impl MockClient {
    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected {
                provider: self.id.clone(),
            })
        }
    }

    fn list_guard(&self) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        if self.provider.fail_list.load(Ordering::SeqCst) {
            return Err(ProtocolError::ServerError {
                code: -32603,
                message: "listing failed".into(),
                data: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CapabilityClient for MockClient {
    async fn connect(&self) -> Result<ConnectInfo, ProtocolError> {
        self.provider.connects.fetch_add(1, Ordering::SeqCst);
        if self.provider.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::InitFailed {
                provider: self.id.clone(),
                reason: "scripted connect failure".into(),
            });
        }

        let (notifier, exit) = ExitSignal::channel();
        match *self.provider.exit_after_connect.lock().unwrap() {
            Some(code) => notifier.notify(code),
            None => *self.provider.notifier.lock().unwrap() = Some(notifier),
        }
        self.connected.store(true, Ordering::SeqCst);

        Ok(ConnectInfo {
            capabilities: *self.provider.capabilities.lock().unwrap(),
            server_info: Some(ServerInfo {
                name: Some(format!("{}-server", self.id)),
                version: Some("1.0.0".into()),
            }),
            exit,
        })
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.provider.closes.fetch_add(1, Ordering::SeqCst);
        self.provider.exit(ProcessExit::with_code(0));
        if self.provider.fail_close.load(Ordering::SeqCst) {
            return Err(ProtocolError::TransportError {
                provider: self.id.clone(),
                reason: "scripted close failure".into(),
            });
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ProtocolError> {
        self.list_guard()?;
        Ok(self.provider.tools.lock().unwrap().clone())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>, ProtocolError> {
        self.list_guard()?;
        Ok(self.provider.resources.lock().unwrap().clone())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptInfo>, ProtocolError> {
        self.list_guard()?;
        Ok(self.provider.prompts.lock().unwrap().clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, ProtocolError> {
        self.ensure_connected()?;
        if self.provider.fail_tool.load(Ordering::SeqCst) {
            return Ok(CallToolResult {
                content: vec![serde_json::json!({"type": "text", "text": format!("{name} failed")})],
                is_error: true,
            });
        }
        Ok(CallToolResult {
            content: vec![serde_json::json!({"type": "text", "text": format!("{name}: {arguments}")})],
            is_error: false,
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ProtocolError> {
        self.ensure_connected()?;
        Ok(ReadResourceResult {
            contents: vec![serde_json::json!({"uri": uri, "text": format!("contents of {uri}")})],
        })
    }

    async fn ping(&self) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        if self.provider.fail_ping.load(Ordering::SeqCst) {
            return Err(ProtocolError::ServerError {
                code: -32603,
                message: "ping failed".into(),
                data: None,
            });
        }
        Ok(())
    }
}
