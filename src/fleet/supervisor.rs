//! Provider supervisor: lifecycle state machine for one provider.
//!
//! Each supervisor owns its provider's client, status and background tasks:
//! - an exit watch that reacts to the process ending
//! - a periodic health probe
//! - at most one pending delayed restart
//!
//! State changes are serialized by a per-supervisor operation lock. Health
//! probes never take that lock, so a hung probe cannot stall stop or restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{FleetSettings, ProviderConfig};
use crate::protocol::{
    CallToolResult, CapabilityClient, ClientFactory, ExitSignal, ProcessExit, ReadResourceResult,
};

use super::errors::FleetError;
use super::events::{EventBus, FleetEvent};
use super::types::{HealthCheckResult, Prompt, ProviderState, ProviderStatus, Resource, Tool};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timing knobs a supervisor needs from the fleet settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Delay before an automatic restart.
    pub restart_delay: Duration,
    /// Limit for one health probe.
    pub health_check_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&FleetSettings::default())
    }
}

impl From<&FleetSettings> for SupervisorSettings {
    fn from(settings: &FleetSettings) -> Self {
        Self {
            restart_delay: settings.restart_delay(),
            health_check_timeout: settings.health_check_timeout(),
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Supervises one provider. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProviderSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProviderConfig,
    settings: SupervisorSettings,
    factory: Arc<dyn ClientFactory>,
    bus: EventBus,
    status: RwLock<ProviderStatus>,
    client: RwLock<Option<Arc<dyn CapabilityClient>>>,
    /// Serializes start/stop/restart and exit handling.
    op_lock: tokio::sync::Mutex<()>,
    /// Bumped on every start and stop; exit watches carry the value they
    /// were armed with and ignore exits of older processes.
    generation: AtomicU64,
    /// Bumped whenever a pending restart is cancelled.
    restart_epoch: AtomicU64,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    health: Option<JoinHandle<()>>,
    exit_watch: Option<JoinHandle<()>>,
    restart: Option<JoinHandle<()>>,
    auto_start: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.health.take(),
            self.exit_watch.take(),
            self.restart.take(),
            self.auto_start.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

impl ProviderSupervisor {
    /// Create a supervisor in the Stopped state. Nothing is spawned.
    pub fn new(
        config: ProviderConfig,
        settings: SupervisorSettings,
        factory: Arc<dyn ClientFactory>,
        bus: EventBus,
    ) -> Self {
        let status = ProviderStatus::new(&config.id);
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                factory,
                bus,
                status: RwLock::new(status),
                client: RwLock::new(None),
                op_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                restart_epoch: AtomicU64::new(0),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    /// Copy of the current status.
    pub fn status(&self) -> ProviderStatus {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ProviderState {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Whether a channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.client().is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Spawn, connect and negotiate. No-op while Starting or Running.
    ///
    /// A failure leaves the provider in Error and may schedule a restart; the
    /// error is returned to the caller as well.
    pub async fn start(&self) -> Result<(), FleetError> {
        let _guard = self.inner.op_lock.lock().await;
        if !self.state().is_active() {
            self.cancel_restart();
        }
        self.start_locked().await
    }

    /// Start in the background. A stop issued before the start runs cancels it.
    pub fn spawn_start(&self) {
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let supervisor = ProviderSupervisor::from_inner(inner);
            if let Err(e) = supervisor.start().await {
                tracing::warn!(provider = %supervisor.id(), error = %e, "auto-start failed");
            }
        });
        if let Some(previous) = self.tasks().auto_start.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel timers, close the channel and move to Stopped. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.inner.op_lock.lock().await;
        self.stop_locked().await;
    }

    /// Count a restart, then stop and start regardless of the current state.
    pub async fn restart(&self) -> Result<(), FleetError> {
        let _guard = self.inner.op_lock.lock().await;
        {
            let mut status = self.write_status();
            status.restart_count = status.restart_count.saturating_add(1);
        }
        self.stop_locked().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), FleetError> {
        let id = self.id().to_string();
        if self.state().is_active() {
            tracing::debug!(provider = %id, "start ignored, provider already active");
            return Ok(());
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_status(|s| s.state = ProviderState::Starting);
        tracing::info!(
            provider = %id,
            command = %self.inner.config.command,
            "starting provider"
        );

        let client = self.inner.factory.create(&self.inner.config);
        match client.connect().await {
            Ok(info) => {
                self.set_client(Some(Arc::clone(&client)));
                let now = Utc::now();
                let status = self.update_status(|s| {
                    s.state = ProviderState::Running;
                    s.last_error = None;
                    s.capabilities = info.capabilities;
                    s.server_info = info.server_info.clone();
                    s.connected_at = Some(now);
                    s.last_seen = Some(now);
                    s.clone()
                });
                self.inner.bus.publish(FleetEvent::Connected { id: id.clone() });
                self.arm_exit_watch(generation, info.exit);
                self.arm_health_timer();

                tracing::info!(
                    provider = %id,
                    server = info.server_info.as_ref().and_then(|s| s.name.as_deref()).unwrap_or("unknown"),
                    tools = status.capabilities.tools,
                    resources = status.capabilities.resources,
                    prompts = status.capabilities.prompts,
                    restart_count = status.restart_count,
                    "provider running"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    tracing::debug!(provider = %id, error = %close_err, "cleanup after failed start");
                }
                let err = FleetError::from_protocol(&id, e);
                tracing::error!(provider = %id, error = %err, "provider failed to start");
                self.handle_failure(ProviderState::Error, err.to_string());
                Err(err)
            }
        }
    }

    async fn stop_locked(&self) {
        let id = self.id().to_string();
        if let Some(handle) = self.tasks().auto_start.take() {
            handle.abort();
        }
        self.cancel_restart();
        self.abort_runtime_tasks();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let client = self.take_client();
        if client.is_none() && self.state() == ProviderState::Stopped {
            tracing::debug!(provider = %id, "stop ignored, provider already stopped");
            return;
        }

        if let Some(client) = client {
            if let Err(e) = client.close().await {
                tracing::warn!(provider = %id, error = %e, "error closing provider channel");
            }
        }

        self.update_status(|s| {
            s.state = ProviderState::Stopped;
            s.connected_at = None;
        });
        self.inner.bus.publish(FleetEvent::Disconnected { id: id.clone() });
        tracing::info!(provider = %id, "provider stopped");
    }

    /// Record a failure and apply the restart policy.
    fn handle_failure(&self, state: ProviderState, message: String) {
        let config = &self.inner.config;
        let (retry, attempt) = self.update_status(|s| {
            s.state = state;
            s.last_error = Some(message.clone());
            s.connected_at = None;
            let retry = config.restart_on_failure && s.restart_count < config.max_restarts;
            if retry {
                s.restart_count += 1;
            }
            (retry, s.restart_count)
        });
        self.inner.bus.publish(FleetEvent::ServerError {
            id: config.id.clone(),
            error: message,
        });

        if retry {
            tracing::info!(
                provider = %config.id,
                attempt,
                max = config.max_restarts,
                delay_ms = self.inner.settings.restart_delay.as_millis() as u64,
                "scheduling restart"
            );
            self.schedule_restart();
        } else if config.restart_on_failure {
            tracing::warn!(
                provider = %config.id,
                restarts = attempt,
                state = %state,
                "restart limit reached, giving up"
            );
        }
    }

    fn schedule_restart(&self) {
        let epoch = self.inner.restart_epoch.load(Ordering::SeqCst);
        let delay = self.inner.settings.restart_delay;
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            ProviderSupervisor::from_inner(inner)
                .run_scheduled_restart(epoch)
                .await;
        });
        if let Some(previous) = self.tasks().restart.replace(handle) {
            previous.abort();
        }
    }

    fn run_scheduled_restart(self, epoch: u64) -> BoxFuture<'static, ()> {
        async move {
            let _guard = self.inner.op_lock.lock().await;
            if self.inner.restart_epoch.load(Ordering::SeqCst) != epoch {
                tracing::debug!(provider = %self.id(), "stale restart skipped");
                return;
            }
            // Detach our own handle; a failed start schedules a new one.
            drop(self.tasks().restart.take());
            if let Err(e) = self.start_locked().await {
                tracing::debug!(provider = %self.id(), error = %e, "scheduled restart failed");
            }
        }
        .boxed()
    }

    fn cancel_restart(&self) {
        self.inner.restart_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.tasks().restart.take() {
            handle.abort();
            tracing::debug!(provider = %self.id(), "pending restart cancelled");
        }
    }

    fn abort_runtime_tasks(&self) {
        let mut tasks = self.tasks();
        for handle in [tasks.health.take(), tasks.exit_watch.take()].into_iter().flatten() {
            handle.abort();
        }
    }

    // ── Process exit ─────────────────────────────────────────────────────────

    fn arm_exit_watch(&self, generation: u64, exit: ExitSignal) {
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            let exit = exit.wait().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            ProviderSupervisor::from_inner(inner)
                .on_process_exit(generation, exit)
                .await;
        });
        if let Some(previous) = self.tasks().exit_watch.replace(handle) {
            previous.abort();
        }
    }

    async fn on_process_exit(&self, generation: u64, exit: ProcessExit) {
        let _guard = self.inner.op_lock.lock().await;
        let id = self.id().to_string();
        if self.inner.generation.load(Ordering::SeqCst) != generation
            || self.state() != ProviderState::Running
        {
            tracing::debug!(provider = %id, exit = %exit, "ignoring exit of a retired process");
            return;
        }

        if let Some(handle) = self.tasks().health.take() {
            handle.abort();
        }
        if let Some(client) = self.take_client() {
            if let Err(e) = client.close().await {
                tracing::debug!(provider = %id, error = %e, "cleanup after process exit");
            }
        }

        if exit.is_clean() {
            tracing::info!(provider = %id, "provider process exited cleanly");
            self.update_status(|s| {
                s.state = ProviderState::Stopped;
                s.connected_at = None;
            });
        } else {
            tracing::warn!(provider = %id, exit = %exit, "provider process crashed");
            self.handle_failure(
                ProviderState::Crashed,
                format!("provider process exited unexpectedly ({exit})"),
            );
        }
        self.inner.bus.publish(FleetEvent::Disconnected { id });
    }

    // ── Health ───────────────────────────────────────────────────────────────

    fn arm_health_timer(&self) {
        let Some(period) = self.inner.config.health_check_interval() else {
            return;
        };
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let supervisor = ProviderSupervisor::from_inner(inner);
                if supervisor.state() == ProviderState::Running {
                    supervisor.perform_health_check().await;
                }
            }
        });
        if let Some(previous) = self.tasks().health.replace(handle) {
            previous.abort();
        }
    }

    /// Ping the provider, bounded by the probe timeout.
    ///
    /// Success refreshes `last_seen`; failure records the error and emits
    /// health-check-failed. Lifecycle state is never changed here.
    pub async fn perform_health_check(&self) -> HealthCheckResult {
        let id = self.id().to_string();
        let timeout = self.inner.settings.health_check_timeout;
        let started = Instant::now();

        let outcome = match self.client() {
            None => Err(FleetError::NotConnected { id: id.clone() }),
            Some(client) => match tokio::time::timeout(timeout, client.ping()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(FleetError::from_protocol(&id, e)),
                Err(_) => Err(FleetError::TransportFailure {
                    id: id.clone(),
                    reason: format!("health check timed out after {}ms", timeout.as_millis()),
                }),
            },
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(()) => {
                self.write_status().last_seen = Some(Utc::now());
                HealthCheckResult::success(&id, elapsed_ms)
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(provider = %id, error = %error, "health check failed");
                self.write_status().last_error = Some(error.clone());
                self.inner.bus.publish(FleetEvent::HealthCheckFailed {
                    id: id.clone(),
                    error: error.clone(),
                });
                HealthCheckResult::failure(&id, elapsed_ms, error)
            }
        };
        self.inner.bus.publish(FleetEvent::HealthCheck(result.clone()));
        result
    }

    // ── Pass-through ─────────────────────────────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<Tool>, FleetError> {
        let client = self.require_client()?;
        let tools = client.list_tools().await.map_err(|e| self.map_err(e))?;
        Ok(tools.into_iter().map(|t| Tool::from_info(self.id(), t)).collect())
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, FleetError> {
        let client = self.require_client()?;
        let resources = client.list_resources().await.map_err(|e| self.map_err(e))?;
        Ok(resources
            .into_iter()
            .map(|r| Resource::from_info(self.id(), r))
            .collect())
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, FleetError> {
        let client = self.require_client()?;
        let prompts = client.list_prompts().await.map_err(|e| self.map_err(e))?;
        Ok(prompts
            .into_iter()
            .map(|p| Prompt::from_info(self.id(), p))
            .collect())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, FleetError> {
        let client = self.require_client()?;
        client
            .call_tool(name, arguments)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, FleetError> {
        let client = self.require_client()?;
        client.read_resource(uri).await.map_err(|e| self.map_err(e))
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn map_err(&self, err: crate::protocol::ProtocolError) -> FleetError {
        FleetError::from_protocol(self.id(), err)
    }

    fn client(&self) -> Option<Arc<dyn CapabilityClient>> {
        self.inner
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_client(&self) -> Result<Arc<dyn CapabilityClient>, FleetError> {
        self.client().ok_or_else(|| FleetError::NotConnected {
            id: self.id().to_string(),
        })
    }

    fn set_client(&self, client: Option<Arc<dyn CapabilityClient>>) {
        *self
            .inner
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner) = client;
    }

    fn take_client(&self) -> Option<Arc<dyn CapabilityClient>> {
        self.inner
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_status(&self) -> std::sync::RwLockWriteGuard<'_, ProviderStatus> {
        self.inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the status and publish status-changed with the result.
    fn update_status<R>(&self, f: impl FnOnce(&mut ProviderStatus) -> R) -> R {
        let (result, snapshot) = {
            let mut status = self.write_status();
            let result = f(&mut status);
            (result, status.clone())
        };
        self.inner.bus.publish(FleetEvent::StatusChanged(snapshot));
        result
    }
}

impl std::fmt::Debug for ProviderSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSupervisor")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
