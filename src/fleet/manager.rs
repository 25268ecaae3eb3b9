//! Fleet manager: the set of supervisors and the aggregated snapshot.
//!
//! The manager listens to its own bus. Status-changed, connected and
//! disconnected notifications trigger a snapshot recomputation; a burst of
//! them is coalesced into one pass, and passes are serialized so snapshots
//! are published in order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::config::{FleetSettings, ProviderConfig};
use crate::protocol::{ClientFactory, ProviderCapabilities};

use super::errors::FleetError;
use super::events::{EventBus, FleetEvent};
use super::supervisor::{ProviderSupervisor, SupervisorSettings};
use super::types::{FleetContextSnapshot, Prompt, ProviderStatus, Resource, Tool};

/// Owns every supervisor in the fleet. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    supervisors: tokio::sync::RwLock<HashMap<String, ProviderSupervisor>>,
    factory: Arc<dyn ClientFactory>,
    settings: FleetSettings,
    bus: EventBus,
    latest: RwLock<Arc<FleetContextSnapshot>>,
    recompute_lock: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl FleetManager {
    /// Create an empty fleet and start its recompute listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: FleetSettings, factory: Arc<dyn ClientFactory>, bus: EventBus) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                supervisors: tokio::sync::RwLock::new(HashMap::new()),
                factory,
                settings,
                bus,
                latest: RwLock::new(Arc::new(FleetContextSnapshot::empty())),
                recompute_lock: tokio::sync::Mutex::new(()),
                listener: Mutex::new(None),
            }),
        };
        manager.spawn_listener();
        manager
    }

    fn spawn_listener(&self) {
        let mut rx = self.inner.bus.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !event.triggers_recompute() {
                    continue;
                }
                // Let the rest of a burst land, then fold it into this pass.
                tokio::task::yield_now().await;
                while rx.try_recv().is_some() {}

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                FleetManager { inner }.recompute_fleet_snapshot().await;
            }
        });
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.inner.settings
    }

    // ── Membership ───────────────────────────────────────────────────────────

    /// Validate and register a provider; auto-start it in the background
    /// when it is enabled and flagged for auto-start.
    pub async fn add_provider(&self, config: ProviderConfig) -> Result<(), FleetError> {
        config.validate()?;

        let supervisor = {
            let mut supervisors = self.inner.supervisors.write().await;
            if supervisors.contains_key(&config.id) {
                return Err(FleetError::already_exists(&config.id));
            }
            let supervisor = ProviderSupervisor::new(
                config.clone(),
                SupervisorSettings::from(&self.inner.settings),
                Arc::clone(&self.inner.factory),
                self.inner.bus.clone(),
            );
            supervisors.insert(config.id.clone(), supervisor.clone());
            supervisor
        };

        self.inner.bus.publish(FleetEvent::ProviderAdded {
            id: config.id.clone(),
        });
        tracing::info!(
            provider = %config.id,
            name = %config.display_name(),
            auto_start = config.enabled && config.auto_start,
            "provider added"
        );

        if config.enabled && config.auto_start {
            supervisor.spawn_start();
        }
        Ok(())
    }

    /// Stop and discard a provider. Returns `false` if it was not present.
    pub async fn remove_provider(&self, id: &str) -> bool {
        let removed = self.inner.supervisors.write().await.remove(id);
        let Some(supervisor) = removed else {
            return false;
        };

        supervisor.stop().await;
        self.inner.bus.publish(FleetEvent::ProviderRemoved { id: id.to_string() });
        tracing::info!(provider = %id, "provider removed");
        self.recompute_fleet_snapshot().await;
        true
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub async fn start_provider(&self, id: &str) -> Result<(), FleetError> {
        self.require(id).await?.start().await
    }

    pub async fn stop_provider(&self, id: &str) -> Result<(), FleetError> {
        self.require(id).await?.stop().await;
        Ok(())
    }

    pub async fn restart_provider(&self, id: &str) -> Result<(), FleetError> {
        self.require(id).await?.restart().await
    }

    /// Start every enabled, auto-start provider concurrently.
    ///
    /// Returns the providers that failed, with their errors.
    pub async fn start_all(&self) -> Vec<(String, FleetError)> {
        let targets: Vec<ProviderSupervisor> = self
            .supervisors()
            .await
            .into_iter()
            .filter(|s| s.config().enabled && s.config().auto_start)
            .collect();

        let outcomes = join_all(targets.iter().map(|supervisor| async move {
            (supervisor.id().to_string(), supervisor.start().await)
        }))
        .await;

        let failures: Vec<(String, FleetError)> = outcomes
            .into_iter()
            .filter_map(|(id, outcome)| outcome.err().map(|e| (id, e)))
            .collect();
        for (id, error) in &failures {
            tracing::warn!(provider = %id, error = %error, "provider failed to start");
        }
        tracing::info!(
            started = targets.len() - failures.len(),
            failed = failures.len(),
            "fleet start complete"
        );
        failures
    }

    /// Stop every provider concurrently.
    pub async fn stop_all(&self) {
        let supervisors = self.supervisors().await;
        join_all(supervisors.iter().map(ProviderSupervisor::stop)).await;
        tracing::info!(count = supervisors.len(), "fleet stopped");
    }

    /// Stop everything and end the recompute listener.
    pub async fn shutdown(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = listener {
            handle.abort();
        }
        self.stop_all().await;
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub async fn get_supervisor(&self, id: &str) -> Option<ProviderSupervisor> {
        self.inner.supervisors.read().await.get(id).cloned()
    }

    pub async fn get_server_status(&self, id: &str) -> Option<ProviderStatus> {
        self.get_supervisor(id).await.map(|s| s.status())
    }

    /// Every provider's status, sorted by id.
    pub async fn get_server_statuses(&self) -> Vec<ProviderStatus> {
        self.supervisors()
            .await
            .iter()
            .map(ProviderSupervisor::status)
            .collect()
    }

    /// Provider ids, sorted.
    pub async fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.supervisors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The most recently published snapshot.
    pub fn latest_snapshot(&self) -> Arc<FleetContextSnapshot> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn supervisors(&self) -> Vec<ProviderSupervisor> {
        let mut supervisors: Vec<ProviderSupervisor> =
            self.inner.supervisors.read().await.values().cloned().collect();
        supervisors.sort_by(|a, b| a.id().cmp(b.id()));
        supervisors
    }

    async fn require(&self, id: &str) -> Result<ProviderSupervisor, FleetError> {
        self.get_supervisor(id)
            .await
            .ok_or_else(|| FleetError::NotFound { id: id.to_string() })
    }

    // ── Snapshot ─────────────────────────────────────────────────────────────

    /// Query every Running provider and publish a fresh snapshot.
    ///
    /// A provider whose queries fail contributes nothing to this pass.
    pub async fn recompute_fleet_snapshot(&self) -> Arc<FleetContextSnapshot> {
        let _guard = self.inner.recompute_lock.lock().await;

        let supervisors = self.supervisors().await;
        let statuses: Vec<ProviderStatus> = supervisors.iter().map(ProviderSupervisor::status).collect();

        let queries = supervisors
            .iter()
            .zip(&statuses)
            .filter(|(_, status)| status.is_running())
            .map(|(supervisor, status)| query_provider(supervisor, status.capabilities));
        let contributions = join_all(queries).await;

        let mut tools = Vec::new();
        let mut resources = Vec::new();
        let mut prompts = Vec::new();
        for (t, r, p) in contributions {
            tools.extend(t);
            resources.extend(r);
            prompts.extend(p);
        }

        let snapshot = Arc::new(FleetContextSnapshot::new(statuses, tools, resources, prompts));
        *self
            .inner
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);

        tracing::debug!(
            providers = snapshot.providers.len(),
            tools = snapshot.tools.len(),
            resources = snapshot.resources.len(),
            prompts = snapshot.prompts.len(),
            "fleet snapshot recomputed"
        );
        self.inner
            .bus
            .publish(FleetEvent::ContextUpdated(Arc::clone(&snapshot)));
        snapshot
    }
}

/// List the capability families a provider advertised. A provider that
/// advertised none is asked for all three.
async fn query_provider(
    supervisor: &ProviderSupervisor,
    advertised: ProviderCapabilities,
) -> (Vec<Tool>, Vec<Resource>, Vec<Prompt>) {
    let wanted = if advertised.is_empty() {
        ProviderCapabilities::all()
    } else {
        advertised
    };

    let tools = async {
        if wanted.tools {
            supervisor.list_tools().await
        } else {
            Ok(Vec::new())
        }
    };
    let resources = async {
        if wanted.resources {
            supervisor.list_resources().await
        } else {
            Ok(Vec::new())
        }
    };
    let prompts = async {
        if wanted.prompts {
            supervisor.list_prompts().await
        } else {
            Ok(Vec::new())
        }
    };

    match futures::try_join!(tools, resources, prompts) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(
                provider = %supervisor.id(),
                error = %e,
                "capability query failed, provider contributes nothing"
            );
            Default::default()
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
