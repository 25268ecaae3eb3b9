//! Health monitor: rolling uptime and response-time metrics per provider.
//!
//! Fed by health-check results, either directly through
//! [`HealthMonitor::record_health_check`] or from the bus via
//! [`HealthMonitor::attach`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::fleet::{EventBus, FleetEvent, HealthCheckResult};

use super::ring_buffer::RingBuffer;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Results kept per provider.
pub const HISTORY_CAPACITY: usize = 100;

/// Entries the rolling uptime is computed over.
pub const UPTIME_WINDOW: usize = 20;

/// Entries the liveness verdict is computed over.
pub const LIVENESS_WINDOW: usize = 10;

/// Minimum success rate over [`LIVENESS_WINDOW`] to count as healthy.
pub const LIVENESS_MIN_SUCCESS_RATE: f64 = 0.8;

/// A latest check older than this does not count.
pub const LIVENESS_MAX_AGE_SECS: i64 = 60;

/// Smoothing factor for the average response time.
pub const RESPONSE_TIME_ALPHA: f64 = 0.1;

const HEALTHY_UPTIME: f64 = 95.0;
const DEGRADED_UPTIME: f64 = 80.0;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Classification bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No metrics recorded.
    Unknown,
}

impl HealthStatus {
    pub fn from_uptime(uptime_percent: f64) -> Self {
        if uptime_percent >= HEALTHY_UPTIME {
            HealthStatus::Healthy
        } else if uptime_percent >= DEGRADED_UPTIME {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Rolling metrics for one provider, created on its first check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub provider_id: String,
    /// Success ratio over the last [`UPTIME_WINDOW`] checks, 0–100.
    pub uptime_percent: f64,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub average_response_time_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            uptime_percent: 0.0,
            total_checks: 0,
            failed_checks: 0,
            average_response_time_ms: 0.0,
            last_success: None,
            last_failure: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_uptime(self.uptime_percent)
    }
}

/// Fleet-wide health summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub total_providers: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub average_uptime_percent: f64,
    pub average_response_time_ms: f64,
    /// Sorted by provider id.
    pub providers: Vec<HealthMetrics>,
    pub generated_at: DateTime<Utc>,
}

struct ProviderHealth {
    metrics: HealthMetrics,
    history: RingBuffer<HealthCheckResult>,
}

impl ProviderHealth {
    fn new(provider_id: &str) -> Self {
        Self {
            metrics: HealthMetrics::new(provider_id),
            history: RingBuffer::new(HISTORY_CAPACITY),
        }
    }

    fn record(&mut self, result: HealthCheckResult) {
        let metrics = &mut self.metrics;
        metrics.total_checks += 1;
        if result.healthy {
            metrics.last_success = Some(result.timestamp);
        } else {
            metrics.failed_checks += 1;
            metrics.last_failure = Some(result.timestamp);
        }

        let sample = result.response_time_ms as f64;
        metrics.average_response_time_ms = if metrics.total_checks == 1 {
            sample
        } else {
            RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * metrics.average_response_time_ms
        };

        self.history.push(result);
        self.metrics.uptime_percent = success_rate(&self.history, UPTIME_WINDOW) * 100.0;
    }
}

/// Share of healthy results among the newest `window` entries; 0 when empty.
fn success_rate(history: &RingBuffer<HealthCheckResult>, window: usize) -> f64 {
    let (ok, total) = history
        .recent(window)
        .fold((0usize, 0usize), |(ok, total), r| (ok + usize::from(r.healthy), total + 1));
    if total == 0 {
        0.0
    } else {
        ok as f64 / total as f64
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// Tracks health metrics for every provider it has seen a check for.
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

#[derive(Default)]
struct MonitorInner {
    providers: RwLock<HashMap<String, ProviderHealth>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
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

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ProviderHealth>> {
        self.inner
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<String, ProviderHealth>) -> R) -> R {
        let providers = self
            .inner
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&providers)
    }

    /// Record one probe result.
    pub fn record_health_check(&self, result: HealthCheckResult) {
        let mut providers = self.write();
        let entry = providers
            .entry(result.provider_id.clone())
            .or_insert_with(|| ProviderHealth::new(&result.provider_id));
        entry.record(result);
        tracing::trace!(
            provider = %entry.metrics.provider_id,
            uptime = entry.metrics.uptime_percent,
            "health check recorded"
        );
    }

    /// Classification for one provider; `Unknown` without metrics.
    pub fn get_server_health_summary(&self, provider_id: &str) -> HealthStatus {
        self.read(|providers| {
            providers
                .get(provider_id)
                .map_or(HealthStatus::Unknown, |p| p.metrics.status())
        })
    }

    /// Healthy when the last [`LIVENESS_WINDOW`] checks mostly succeeded and
    /// the newest one succeeded within the last minute.
    pub fn is_server_healthy(&self, provider_id: &str) -> bool {
        self.is_server_healthy_at(provider_id, Utc::now())
    }

    /// [`Self::is_server_healthy`] evaluated at `now`.
    pub fn is_server_healthy_at(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.read(|providers| {
            let Some(health) = providers.get(provider_id) else {
                return false;
            };
            let Some(latest) = health.history.latest() else {
                return false;
            };
            let fresh = now.signed_duration_since(latest.timestamp)
                <= chrono::Duration::seconds(LIVENESS_MAX_AGE_SECS);
            latest.healthy
                && fresh
                && success_rate(&health.history, LIVENESS_WINDOW) >= LIVENESS_MIN_SUCCESS_RATE
        })
    }

    pub fn get_metrics(&self, provider_id: &str) -> Option<HealthMetrics> {
        self.read(|providers| providers.get(provider_id).map(|p| p.metrics.clone()))
    }

    /// Every provider's metrics, sorted by id.
    pub fn get_all_metrics(&self) -> Vec<HealthMetrics> {
        let mut metrics: Vec<HealthMetrics> =
            self.read(|providers| providers.values().map(|p| p.metrics.clone()).collect());
        metrics.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        metrics
    }

    /// The newest `limit` results for a provider, oldest first.
    pub fn get_recent_checks(&self, provider_id: &str, limit: usize) -> Vec<HealthCheckResult> {
        self.read(|providers| {
            providers
                .get(provider_id)
                .map(|p| p.history.recent(limit).cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Bucket counts and fleet-wide averages.
    pub fn generate_health_report(&self) -> HealthReport {
        let providers = self.get_all_metrics();
        let mut report = HealthReport {
            total_providers: providers.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            average_uptime_percent: 0.0,
            average_response_time_ms: 0.0,
            providers: Vec::new(),
            generated_at: Utc::now(),
        };

        for metrics in &providers {
            match metrics.status() {
                HealthStatus::Healthy => report.healthy += 1,
                HealthStatus::Degraded => report.degraded += 1,
                HealthStatus::Unhealthy => report.unhealthy += 1,
                HealthStatus::Unknown => report.unknown += 1,
            }
        }
        if !providers.is_empty() {
            let count = providers.len() as f64;
            report.average_uptime_percent =
                providers.iter().map(|m| m.uptime_percent).sum::<f64>() / count;
            report.average_response_time_ms =
                providers.iter().map(|m| m.average_response_time_ms).sum::<f64>() / count;
        }
        report.providers = providers;
        report
    }

    /// Drop one provider's state, or everything when `provider_id` is `None`.
    pub fn clear_metrics(&self, provider_id: Option<&str>) {
        let mut providers = self.write();
        match provider_id {
            Some(id) => {
                providers.remove(id);
            }
            None => providers.clear(),
        }
    }

    // ── Bus ──────────────────────────────────────────────────────────────────

    /// Record every health-check notification on `bus` and forget removed
    /// providers. Replaces any previous attachment.
    pub fn attach(&self, bus: &EventBus) {
        let mut rx = bus.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let monitor = HealthMonitor { inner };
                match event.as_ref() {
                    FleetEvent::HealthCheck(result) => monitor.record_health_check(result.clone()),
                    FleetEvent::ProviderRemoved { id } => monitor.clear_metrics(Some(id)),
                    _ => {}
                }
            }
        });
        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop listening to the bus.
    pub fn detach(&self) {
        let handle = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
