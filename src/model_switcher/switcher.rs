//! Model Switcher - keeps at most one backend unit resident at a time
//!
//! The switcher tracks which unit is active and whether it passed its readiness probe. Every
//! transition (drain, stop old, start new, probe) runs under a single switch lock, so two
//! switches never interleave. Requests for the unit that is already active and ready take a
//! [`BackendLease`] straight from the state lock and never touch the switch lock.

use super::health::{Readiness, ReadinessProbe};
use super::supervisor::{ProcessSupervisor, SupervisorError};
use crate::errors::SwitchError;
use crate::registry::{ModelEntry, ModelRegistry};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Which unit holds the accelerator, and whether it is serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveBackendState {
    pub unit_name: Option<String>,
    pub base_url: Option<Url>,
    pub ready: bool,
    pub last_switched_at: Option<SystemTime>,
}

impl ActiveBackendState {
    /// True when `unit` is active and passed its probe.
    pub fn is_serving(&self, unit: &str) -> bool {
        self.ready && self.unit_name.as_deref() == Some(unit)
    }
}

/// Timeouts governing a switch
#[derive(Debug, Clone)]
pub struct ModelSwitcherConfig {
    /// Overall deadline for the readiness probe after a start
    pub ready_timeout: Duration,
    /// Bound on each individual supervisor call
    pub supervisor_timeout: Duration,
    /// How long to wait for in-flight requests before stopping their unit
    pub drain_timeout: Duration,
}

impl Default for ModelSwitcherConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(120),
            supervisor_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-unit in-flight tracking
#[derive(Default)]
struct UnitState {
    in_flight: AtomicUsize,
    in_flight_changed: Notify,
}

struct SwitcherInner {
    registry: Arc<ModelRegistry>,
    supervisor: Arc<dyn ProcessSupervisor>,
    prober: Arc<dyn ReadinessProbe>,
    config: ModelSwitcherConfig,
    state: RwLock<ActiveBackendState>,
    units: HashMap<String, Arc<UnitState>>,
    switch_lock: Mutex<()>,
}

/// The model switcher coordinates stop/start transitions between units
#[derive(Clone)]
pub struct ModelSwitcher {
    inner: Arc<SwitcherInner>,
}

impl std::fmt::Debug for ModelSwitcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSwitcher")
            .field("units", &self.inner.units.keys().collect::<Vec<_>>())
            .field("supervisor", &self.inner.supervisor)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ModelSwitcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        supervisor: Arc<dyn ProcessSupervisor>,
        prober: Arc<dyn ReadinessProbe>,
        config: ModelSwitcherConfig,
    ) -> Self {
        let units = registry
            .unit_names()
            .into_iter()
            .map(|unit| (unit, Arc::new(UnitState::default())))
            .collect();

        Self {
            inner: Arc::new(SwitcherInner {
                registry,
                supervisor,
                prober,
                config,
                state: RwLock::new(ActiveBackendState::default()),
                units,
                switch_lock: Mutex::new(()),
            }),
        }
    }

    /// Snapshot of the current active state
    pub async fn state(&self) -> ActiveBackendState {
        self.inner.state.read().await.clone()
    }

    /// Number of outstanding leases on a unit
    pub fn in_flight_count(&self, unit: &str) -> usize {
        self.inner
            .units
            .get(unit)
            .map(|s| s.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Make sure the unit serving `model_id` is the active, ready backend.
    ///
    /// Returns immediately when it already is. Otherwise drains and stops the previous unit,
    /// starts the target and waits for its readiness probe. Concurrent callers queue on the
    /// switch lock, so only the first one performs the switch.
    pub async fn ensure_active(&self, model_id: &str) -> Result<ActiveBackendState, SwitchError> {
        self.acquire(model_id).await.map(|lease| lease.state)
    }

    /// Like [`ensure_active`](Self::ensure_active), but also registers the caller as in flight
    /// on the unit until the returned lease is dropped. A switch away from that unit waits for
    /// outstanding leases (up to the drain timeout) before stopping it.
    pub async fn acquire(&self, model_id: &str) -> Result<BackendLease, SwitchError> {
        let entry = self.inner.registry.resolve(model_id)?;

        // Fast path: already serving, no switch lock
        if let Some(lease) = self.try_lease(entry).await {
            trace!(model = %model_id, unit = %entry.unit_name, "Backend already active");
            return Ok(lease);
        }

        // The switch runs in its own task so a caller that goes away mid-probe does not abandon
        // a half-loaded unit; the lease it produces is dropped with the task output.
        let switcher = self.clone();
        let target = entry.clone();
        let queued = Instant::now();
        let switch = tokio::spawn(async move {
            let _switch = switcher.inner.switch_lock.lock().await;

            // Double-check: a switch we queued behind may have activated our unit
            if let Some(lease) = switcher.try_lease(&target).await {
                debug!(model = %target.model_id, unit = %target.unit_name, "Backend activated by a concurrent switch");
                return Ok(lease);
            }

            switcher.switch_to(&target).await
        });

        switch.await.unwrap_or_else(|e| {
            error!(unit = %entry.unit_name, error = %e, "Switch task failed");
            Err(SwitchError::BackendStartTimeout {
                unit: entry.unit_name.clone(),
                elapsed: queued.elapsed(),
            })
        })
    }

    async fn try_lease(&self, entry: &ModelEntry) -> Option<BackendLease> {
        let state = self.inner.state.read().await;
        self.lease_if_serving(&state, entry)
    }

    /// Must be called with the state lock held so the increment cannot race `ready = false`.
    fn lease_if_serving(
        &self,
        state: &ActiveBackendState,
        entry: &ModelEntry,
    ) -> Option<BackendLease> {
        if !state.is_serving(&entry.unit_name) {
            return None;
        }
        let unit = self.inner.units.get(&entry.unit_name)?;
        unit.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(BackendLease {
            state: state.clone(),
            _guard: InFlightGuard {
                unit: Arc::clone(unit),
            },
        })
    }

    /// Perform the actual switch. Caller holds the switch lock.
    async fn switch_to(&self, entry: &ModelEntry) -> Result<BackendLease, SwitchError> {
        let started = Instant::now();
        let target = entry.unit_name.as_str();

        let previous = {
            let mut state = self.inner.state.write().await;
            state.ready = false;
            state.unit_name.clone()
        };

        info!(from = ?previous, to = %target, model = %entry.model_id, "Starting backend switch");

        let already_running = match previous {
            Some(ref unit) => {
                self.drain(unit).await;
                self.stop_best_effort(unit).await;
                false
            }
            None => self.reconcile_cold_start(target).await,
        };

        {
            let mut state = self.inner.state.write().await;
            state.unit_name = Some(target.to_string());
            state.base_url = Some(entry.base_url.clone());
        }

        if already_running {
            info!(unit = %target, "Adopting unit that is already running");
        } else {
            debug!(unit = %target, "Starting unit");
            let start = self.inner.supervisor.start(target);
            if let Err(e) = self.bounded("start", target, start).await {
                error!(unit = %target, error = %e, "Failed to start unit");
                return Err(SwitchError::BackendStartTimeout {
                    unit: target.to_string(),
                    elapsed: started.elapsed(),
                });
            }
        }

        let readiness = self
            .inner
            .prober
            .await_ready(&entry.base_url, self.inner.config.ready_timeout)
            .await;
        match readiness {
            Readiness::Ready { .. } => {
                let mut state = self.inner.state.write().await;
                state.ready = true;
                state.last_switched_at = Some(SystemTime::now());
                info!(unit = %target, elapsed = ?started.elapsed(), "Backend is now active");
                self.lease_if_serving(&state, entry).ok_or_else(|| {
                    SwitchError::BackendUnreachable {
                        unit: target.to_string(),
                        reason: "unit has no in-flight tracking".to_string(),
                    }
                })
            }
            Readiness::TimedOut { attempts, .. } => {
                let elapsed = started.elapsed();
                error!(
                    unit = %target,
                    attempts,
                    probing = ?readiness.elapsed(),
                    elapsed = ?elapsed,
                    "Backend did not become ready in time"
                );
                Err(SwitchError::BackendStartTimeout {
                    unit: target.to_string(),
                    elapsed,
                })
            }
        }
    }

    /// Nothing is recorded as active (fresh process). Stop every other running unit and report
    /// whether the target is already up.
    async fn reconcile_cold_start(&self, target: &str) -> bool {
        let units = self.inner.registry.unit_names();
        let checks = units.iter().map(|unit| async move {
            let query = self.inner.supervisor.is_active(unit);
            (unit.as_str(), self.bounded("is-active", unit, query).await)
        });
        let statuses = futures_util::future::join_all(checks).await;

        let mut target_running = false;
        for (unit, status) in statuses {
            if unit == target {
                target_running = matches!(status, Ok(true));
                continue;
            }
            match status {
                Ok(false) => {}
                Ok(true) => {
                    info!(unit = %unit, "Stopping stray unit found at cold start");
                    self.stop_best_effort(unit).await;
                }
                Err(e) => {
                    warn!(unit = %unit, error = %e, "Unit state unknown, stopping it");
                    self.stop_best_effort(unit).await;
                }
            }
        }
        target_running
    }

    /// Stop failures are logged and swallowed; the process may already be gone.
    async fn stop_best_effort(&self, unit: &str) {
        debug!(unit = %unit, "Stopping unit");
        let stop = self.inner.supervisor.stop(unit);
        if let Err(e) = self.bounded("stop", unit, stop).await {
            warn!(unit = %unit, error = %e, "Failed to stop unit, continuing");
        }
    }

    /// Wait for in-flight leases on `unit` to finish, up to the drain timeout.
    async fn drain(&self, unit: &str) {
        let Some(unit_state) = self.inner.units.get(unit) else {
            return;
        };

        let drained = async {
            loop {
                // Register before checking so a release in between is not missed
                let notified = unit_state.in_flight_changed.notified();
                if unit_state.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(self.inner.config.drain_timeout, drained)
            .await
            .is_err()
        {
            warn!(
                unit = %unit,
                in_flight = unit_state.in_flight.load(Ordering::SeqCst),
                "Drain timeout, stopping unit with requests still in flight"
            );
        }
    }

    async fn bounded<T>(
        &self,
        action: &'static str,
        unit: &str,
        call: impl Future<Output = Result<T, SupervisorError>>,
    ) -> Result<T, SupervisorError> {
        let after = self.inner.config.supervisor_timeout;
        tokio::time::timeout(after, call)
            .await
            .map_err(|_| SupervisorError::Timeout {
                action,
                unit: unit.to_string(),
                after,
            })?
    }
}

/// An active backend the caller may forward to, held until the response is read
#[derive(Debug)]
pub struct BackendLease {
    state: ActiveBackendState,
    _guard: InFlightGuard,
}

impl BackendLease {
    pub fn state(&self) -> &ActiveBackendState {
        &self.state
    }
}

/// Guard that tracks in-flight requests
struct InFlightGuard {
    unit: Arc<UnitState>,
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("in_flight", &self.unit.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.unit.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.unit.in_flight_changed.notify_waiters();
        }
    }
}
