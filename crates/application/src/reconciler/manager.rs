use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use domain::plan::Step;
use domain::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use domain::state::{
    CurrentApp, CurrentService, CurrentState, StateRepository, TargetState, status,
};

use super::planner;

const STOP_TIMEOUT_SECS: i64 = 10;
/// Consecutive non-transient failures after which a service is reported
/// as degraded instead of being retried as if nothing happened.
const DEGRADED_AFTER: u32 = 3;

/// Owns the target state and converges the runtime towards it. Single
/// writer of the target and the persisted current snapshot; readers get
/// snapshots.
pub struct ContainerManager {
    uuid: String,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn StateRepository>,
    target: RwLock<TargetState>,
    etag: Mutex<Option<String>>,
    failures: Mutex<HashMap<(i64, i64), u32>>,
}

impl ContainerManager {
    pub fn new(
        uuid: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn StateRepository>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            runtime,
            store,
            target: RwLock::new(TargetState::empty()),
            etag: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Restore the persisted target so reconciliation survives restarts
    /// and offline periods.
    pub async fn restore(&self) -> Result<()> {
        if let Some((target, etag)) = self
            .store
            .load_target(&self.uuid)
            .await
            .context("Failed to load persisted target state")?
        {
            info!(version = target.version, "Restored persisted target state");
            *self.target.write().await = target;
            *self.etag.lock().unwrap() = etag;
        }
        Ok(())
    }

    /// Accept and persist a new target state. Malformed targets are
    /// rejected wholesale; the previous target stays in effect.
    pub async fn set_target(&self, target: TargetState, etag: Option<&str>) -> Result<()> {
        target
            .validate()
            .context("Rejecting malformed target state")?;
        self.store
            .save_target(&self.uuid, &target, etag)
            .await
            .context("Failed to persist target state")?;
        info!(version = target.version, "Accepted new target state");
        *self.target.write().await = target;
        *self.etag.lock().unwrap() = etag.map(String::from);
        Ok(())
    }

    pub async fn target_state(&self) -> TargetState {
        self.target.read().await.clone()
    }

    pub fn etag(&self) -> Option<String> {
        self.etag.lock().unwrap().clone()
    }

    /// Observed state, normalized, with degraded services injected and
    /// the applied device config mirrored in.
    pub async fn current_state(&self) -> Result<CurrentState, RuntimeError> {
        let mut current = self.observe().await?;
        let target = self.target.read().await;

        current.config = target.config.clone();

        let failures = self.failures.lock().unwrap();
        for app in target.apps.values() {
            for service in &app.services {
                let key = (app.app_id, service.service_id);
                let failed = failures.get(&key).copied().unwrap_or(0) >= DEGRADED_AFTER;
                if !failed {
                    continue;
                }
                match current.service_mut(key.0, key.1) {
                    Some(existing) => existing.status = status::DEGRADED.into(),
                    None => {
                        let entry =
                            current
                                .apps
                                .entry(app.app_id)
                                .or_insert_with(|| CurrentApp {
                                    app_id: app.app_id,
                                    app_name: app.app_name.clone(),
                                    services: Vec::new(),
                                });
                        entry.services.push(CurrentService {
                            service_id: service.service_id,
                            service_name: service.service_name.clone(),
                            image_name: service.image_name.clone(),
                            config: service.normalized().config,
                            container_id: None,
                            status: status::DEGRADED.into(),
                            created_at: None,
                            started_at: None,
                        });
                    }
                }
            }
        }

        Ok(current)
    }

    /// Raw runtime observation grouped per app.
    async fn observe(&self) -> Result<CurrentState, RuntimeError> {
        let containers = self.runtime.list_containers().await?;
        let mut apps: BTreeMap<i64, CurrentApp> = BTreeMap::new();
        for container in containers {
            let app = apps
                .entry(container.app_id)
                .or_insert_with(|| CurrentApp {
                    app_id: container.app_id,
                    app_name: container.app_name.clone(),
                    services: Vec::new(),
                });
            app.services.push(CurrentService {
                service_id: container.service_id,
                service_name: container.service_name,
                image_name: container.config.image.clone(),
                config: container.config,
                container_id: Some(container.container_id),
                status: container.status,
                created_at: container.created_at,
                started_at: container.started_at,
            });
        }
        for app in apps.values_mut() {
            app.services.sort_by_key(|service| service.service_id);
        }
        Ok(CurrentState {
            apps,
            config: BTreeMap::new(),
        })
    }

    /// Plan against the observed state and execute. Per-step best-effort:
    /// a failing step aborts only its own service's remaining steps.
    /// Returns the number of steps executed.
    pub async fn apply_target_state(&self) -> Result<usize, RuntimeError> {
        let current = self.observe().await?;
        let networks = self.runtime.list_networks().await?;
        let target = self.target.read().await.clone();

        let plan = planner::plan(&current, &networks, &target);
        if plan.is_empty() {
            return Ok(0);
        }
        info!(steps = plan.step_count(), "Executing reconciliation plan");

        let mut executed = 0;

        for step in &plan.create_networks {
            match self.execute_step(step).await {
                Ok(()) => executed += 1,
                Err(e) => error!(step = %step, "Step failed: {}", e),
            }
        }

        for ops in &plan.services {
            let key = (ops.app_id, ops.service_id);
            let mut service_failed = false;
            for step in &ops.steps {
                match self.execute_step(step).await {
                    Ok(()) => executed += 1,
                    Err(e) => {
                        if e.is_transient() {
                            warn!(step = %step, "Transient step failure, retrying next cycle: {}", e);
                        } else {
                            error!(step = %step, "Step failed: {}", e);
                            self.record_failure(key);
                        }
                        service_failed = true;
                        // Remaining steps of this service depend on this one
                        break;
                    }
                }
            }
            // A converged service (no steps) counts as recovered too:
            // the runtime may have brought it back between cycles.
            if !service_failed {
                self.clear_failures(key);
            }
        }

        for step in &plan.remove_networks {
            match self.execute_step(step).await {
                Ok(()) => executed += 1,
                Err(e) => error!(step = %step, "Step failed: {}", e),
            }
        }

        Ok(executed)
    }

    /// Composite cycle: converge, then persist the resulting snapshot.
    /// Idempotent: with no divergence it executes zero steps.
    pub async fn reconcile(&self) -> Result<usize, RuntimeError> {
        let executed = self.apply_target_state().await?;
        match self.current_state().await {
            Ok(current) => {
                if let Err(e) = self.store.save_current(&self.uuid, &current).await {
                    warn!("Failed to persist current state: {}", e);
                }
            }
            Err(e) => warn!("Failed to observe current state: {}", e),
        }
        Ok(executed)
    }

    /// Reconcile periodically until cancelled. `kick` forces an immediate
    /// cycle (used when a new target is accepted).
    pub async fn run(self: Arc<Self>, interval: Duration, kick: Arc<Notify>, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconcile loop shutting down");
                    return;
                }
                _ = timer.tick() => {}
                _ = kick.notified() => {}
            }
            match self.reconcile().await {
                Ok(0) => {}
                Ok(executed) => info!(executed, "Reconciliation cycle complete"),
                Err(e) => warn!("Reconciliation cycle failed: {}", e),
            }
        }
    }

    async fn execute_step(&self, step: &Step) -> Result<(), RuntimeError> {
        match step {
            Step::CreateNetwork { app_id, name } => {
                self.runtime.create_network(*app_id, name).await.map(|_| ())
            }
            Step::RemoveNetwork { app_id, name } => {
                self.runtime.remove_network(*app_id, name).await
            }
            Step::Fetch { image } => self.runtime.pull_image(image).await,
            Step::StartContainer {
                app_id,
                app_name,
                service,
            } => {
                let spec = ContainerSpec {
                    app_id: *app_id,
                    app_name: app_name.clone(),
                    service_id: service.service_id,
                    service_name: service.service_name.clone(),
                    config: service.normalized().config,
                };
                let container_id = self.runtime.create_container(&spec).await?;
                self.runtime.start_container(&container_id).await
            }
            Step::StopContainer { container_id } => {
                self.runtime
                    .stop_container(container_id, STOP_TIMEOUT_SECS)
                    .await
            }
            Step::RemoveContainer { container_id } => {
                self.runtime.remove_container(container_id, true).await
            }
            Step::RestartContainer { container_id } => {
                self.runtime.restart_container(container_id).await
            }
        }
    }

    fn record_failure(&self, key: (i64, i64)) {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(key).or_insert(0);
        *count += 1;
        if *count == DEGRADED_AFTER {
            warn!(
                app_id = key.0,
                service_id = key.1,
                "Service exceeded failure cap, reporting degraded"
            );
        }
    }

    fn clear_failures(&self, key: (i64, i64)) {
        self.failures.lock().unwrap().remove(&key);
    }
}
