//! API binder: the poll and report loops against the cloud. The loops are
//! independent, share nothing but the manager, and both back off
//! exponentially on transient failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use domain::cloud::{CloudApi, CloudError, DeviceReport, TargetFetch};
use domain::telemetry::{MetricsProvider, StaticFields};
use infrastructure::cloud::Backoff;

use crate::reconciler::ContainerManager;

#[derive(Debug, Clone)]
pub struct BinderConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub metrics_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            report_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(300),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
        }
    }
}

pub struct ApiBinder {
    uuid: String,
    api: Arc<dyn CloudApi>,
    manager: Arc<ContainerManager>,
    metrics: Arc<dyn MetricsProvider>,
    config: BinderConfig,
    /// Signalled on 401: the supervisor attempts one re-provisioning.
    reprovision: mpsc::Sender<()>,
    /// Wakes the reconcile loop when a new target is accepted.
    reconcile_kick: Arc<Notify>,
}

impl ApiBinder {
    pub fn new(
        uuid: impl Into<String>,
        api: Arc<dyn CloudApi>,
        manager: Arc<ContainerManager>,
        metrics: Arc<dyn MetricsProvider>,
        config: BinderConfig,
        reprovision: mpsc::Sender<()>,
        reconcile_kick: Arc<Notify>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            api,
            manager,
            metrics,
            config,
            reprovision,
            reconcile_kick,
        }
    }

    /// Conditional target fetching. 304 leaves the target untouched; a
    /// 200 installs it and kicks reconciliation.
    pub async fn poll_loop(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Poll loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let etag = self.manager.etag();
            match self
                .api
                .fetch_target_state(&self.uuid, etag.as_deref())
                .await
            {
                Ok(TargetFetch::NotModified) => {
                    backoff.reset();
                    delay = self.config.poll_interval;
                }
                Ok(TargetFetch::Fetched { state, etag }) => {
                    match self.manager.set_target(state, Some(&etag)).await {
                        Ok(()) => self.reconcile_kick.notify_one(),
                        // Previous target stays in effect; reporting is
                        // unaffected.
                        Err(e) => error!("Rejected target state: {:#}", e),
                    }
                    backoff.reset();
                    delay = self.config.poll_interval;
                }
                Err(CloudError::Unauthorized) => {
                    warn!("Poll unauthorized, requesting re-provisioning");
                    let _ = self.reprovision.try_send(());
                    delay = self.config.poll_interval;
                }
                Err(e) if e.is_transient() => {
                    delay = backoff.next_delay();
                    warn!(retry_in = ?delay, "Poll failed: {}", e);
                }
                Err(e) => {
                    warn!("Poll failed: {}", e);
                    delay = self.config.poll_interval;
                }
            }
        }
    }

    /// Periodic state reporting, metrics every metrics interval, static
    /// fields only when changed since the last successful transmission.
    pub async fn report_loop(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let mut delay = self.config.report_interval;
        let started = Instant::now();
        let mut last_metrics: Option<Instant> = None;
        let mut static_cache: Option<StaticFields> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Report loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let current = match self.manager.current_state().await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Skipping report, runtime unavailable: {}", e);
                    delay = self.config.report_interval;
                    continue;
                }
            };

            let include_metrics = match last_metrics {
                Some(at) => at.elapsed() >= self.config.metrics_interval,
                None => started.elapsed() >= self.config.metrics_interval,
            };
            let metrics = if include_metrics {
                Some(self.metrics.collect().await)
            } else {
                None
            };

            let statics = self.metrics.static_fields();
            let report = DeviceReport {
                apps: current.apps,
                config: current.config,
                is_online: true,
                metrics,
                os_version: changed_field(&static_cache, &statics, |s| &s.os_version),
                agent_version: changed_field(&static_cache, &statics, |s| &s.agent_version),
                local_ip: match &static_cache {
                    None => statics.local_ip.clone(),
                    Some(cached) if cached.local_ip != statics.local_ip => {
                        statics.local_ip.clone()
                    }
                    Some(_) => None,
                },
            };

            match self.api.patch_device_state(&self.uuid, &report).await {
                Ok(()) => {
                    backoff.reset();
                    delay = self.config.report_interval;
                    static_cache = Some(statics);
                    if include_metrics {
                        last_metrics = Some(Instant::now());
                    }
                }
                Err(CloudError::Unauthorized) => {
                    warn!("Report unauthorized, requesting re-provisioning");
                    let _ = self.reprovision.try_send(());
                    delay = self.config.report_interval;
                }
                Err(e) if e.is_transient() => {
                    delay = backoff.next_delay();
                    warn!(retry_in = ?delay, "Report failed: {}", e);
                }
                Err(e) => {
                    warn!("Report failed: {}", e);
                    delay = self.config.report_interval;
                }
            }
        }
    }
}

fn changed_field<F>(
    cache: &Option<StaticFields>,
    statics: &StaticFields,
    field: F,
) -> Option<String>
where
    F: Fn(&StaticFields) -> &String,
{
    match cache {
        // First report after start: send everything
        None => Some(field(statics).clone()),
        Some(cached) if field(cached) != field(statics) => Some(field(statics).clone()),
        Some(_) => None,
    }
}
