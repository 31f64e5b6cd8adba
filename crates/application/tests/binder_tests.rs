use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use application::binder::{ApiBinder, BinderConfig};
use application::reconciler::ContainerManager;
use domain::DomainError;
use domain::cloud::{
    CloudApi, CloudError, DeviceReport, ProvisioningRequest, ProvisioningResponse, TargetFetch,
};
use domain::runtime::{
    ContainerRuntime, ContainerSpec, LogStream, ManagedContainer, ManagedNetwork, RuntimeError,
};
use domain::state::{App, CurrentState, StateRepository, TargetState};
use domain::telemetry::{MetricsProvider, ProcessInfo, StaticFields, SystemMetrics};

// 1. Cloud mock with scripted poll responses
#[derive(Default)]
struct BinderCloud {
    poll_responses: Mutex<VecDeque<Result<TargetFetch, CloudError>>>,
    fetch_etags: Mutex<Vec<Option<String>>>,
    reports: Mutex<Vec<DeviceReport>>,
    fail_reports: AtomicBool,
}

impl BinderCloud {
    fn push_poll(&self, response: Result<TargetFetch, CloudError>) {
        self.poll_responses.lock().unwrap().push_back(response);
    }

    fn fetch_count(&self) -> usize {
        self.fetch_etags.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudApi for BinderCloud {
    async fn register(
        &self,
        _request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, CloudError> {
        unimplemented!("not exercised by the binder")
    }

    async fn fetch_target_state(
        &self,
        _uuid: &str,
        etag: Option<&str>,
    ) -> Result<TargetFetch, CloudError> {
        self.fetch_etags
            .lock()
            .unwrap()
            .push(etag.map(String::from));
        self.poll_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TargetFetch::NotModified))
    }

    async fn patch_device_state(
        &self,
        _uuid: &str,
        report: &DeviceReport,
    ) -> Result<(), CloudError> {
        if self.fail_reports.load(Ordering::Relaxed) {
            return Err(CloudError::Transient("cloud offline".into()));
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn upload_logs(&self, _uuid: &str, _ndjson: Vec<u8>) -> Result<(), CloudError> {
        Ok(())
    }
}

// 2. Empty runtime (the binder only observes through the manager)
struct EmptyRuntime;

#[async_trait]
impl ContainerRuntime for EmptyRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
        Ok("c1".into())
    }

    async fn start_container(&self, _container_id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_secs: i64,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove_container(
        &self,
        _container_id: &str,
        _force: bool,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn restart_container(&self, _container_id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn pull_image(&self, _reference: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<ManagedNetwork>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn create_network(&self, _app_id: i64, _name: &str) -> Result<String, RuntimeError> {
        Ok("n1".into())
    }

    async fn remove_network(&self, _app_id: i64, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn attach_log_stream(&self, _container_id: &str) -> LogStream {
        Box::pin(stream::empty())
    }
}

#[derive(Default)]
struct MemStateRepository {
    target: Mutex<Option<(TargetState, Option<String>)>>,
}

#[async_trait]
impl StateRepository for MemStateRepository {
    async fn save_target<'a>(
        &'a self,
        _uuid: &'a str,
        target: &'a TargetState,
        etag: Option<&'a str>,
    ) -> Result<(), DomainError> {
        *self.target.lock().unwrap() = Some((target.clone(), etag.map(String::from)));
        Ok(())
    }

    async fn load_target(
        &self,
        _uuid: &str,
    ) -> Result<Option<(TargetState, Option<String>)>, DomainError> {
        Ok(self.target.lock().unwrap().clone())
    }

    async fn save_current(
        &self,
        _uuid: &str,
        _current: &CurrentState,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    async fn load_current(&self, _uuid: &str) -> Result<Option<CurrentState>, DomainError> {
        Ok(None)
    }
}

// 3. Deterministic metrics
struct FixedMetrics {
    statics: Mutex<StaticFields>,
}

impl FixedMetrics {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            statics: Mutex::new(StaticFields {
                os_version: "Linux 6.1".into(),
                agent_version: "0.1.0".into(),
                local_ip: Some("10.0.0.2".into()),
            }),
        })
    }

    fn set_os(&self, os: &str) {
        self.statics.lock().unwrap().os_version = os.into();
    }
}

#[async_trait]
impl MetricsProvider for FixedMetrics {
    async fn collect(&self) -> SystemMetrics {
        SystemMetrics {
            cpu_usage: 7.5,
            memory_usage: 512,
            memory_total: 1024,
            storage_usage: 10,
            storage_total: 100,
            temperature: Some(41.0),
            uptime: 123,
            top_processes: vec![ProcessInfo {
                name: "agent".into(),
                cpu: 1.0,
                memory: 64,
            }],
        }
    }

    fn static_fields(&self) -> StaticFields {
        self.statics.lock().unwrap().clone()
    }
}

struct Harness {
    binder: Arc<ApiBinder>,
    manager: Arc<ContainerManager>,
    cloud: Arc<BinderCloud>,
    metrics: Arc<FixedMetrics>,
    kick: Arc<Notify>,
    reprovision_rx: mpsc::Receiver<()>,
}

fn harness() -> Harness {
    let cloud = Arc::new(BinderCloud::default());
    let metrics = FixedMetrics::new();
    let manager = Arc::new(ContainerManager::new(
        "dev-1",
        Arc::new(EmptyRuntime),
        Arc::new(MemStateRepository::default()),
    ));
    let kick = Arc::new(Notify::new());
    let (reprovision_tx, reprovision_rx) = mpsc::channel(1);
    let binder = Arc::new(ApiBinder::new(
        "dev-1",
        cloud.clone(),
        manager.clone(),
        metrics.clone(),
        BinderConfig::default(),
        reprovision_tx,
        kick.clone(),
    ));
    Harness {
        binder,
        manager,
        cloud,
        metrics,
        kick,
        reprovision_rx,
    }
}

fn fetched(version: i64, etag: &str) -> TargetFetch {
    let mut state = TargetState::empty();
    state.version = version;
    state.apps.insert(
        1,
        App {
            app_id: 1,
            app_name: "app".into(),
            services: vec![],
        },
    );
    TargetFetch::Fetched {
        state,
        etag: etag.into(),
    }
}

// 4. The tests

#[tokio::test(start_paused = true)]
async fn test_poll_not_modified_leaves_target_untouched() {
    let h = harness();
    h.cloud.push_poll(Ok(fetched(2, "E2")));
    h.cloud.push_poll(Ok(TargetFetch::NotModified));

    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let task = tokio::spawn(async move { binder.poll_loop(cancel.clone()).await });

    tokio::time::sleep(Duration::from_secs(15)).await;
    task.abort();

    assert_eq!(h.manager.target_state().await.version, 2);
    assert_eq!(h.manager.etag().as_deref(), Some("E2"));

    // Second fetch carried the stored ETag and its 304 changed nothing
    let etags = h.cloud.fetch_etags.lock().unwrap().clone();
    assert_eq!(etags[0], None);
    assert_eq!(etags[1].as_deref(), Some("E2"));
}

#[tokio::test(start_paused = true)]
async fn test_accepted_target_kicks_reconciliation() {
    let h = harness();
    h.cloud.push_poll(Ok(fetched(4, "E4")));

    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let task = tokio::spawn(async move { binder.poll_loop(cancel.clone()).await });

    let kicked = tokio::time::timeout(Duration::from_secs(5), h.kick.notified()).await;
    task.abort();
    assert!(kicked.is_ok(), "reconcile kick after accepting a target");
    assert_eq!(h.manager.target_state().await.version, 4);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_poll_requests_reprovisioning() {
    let mut h = harness();
    h.cloud.push_poll(Err(CloudError::Unauthorized));

    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let task = tokio::spawn(async move { binder.poll_loop(cancel.clone()).await });

    let signal = tokio::time::timeout(Duration::from_secs(5), h.reprovision_rx.recv()).await;
    task.abort();
    assert!(signal.is_ok(), "re-provisioning requested on 401");
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_errors_back_off() {
    let h = harness();
    for _ in 0..32 {
        h.cloud
            .push_poll(Err(CloudError::Transient("unreachable".into())));
    }

    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let task = tokio::spawn(async move { binder.poll_loop(cancel.clone()).await });

    tokio::time::sleep(Duration::from_secs(60)).await;
    task.abort();

    // Exponential backoff from 500ms towards the cap: attempts at
    // ~0, 0.5, 1.5, 3.5, 7.5, 15.5, 31.5s... far fewer than a tight loop
    let attempts = h.cloud.fetch_count();
    assert!(
        (5..=9).contains(&attempts),
        "expected backoff-paced attempts, got {attempts}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_static_fields_sent_once_until_changed() {
    let h = harness();
    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let report_cancel = cancel.clone();
    let task = tokio::spawn(async move { binder.report_loop(report_cancel).await });

    tokio::time::sleep(Duration::from_secs(25)).await;
    {
        let reports = h.cloud.reports.lock().unwrap();
        assert!(reports.len() >= 2);
        // First report after start sends everything
        assert_eq!(reports[0].os_version.as_deref(), Some("Linux 6.1"));
        assert_eq!(reports[0].agent_version.as_deref(), Some("0.1.0"));
        assert_eq!(reports[0].local_ip.as_deref(), Some("10.0.0.2"));
        assert!(reports[0].is_online);
        // Unchanged fields are omitted afterwards
        assert!(reports[1].os_version.is_none());
        assert!(reports[1].agent_version.is_none());
        assert!(reports[1].local_ip.is_none());
    }

    h.metrics.set_os("Linux 6.2");
    tokio::time::sleep(Duration::from_secs(11)).await;
    cancel.cancel();
    let _ = task.await;

    let reports = h.cloud.reports.lock().unwrap();
    let last = reports.last().unwrap();
    assert_eq!(last.os_version.as_deref(), Some("Linux 6.2"));
    assert!(last.agent_version.is_none(), "only the changed field is resent");
}

#[tokio::test(start_paused = true)]
async fn test_metrics_only_on_metrics_interval() {
    let h = harness();
    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let report_cancel = cancel.clone();
    let task = tokio::spawn(async move { binder.report_loop(report_cancel).await });

    tokio::time::sleep(Duration::from_secs(15)).await;
    {
        let reports = h.cloud.reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert!(
            reports.iter().all(|report| report.metrics.is_none()),
            "no metrics before the metrics interval elapses"
        );
    }

    tokio::time::sleep(Duration::from_secs(300)).await;
    cancel.cancel();
    let _ = task.await;

    let reports = h.cloud.reports.lock().unwrap();
    let with_metrics: Vec<_> = reports
        .iter()
        .filter(|report| report.metrics.is_some())
        .collect();
    assert!(!with_metrics.is_empty());
    let metrics = with_metrics[0].metrics.as_ref().unwrap();
    assert_eq!(metrics.cpu_usage, 7.5);
    assert_eq!(metrics.top_processes.len(), 1);
    // Metrics roughly every 300s, not every report
    assert!(with_metrics.len() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_report_failure_backs_off_and_recovers() {
    let h = harness();
    h.cloud.fail_reports.store(true, Ordering::Relaxed);

    let cancel = CancellationToken::new();
    let binder = h.binder.clone();
    let report_cancel = cancel.clone();
    let task = tokio::spawn(async move { binder.report_loop(report_cancel).await });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.cloud.reports.lock().unwrap().is_empty());

    h.cloud.fail_reports.store(false, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_secs(40)).await;
    cancel.cancel();
    let _ = task.await;

    let reports = h.cloud.reports.lock().unwrap();
    assert!(!reports.is_empty(), "reports resume after recovery");
    // First successful report still carries the static fields
    assert!(reports[0].os_version.is_some());
}
