use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, reload, util::SubscriberInitExt};
use url::Url;

use application::binder::{ApiBinder, BinderConfig};
use application::monitor::LogMonitor;
use application::reconciler::ContainerManager;
use application::shadow::{ShadowConfig, ShadowEngine, broker_settings, status_topic};
use device_agent::api::{ApiState, create_router};
use device_agent::provision;
use domain::cloud::CloudApi;
use domain::device::DeviceRepository;
use domain::log::{LogBackend, LogLevel};
use domain::runtime::ContainerRuntime;
use domain::state::StateRepository;
use infrastructure::cloud::CloudClient;
use infrastructure::config::AgentSettings;
use infrastructure::database::{SeaOrmDeviceRepository, SeaOrmStateRepository};
use infrastructure::docker::DockerRuntime;
use infrastructure::logging::{
    CloudLogBackend, CloudLogConfig, FilePersistenceConfig, LocalLogBackend, LocalLogConfig,
    MqttLogBackend, MqttLogConfig,
};
use infrastructure::messaging::MqttConnection;
use infrastructure::telemetry::SysinfoProvider;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config directory (optional)
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Override data directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Override cloud API endpoint
    #[arg(long)]
    cloud_endpoint: Option<String>,
}

/// Fatal startup conditions and their process exit codes.
#[derive(Debug)]
enum FatalError {
    /// Exit 1: unrecoverable provisioning failure
    Provisioning(anyhow::Error),
    /// Exit 2: local store unavailable or corrupt
    Store(anyhow::Error),
    /// Exit 3: container runtime unreachable
    Runtime(anyhow::Error),
}

impl FatalError {
    fn code(&self) -> i32 {
        match self {
            Self::Provisioning(_) => 1,
            Self::Store(_) => 2,
            Self::Runtime(_) => 3,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Provisioning(e) => format!("Provisioning failed: {e:#}"),
            Self::Store(e) => format!("Local store unavailable: {e:#}"),
            Self::Runtime(e) => format!("Container runtime unreachable: {e:#}"),
        }
    }
}

async fn run() -> Result<(), FatalError> {
    dotenv().ok();

    // Initialize tracing with a reloadable filter; the shadow `logging`
    // delta section adjusts it at runtime.
    let initial_filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".into());
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new(&initial_filter));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🛰️ Iris Device Agent starting...");
    info!("🆔 Process ID: {}", std::process::id());

    // 1. Configuration
    let args = Args::parse();
    let mut settings = AgentSettings::load(&args.config_dir)
        .map_err(|e| FatalError::Provisioning(anyhow::anyhow!("Invalid configuration: {e}")))?;
    // LOG_LEVEL from the config file applies unless the environment
    // already pinned a filter.
    if std::env::var("RUST_LOG").is_err() && std::env::var("LOG_LEVEL").is_err() {
        let _ = filter_handle.modify(|filter| *filter = EnvFilter::new(&settings.log_level));
    }
    if let Some(endpoint) = args.cloud_endpoint {
        settings.cloud_api_endpoint = endpoint;
    }
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    std::fs::create_dir_all(&settings.data_dir)
        .map_err(|e| FatalError::Store(anyhow::anyhow!("Cannot create data dir: {e}")))?;
    info!("📂 Data directory: {}", settings.data_dir);
    info!("☁️ Cloud endpoint: {}", settings.cloud_api_endpoint);

    // 2. Local store
    let db_path = format!("sqlite://{}/agent.db?mode=rwc", settings.data_dir);
    let db = sea_orm::Database::connect(&db_path)
        .await
        .map_err(|e| FatalError::Store(e.into()))?;
    {
        use infrastructure::database::entities::{
            current_state_cache, device, target_state_snapshots,
        };
        use sea_orm::{ConnectionTrait, DbBackend, Schema, Statement};

        let backend = DbBackend::Sqlite;
        let schema = Schema::new(backend);
        let statements = [
            schema
                .create_table_from_entity(device::Entity)
                .if_not_exists()
                .to_owned(),
            schema
                .create_table_from_entity(target_state_snapshots::Entity)
                .if_not_exists()
                .to_owned(),
            schema
                .create_table_from_entity(current_state_cache::Entity)
                .if_not_exists()
                .to_owned(),
        ];
        for statement in statements {
            let sql = statement.build(sea_orm::sea_query::SqliteQueryBuilder);
            db.execute(Statement::from_string(backend, sql.to_string()))
                .await
                .map_err(|e| FatalError::Store(e.into()))?;
        }
        info!("✅ Schema verified (tables created)");
    }

    let devices: Arc<dyn DeviceRepository> = Arc::new(SeaOrmDeviceRepository::new(db.clone()));
    let store: Arc<dyn StateRepository> = Arc::new(SeaOrmStateRepository::new(db.clone()));

    // 3. Cloud client + provisioning
    let endpoint = Url::parse(&settings.cloud_api_endpoint).map_err(|e| {
        FatalError::Provisioning(anyhow::anyhow!(
            "Invalid CLOUD_API_ENDPOINT '{}': {e}",
            settings.cloud_api_endpoint
        ))
    })?;
    let cloud_client = Arc::new(
        CloudClient::new(endpoint, settings.log_compression)
            .map_err(|e| FatalError::Provisioning(e.into()))?,
    );
    let cloud_api: Arc<dyn CloudApi> = cloud_client.clone();

    let identity = provision::ensure_identity(&settings, &devices, &cloud_api)
        .await
        .map_err(FatalError::Provisioning)?;
    cloud_client.set_api_key(&identity.api_key);
    let uuid = identity.uuid.clone();

    // 4. Container runtime
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect().map_err(|e| FatalError::Runtime(e.into()))?,
    );
    runtime
        .ping()
        .await
        .map_err(|e| FatalError::Runtime(e.into()))?;
    info!("🐳 Container runtime reachable");

    // 5. MQTT session (never fatal: the agent degrades to HTTP-only)
    let mqtt = match MqttConnection::connect(&broker_settings(&identity)).await {
        Ok(connection) => {
            info!(broker = %identity.mqtt_broker_url, "✅ Connected to MQTT broker");
            Some(connection)
        }
        Err(e) => {
            warn!("MQTT broker unavailable, continuing without it: {}", e);
            None
        }
    };

    // 6. Logging pipeline
    let local_logs = LocalLogBackend::new(LocalLogConfig {
        max_logs: settings.max_logs,
        max_age_ms: settings.log_max_age,
        file_persistence: settings.enable_file_logging.then(|| FilePersistenceConfig {
            dir: settings.log_dir.clone().into(),
            max_file_size: settings.max_log_file_size,
        }),
    });
    let mut backends: Vec<Arc<dyn LogBackend>> = vec![local_logs.clone()];
    if let Some(connection) = &mqtt {
        backends.push(Arc::new(MqttLogBackend::new(
            connection.clone(),
            MqttLogConfig {
                qos: match settings.mqtt_log_qos {
                    0 => rumqttc::QoS::AtMostOnce,
                    2 => rumqttc::QoS::ExactlyOnce,
                    _ => rumqttc::QoS::AtLeastOnce,
                },
                ..Default::default()
            },
        )));
    }
    if settings.enable_cloud_logging {
        backends.push(Arc::new(CloudLogBackend::new(
            cloud_api.clone(),
            uuid.clone(),
            CloudLogConfig::default(),
        )));
    }
    let monitor = LogMonitor::new(runtime.clone(), backends);

    // 7. Reconciler
    let manager = Arc::new(ContainerManager::new(&uuid, runtime.clone(), store.clone()));
    manager
        .restore()
        .await
        .map_err(FatalError::Store)?;

    // 8. Shadow engine
    let shadow = match (&mqtt, settings.enable_shadow) {
        (Some(connection), true) => {
            let handle = filter_handle.clone();
            Some(Arc::new(
                ShadowEngine::new(
                    identity.clone(),
                    connection.clone(),
                    devices.clone(),
                    ShadowConfig {
                        shadow_name: settings.shadow_name.clone(),
                        sync_on_delta: settings.shadow_sync_on_delta,
                        publish_interval: settings.shadow_publish_interval(),
                    },
                )
                .with_log_level_handler(move |level| {
                    if let Err(e) = handle.modify(|filter| *filter = EnvFilter::new(level)) {
                        warn!("Failed to reload log filter: {}", e);
                    }
                }),
            ))
        }
        _ => None,
    };

    // 9. API binder
    let metrics = Arc::new(SysinfoProvider::new(AGENT_VERSION));
    let reconcile_kick = Arc::new(Notify::new());
    let (reprovision_tx, mut reprovision_rx) = mpsc::channel::<()>(1);
    let binder = Arc::new(ApiBinder::new(
        &uuid,
        cloud_api.clone(),
        manager.clone(),
        metrics,
        BinderConfig {
            poll_interval: settings.poll_interval(),
            report_interval: settings.report_interval(),
            metrics_interval: settings.metrics_interval(),
            ..Default::default()
        },
        reprovision_tx,
        reconcile_kick.clone(),
    ));

    // 10. Spawn the long-running tasks
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(manager.clone().run(
        settings.reconciliation_interval(),
        reconcile_kick,
        cancel.clone(),
    )));
    {
        let binder = binder.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { binder.poll_loop(token).await }));
    }
    {
        let binder = binder.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { binder.report_loop(token).await }));
    }
    tasks.push(tokio::spawn(monitor.clone().run(cancel.clone())));
    if let Some(engine) = &shadow {
        tasks.push(tokio::spawn(engine.clone().run(cancel.clone())));
    }

    // 11. Loopback device API
    let api_state = Arc::new(ApiState {
        uuid: uuid.clone(),
        agent_version: AGENT_VERSION.to_string(),
        manager: manager.clone(),
        local_logs: local_logs.clone(),
        started: Instant::now(),
    });
    match tokio::net::TcpListener::bind(("127.0.0.1", settings.device_api_port)).await {
        Ok(listener) => {
            info!(port = settings.device_api_port, "🔌 Device API listening");
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let shutdown = async move { token.cancelled().await };
                if let Err(e) = axum::serve(listener, create_router(api_state))
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!("Device API server error: {}", e);
                }
            }));
        }
        Err(e) => warn!(
            port = settings.device_api_port,
            "Device API unavailable: {}", e
        ),
    }

    monitor
        .emit_system(LogLevel::Info, "Agent initialized, all loops running")
        .await;
    info!("✅ Agent initialized");

    // 12. Supervise until shutdown or fatal condition
    let fatal: Option<FatalError> = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("🛑 Shutting down..."),
                    Err(e) => warn!(error = %e, "Unable to listen for shutdown signal"),
                }
                break None;
            }
            Some(()) = reprovision_rx.recv() => {
                match provision::reprovision(&settings, &devices, &cloud_api, uuid.clone()).await {
                    Ok(refreshed) => {
                        cloud_client.set_api_key(&refreshed.api_key);
                        info!("✅ Credentials refreshed");
                    }
                    Err(e) => break Some(FatalError::Provisioning(e)),
                }
            }
        }
    };

    // Cooperative shutdown with a hard deadline
    cancel.cancel();
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!("Shutdown deadline exceeded, terminating");
    }

    if let Some(connection) = &mqtt {
        let offline = serde_json::json!({ "status": "offline" }).to_string();
        let _ = connection.publish(&status_topic(&uuid), &offline, true).await;
        connection.disconnect().await;
    }

    match fatal {
        Some(error) => Err(error),
        None => {
            info!("👋 Good bye!");
            Ok(())
        }
    }
}

fn main() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = rt.block_on(run()) {
        eprintln!("\n❌ CRITICAL ERROR: {}", e.message());
        std::process::exit(e.code());
    }
}
