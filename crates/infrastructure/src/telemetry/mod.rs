//! System telemetry via sysinfo.

use std::net::IpAddr;

use async_trait::async_trait;
use sysinfo::{Components, Disks, Networks, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use domain::telemetry::{MetricsProvider, ProcessInfo, StaticFields, SystemMetrics};

const TOP_PROCESS_COUNT: usize = 5;

pub struct SysinfoProvider {
    system: Mutex<System>,
    agent_version: String,
}

impl SysinfoProvider {
    pub fn new(agent_version: impl Into<String>) -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            agent_version: agent_version.into(),
        }
    }

    fn local_ip() -> Option<String> {
        let networks = Networks::new_with_refreshed_list();
        let mut candidates: Vec<(String, IpAddr)> = Vec::new();
        for (name, data) in &networks {
            if name == "lo"
                || name.starts_with("docker")
                || name.starts_with("br-")
                || name.starts_with("veth")
            {
                continue;
            }
            for ip_network in data.ip_networks() {
                if let IpAddr::V4(v4) = ip_network.addr {
                    if !v4.is_loopback() && !v4.is_link_local() {
                        candidates.push((name.clone(), ip_network.addr));
                    }
                }
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.first().map(|(_, addr)| addr.to_string())
    }

    fn temperature() -> Option<f32> {
        let components = Components::new_with_refreshed_list();
        components
            .iter()
            .map(|component| component.temperature())
            .fold(None, |acc: Option<f32>, value| {
                Some(acc.map_or(value, |current| current.max(value)))
            })
    }
}

#[async_trait]
impl MetricsProvider for SysinfoProvider {
    async fn collect(&self) -> SystemMetrics {
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let memory_total = system.total_memory();
        let mut processes: Vec<(f32, ProcessInfo)> = system
            .processes()
            .values()
            .map(|process| {
                let memory = process.memory();
                let memory_share = if memory_total > 0 {
                    memory as f32 / memory_total as f32 * 100.0
                } else {
                    0.0
                };
                let score = process.cpu_usage() + memory_share;
                (
                    score,
                    ProcessInfo {
                        name: process.name().to_string_lossy().into_owned(),
                        cpu: process.cpu_usage(),
                        memory,
                    },
                )
            })
            .collect();
        processes.sort_by(|a, b| b.0.total_cmp(&a.0));
        let top_processes = processes
            .into_iter()
            .take(TOP_PROCESS_COUNT)
            .map(|(_, info)| info)
            .collect();

        let disks = Disks::new_with_refreshed_list();
        let storage_total: u64 = disks.iter().map(|disk| disk.total_space()).sum();
        let storage_free: u64 = disks.iter().map(|disk| disk.available_space()).sum();

        SystemMetrics {
            cpu_usage: system.global_cpu_usage(),
            memory_usage: system.used_memory(),
            memory_total,
            storage_usage: storage_total.saturating_sub(storage_free),
            storage_total,
            temperature: Self::temperature(),
            uptime: System::uptime(),
            top_processes,
        }
    }

    fn static_fields(&self) -> StaticFields {
        StaticFields {
            os_version: System::long_os_version()
                .unwrap_or_else(|| System::os_version().unwrap_or_else(|| "unknown".into())),
            agent_version: self.agent_version.clone(),
            local_ip: Self::local_ip(),
        }
    }
}
