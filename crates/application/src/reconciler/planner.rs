//! Pure step planning: given the observed state and the target, compute
//! the minimum ordered step set that converges one into the other.

use std::collections::BTreeSet;

use domain::plan::Step;
use domain::runtime::ManagedNetwork;
use domain::state::normalize::service_config_changed;
use domain::state::{CurrentState, TargetState, status};

/// Steps for one service, executed sequentially; a failure aborts the
/// remaining steps of this service only.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOps {
    pub app_id: i64,
    pub service_id: i64,
    pub steps: Vec<Step>,
}

/// Ordered plan: all network creations, then per-service container
/// mutations, then network removals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub create_networks: Vec<Step>,
    pub services: Vec<ServiceOps>,
    pub remove_networks: Vec<Step>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create_networks.is_empty()
            && self.remove_networks.is_empty()
            && self.services.iter().all(|ops| ops.steps.is_empty())
    }

    pub fn step_count(&self) -> usize {
        self.create_networks.len()
            + self.remove_networks.len()
            + self.services.iter().map(|ops| ops.steps.len()).sum::<usize>()
    }

    /// Flattened execution order, for logging and assertions.
    pub fn steps(&self) -> Vec<&Step> {
        self.create_networks
            .iter()
            .chain(self.services.iter().flat_map(|ops| ops.steps.iter()))
            .chain(self.remove_networks.iter())
            .collect()
    }
}

pub fn plan(
    current: &CurrentState,
    current_networks: &[ManagedNetwork],
    target: &TargetState,
) -> Plan {
    let mut out = Plan::default();

    // Networks: create missing first, stage obsolete removals for after
    // the container phase.
    let existing: BTreeSet<(i64, String)> = current_networks
        .iter()
        .map(|network| (network.app_id, network.name.clone()))
        .collect();
    let mut desired: BTreeSet<(i64, String)> = BTreeSet::new();
    for app in target.apps.values() {
        for name in app.referenced_networks() {
            desired.insert((app.app_id, name));
        }
    }
    for (app_id, name) in desired.difference(&existing) {
        out.create_networks.push(Step::CreateNetwork {
            app_id: *app_id,
            name: name.clone(),
        });
    }
    for (app_id, name) in existing.difference(&desired) {
        out.remove_networks.push(Step::RemoveNetwork {
            app_id: *app_id,
            name: name.clone(),
        });
    }

    // Services present in the target: start, or recreate on change.
    let mut fetched: BTreeSet<String> = BTreeSet::new();
    for app in target.apps.values() {
        for service in &app.services {
            let service = service.normalized();
            let mut steps = Vec::new();

            match current.service(app.app_id, service.service_id) {
                None => {
                    if fetched.insert(service.config.image.clone()) {
                        steps.push(Step::Fetch {
                            image: service.config.image.clone(),
                        });
                    }
                    steps.push(Step::StartContainer {
                        app_id: app.app_id,
                        app_name: app.app_name.clone(),
                        service: service.clone(),
                    });
                }
                Some(running) => {
                    if service_config_changed(&service.config, &running.config) {
                        if let Some(container_id) = &running.container_id {
                            steps.push(Step::StopContainer {
                                container_id: container_id.clone(),
                            });
                            steps.push(Step::RemoveContainer {
                                container_id: container_id.clone(),
                            });
                        }
                        if fetched.insert(service.config.image.clone()) {
                            steps.push(Step::Fetch {
                                image: service.config.image.clone(),
                            });
                        }
                        steps.push(Step::StartContainer {
                            app_id: app.app_id,
                            app_name: app.app_name.clone(),
                            service: service.clone(),
                        });
                    } else if running.status == status::EXITED
                        || running.status == status::CREATED
                    {
                        // Same configuration, container just is not
                        // running: bring it back without a recreate.
                        if let Some(container_id) = &running.container_id {
                            steps.push(Step::RestartContainer {
                                container_id: container_id.clone(),
                            });
                        }
                    }
                }
            }

            out.services.push(ServiceOps {
                app_id: app.app_id,
                service_id: service.service_id,
                steps,
            });
        }
    }

    // Garbage collection: managed containers with no target counterpart.
    for (app_id, service_id) in current.service_keys() {
        if target.service(app_id, service_id).is_some() {
            continue;
        }
        let Some(orphan) = current.service(app_id, service_id) else {
            continue;
        };
        let mut steps = Vec::new();
        if let Some(container_id) = &orphan.container_id {
            steps.push(Step::StopContainer {
                container_id: container_id.clone(),
            });
            steps.push(Step::RemoveContainer {
                container_id: container_id.clone(),
            });
        }
        out.services.push(ServiceOps {
            app_id,
            service_id,
            steps,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::state::{App, CurrentApp, CurrentService, Service, ServiceConfig};

    fn target_with(services: Vec<Service>) -> TargetState {
        let mut target = TargetState::empty();
        target.version = 2;
        target.apps.insert(
            1001,
            App {
                app_id: 1001,
                app_name: "monitoring".into(),
                services,
            },
        );
        target
    }

    fn service(id: i64, name: &str, image: &str) -> Service {
        Service {
            service_id: id,
            service_name: name.into(),
            image_name: image.into(),
            config: ServiceConfig {
                image: image.into(),
                ..Default::default()
            },
        }
    }

    fn running(app_id: i64, svc: &Service, container_id: &str) -> CurrentState {
        let mut current = CurrentState::default();
        current.apps.insert(
            app_id,
            CurrentApp {
                app_id,
                app_name: "monitoring".into(),
                services: vec![CurrentService {
                    service_id: svc.service_id,
                    service_name: svc.service_name.clone(),
                    image_name: svc.image_name.clone(),
                    config: svc.config.clone(),
                    container_id: Some(container_id.into()),
                    status: status::RUNNING.into(),
                    created_at: None,
                    started_at: None,
                }],
            },
        );
        current
    }

    fn kinds(plan: &Plan) -> Vec<&'static str> {
        plan.steps().iter().map(|step| step.kind()).collect()
    }

    #[test]
    fn test_fresh_deploy_fetches_then_starts() {
        let svc = service(1, "nginx", "nginx@sha256:aaa");
        let target = target_with(vec![svc]);
        let plan = plan(&CurrentState::default(), &[], &target);

        assert_eq!(kinds(&plan), vec!["fetch", "startContainer"]);
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let svc = service(1, "nginx", "nginx@sha256:aaa");
        let target = target_with(vec![svc.clone()]);
        let current = running(1001, &svc, "c1");

        let plan = plan(&current, &[], &target);
        assert!(plan.is_empty(), "unexpected steps: {:?}", kinds(&plan));
    }

    #[test]
    fn test_digest_update_recreates() {
        let old = service(1, "nginx", "nginx@sha256:aaa");
        let new = service(1, "nginx", "nginx@sha256:bbb");
        let target = target_with(vec![new]);
        let current = running(1001, &old, "c1");

        let plan = plan(&current, &[], &target);
        assert_eq!(
            kinds(&plan),
            vec!["stopContainer", "removeContainer", "fetch", "startContainer"]
        );
    }

    #[test]
    fn test_orphan_is_garbage_collected() {
        let svc = service(9, "stale", "stale:1");
        let target = target_with(vec![]);
        let current = running(1001, &svc, "c9");

        let plan = plan(&current, &[], &target);
        assert_eq!(kinds(&plan), vec!["stopContainer", "removeContainer"]);
    }

    #[test]
    fn test_exited_container_restarts_without_recreate() {
        let svc = service(1, "nginx", "nginx@sha256:aaa");
        let target = target_with(vec![svc.clone()]);
        let mut current = running(1001, &svc, "c1");
        current.service_mut(1001, 1).unwrap().status = status::EXITED.into();

        let plan = plan(&current, &[], &target);
        assert_eq!(kinds(&plan), vec!["restartContainer"]);
    }

    #[test]
    fn test_network_ordering_create_first_remove_last() {
        let mut svc = service(1, "api", "api:1");
        svc.config.networks.insert("backend".into());
        let target = target_with(vec![svc]);

        let stale = ManagedNetwork {
            id: "n0".into(),
            app_id: 1001,
            name: "legacy".into(),
        };
        let plan = plan(&CurrentState::default(), &[stale], &target);

        let kinds = kinds(&plan);
        assert_eq!(
            kinds,
            vec!["createNetwork", "fetch", "startContainer", "removeNetwork"]
        );
        assert_eq!(
            plan.create_networks[0],
            Step::CreateNetwork {
                app_id: 1001,
                name: "backend".into()
            }
        );
        assert_eq!(
            plan.remove_networks[0],
            Step::RemoveNetwork {
                app_id: 1001,
                name: "legacy".into()
            }
        );
    }

    #[test]
    fn test_existing_network_not_recreated() {
        let mut svc = service(1, "api", "api:1");
        svc.config.networks.insert("backend".into());
        let target = target_with(vec![svc.clone()]);

        let mut current = running(1001, &svc, "c1");
        current
            .service_mut(1001, 1)
            .unwrap()
            .config
            .networks
            .insert("backend".into());
        let existing = ManagedNetwork {
            id: "n1".into(),
            app_id: 1001,
            name: "backend".into(),
        };

        let plan = plan(&current, &[existing], &target);
        assert!(plan.is_empty(), "unexpected steps: {:?}", kinds(&plan));
    }

    #[test]
    fn test_shared_image_fetched_once() {
        let a = service(1, "worker-a", "worker:2");
        let b = service(2, "worker-b", "worker:2");
        let target = target_with(vec![a, b]);

        let plan = plan(&CurrentState::default(), &[], &target);
        let fetches = plan
            .steps()
            .iter()
            .filter(|step| step.kind() == "fetch")
            .count();
        assert_eq!(fetches, 1);
        assert_eq!(plan.step_count(), 3);
    }

    #[test]
    fn test_runtime_env_does_not_trigger_recreate() {
        let svc = service(1, "nginx", "nginx@sha256:aaa");
        let target = target_with(vec![svc.clone()]);

        let mut current = running(1001, &svc, "c1");
        current
            .service_mut(1001, 1)
            .unwrap()
            .config
            .environment
            .insert("PATH".into(), "/usr/local/sbin:/usr/local/bin".into());

        let plan = plan(&current, &[], &target);
        assert!(plan.is_empty());
    }
}
