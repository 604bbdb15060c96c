/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Convergence of a single owned child.
//!
//! Every child an owner manages has a role (its proxy Service, its Deployment,
//! its ClusterRole...) and at most one live object per role is expected. The
//! synchronizer is handed the desired object and the observed candidates for
//! that role, and creates, updates or leaves it alone. More than one candidate
//! is reported as an error and never resolved by picking one.
//!
//! The field diffs below only look at fields the operator sets itself, so that
//! values defaulted by the API server never cause an update loop.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Container, PodSpec, Service, ServicePort},
    networking::v1::NetworkPolicy,
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::{
    metadata::merge_meta,
    store::{Object, ObjectStore},
    Error, Result,
};

#[derive(Debug)]
pub enum SyncOutcome<K> {
    Created(K),
    Updated(K),
    Unchanged(K),
}

impl<K> SyncOutcome<K> {
    pub fn changed(&self) -> bool {
        !matches!(self, SyncOutcome::Unchanged(_))
    }

    pub fn inner(&self) -> &K {
        match self {
            SyncOutcome::Created(k) | SyncOutcome::Updated(k) | SyncOutcome::Unchanged(k) => k,
        }
    }

    pub fn into_inner(self) -> K {
        match self {
            SyncOutcome::Created(k) | SyncOutcome::Updated(k) | SyncOutcome::Unchanged(k) => k,
        }
    }
}

// Converges the observed candidates for one child role towards `desired`.
//
// `diff` copies the kind specific fields it owns from the desired object onto
// the existing one and returns true if it changed anything. Labels,
// annotations and owner references are always reconciled.
pub async fn sync_child<S, K, F>(
    store: &S,
    owner: &str,
    desired: K,
    mut existing: Vec<K>,
    diff: F,
) -> Result<SyncOutcome<K>>
where
    S: ObjectStore,
    K: Object,
    F: FnOnce(&mut K, &K) -> bool,
{
    match existing.len() {
        0 => {
            let created = store.create(&desired).await?;
            debug!(kind = %K::kind(&()), name = created.name_any(), owner, "child created");
            Ok(SyncOutcome::Created(created))
        }
        1 => {
            let mut current = existing.remove(0);
            let meta_changed = merge_meta(current.meta_mut(), desired.meta());
            let fields_changed = diff(&mut current, &desired);
            if meta_changed || fields_changed {
                let updated = store.update(&current).await?;
                debug!(kind = %K::kind(&()), name = updated.name_any(), owner, "child updated");
                Ok(SyncOutcome::Updated(updated))
            } else {
                Ok(SyncOutcome::Unchanged(current))
            }
        }
        count => Err(Error::TooManyChildren {
            kind: K::kind(&()).to_string(),
            owner: owner.to_string(),
            count,
        }),
    }
}

// Lists the candidates selected by `labels` and synchronizes them.
pub async fn sync_owned<S, K, F>(
    store: &S,
    owner: &str,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
    desired: K,
    diff: F,
) -> Result<SyncOutcome<K>>
where
    S: ObjectStore,
    K: Object,
    F: FnOnce(&mut K, &K) -> bool,
{
    let existing = store.list::<K>(namespace, labels).await?;
    sync_child(store, owner, desired, existing, diff).await
}

// Metadata only kinds (ServiceAccount, Secret).
pub fn no_field_diff<K>(_: &mut K, _: &K) -> bool {
    false
}

fn set_if_different<T: PartialEq + Clone>(current: &mut T, desired: &T) -> bool {
    if current != desired {
        *current = desired.clone();
        return true;
    }
    false
}

fn container_differs(current: &Container, desired: &Container) -> bool {
    let ports = |c: &Container| {
        c.ports
            .iter()
            .flatten()
            .map(|p| (p.name.clone(), p.container_port, p.protocol.clone()))
            .collect::<Vec<_>>()
    };
    current.image != desired.image
        || current.env != desired.env
        || current.env_from != desired.env_from
        || current.volume_mounts != desired.volume_mounts
        || ports(current) != ports(desired)
}

fn pod_spec_differs(current: &PodSpec, desired: &PodSpec) -> bool {
    if current.service_account_name != desired.service_account_name {
        return true;
    }
    for container in &desired.containers {
        match current.containers.iter().find(|c| c.name == container.name) {
            Some(existing) if !container_differs(existing, container) => {}
            _ => return true,
        }
    }
    let secret_volumes = |spec: &PodSpec| {
        spec.volumes
            .iter()
            .flatten()
            .map(|v| {
                let secret = v.secret.as_ref().and_then(|s| s.secret_name.clone());
                (v.name.clone(), secret)
            })
            .collect::<Vec<_>>()
    };
    secret_volumes(current) != secret_volumes(desired)
}

pub fn diff_deployment(current: &mut Deployment, desired: &Deployment) -> bool {
    let (Some(spec), Some(wanted)) = (current.spec.as_mut(), desired.spec.as_ref()) else {
        return set_if_different(&mut current.spec, &desired.spec);
    };

    let mut changed = set_if_different(&mut spec.replicas, &wanted.replicas);
    changed |= set_if_different(
        &mut spec.template.metadata,
        &wanted.template.metadata,
    );

    let differs = match (spec.template.spec.as_ref(), wanted.template.spec.as_ref()) {
        (Some(current), Some(desired)) => pod_spec_differs(current, desired),
        (None, None) => false,
        _ => true,
    };
    if differs {
        spec.template.spec.clone_from(&wanted.template.spec);
        changed = true;
    }
    changed
}

pub fn diff_service(current: &mut Service, desired: &Service) -> bool {
    let (Some(spec), Some(wanted)) = (current.spec.as_mut(), desired.spec.as_ref()) else {
        return set_if_different(&mut current.spec, &desired.spec);
    };

    let ports = |ports: &Option<Vec<ServicePort>>| {
        ports
            .iter()
            .flatten()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone(), p.protocol.clone()))
            .collect::<Vec<_>>()
    };

    let mut changed = set_if_different(&mut spec.type_, &wanted.type_);
    changed |= set_if_different(&mut spec.selector, &wanted.selector);
    if ports(&spec.ports) != ports(&wanted.ports) {
        spec.ports.clone_from(&wanted.ports);
        changed = true;
    }
    changed
}

pub fn diff_cluster_role(current: &mut ClusterRole, desired: &ClusterRole) -> bool {
    set_if_different(&mut current.rules, &desired.rules)
}

pub fn diff_cluster_role_binding(
    current: &mut ClusterRoleBinding,
    desired: &ClusterRoleBinding,
) -> bool {
    let changed = set_if_different(&mut current.role_ref, &desired.role_ref);
    set_if_different(&mut current.subjects, &desired.subjects) || changed
}

pub fn diff_network_policy(current: &mut NetworkPolicy, desired: &NetworkPolicy) -> bool {
    set_if_different(&mut current.spec, &desired.spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::core::ObjectMeta;

    fn service(name: &str, port: i32) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([("role".to_string(), "proxy".to_string())])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("proxy".to_string()),
                    port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("role".to_string(), "proxy".to_string())])
    }

    #[tokio::test]
    async fn creates_then_leaves_alone() {
        let store = FakeStore::default();
        let outcome = sync_owned(&store, "ns/owner", Some("ns"), &selector(), service("svc", 80), diff_service)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Created(_)));

        let outcome = sync_owned(&store, "ns/owner", Some("ns"), &selector(), service("svc", 80), diff_service)
            .await
            .unwrap();
        assert!(!outcome.changed());
        assert_eq!(store.mutations(), 1);
    }

    #[tokio::test]
    async fn updates_drifted_fields() {
        let store = FakeStore::default();
        store.seed(service("svc", 8080));

        let outcome = sync_owned(&store, "ns/owner", Some("ns"), &selector(), service("svc", 80), diff_service)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Updated(_)));
        let svc: Service = store.fetch(Some("ns"), "svc").unwrap();
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 80);
    }

    #[tokio::test]
    async fn server_defaults_are_not_drift() {
        let store = FakeStore::default();
        let mut observed = service("svc", 80);
        if let Some(spec) = observed.spec.as_mut() {
            spec.cluster_ip = Some("10.0.0.1".to_string());
            spec.session_affinity = Some("None".to_string());
        }
        store.seed(observed);

        let outcome = sync_owned(&store, "ns/owner", Some("ns"), &selector(), service("svc", 80), diff_service)
            .await
            .unwrap();
        assert!(!outcome.changed());
    }

    #[tokio::test]
    async fn more_than_one_candidate_is_an_error() {
        let store = FakeStore::default();
        store.seed(service("a", 80));
        store.seed(service("b", 80));

        let err = sync_owned(&store, "ns/owner", Some("ns"), &selector(), service("c", 80), diff_service)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyChildren { count: 2, .. }));
        assert_eq!(store.mutations(), 0);
    }
}
