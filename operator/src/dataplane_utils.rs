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

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort,
        ServiceSpec,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use kube::core::ObjectMeta;

use crate::{
    consts::*,
    controlplane_utils::set_deployment_defaults,
    crd::{DataPlane, DataPlaneOptions},
    metadata::{child_meta, namespaced_name, owner_labels, uid},
    store::ObjectStore,
    Result,
};

// Fills in the replica count, the proxy image and the DB-less mode. Explicit
// values are kept.
pub fn set_data_plane_defaults(options: &mut DataPlaneOptions) -> bool {
    let deployment = &mut options.deployment;
    let mut changed = set_deployment_defaults(
        deployment,
        DEFAULT_DATAPLANE_BASE_IMAGE,
        DEFAULT_DATAPLANE_TAG,
    );
    if !deployment.has_env(ENV_KONG_DATABASE) {
        deployment.env.push(EnvVar {
            name: ENV_KONG_DATABASE.to_string(),
            value: Some("off".to_string()),
            ..Default::default()
        });
        changed = true;
    }
    changed
}

// Selector of the proxy Service of a DataPlane.
pub fn proxy_service_labels(dp: &DataPlane) -> Result<BTreeMap<String, String>> {
    let mut labels = owner_labels(DATAPLANE_MANAGED_LABEL_VALUE, &uid(dp)?);
    labels.insert(
        DATAPLANE_SERVICE_TYPE_LABEL.to_string(),
        DATAPLANE_PROXY_SERVICE_LABEL_VALUE.to_string(),
    );
    Ok(labels)
}

pub async fn list_proxy_services<S: ObjectStore>(store: &S, dp: &DataPlane) -> Result<Vec<Service>> {
    let key = namespaced_name(dp)?;
    store
        .list::<Service>(Some(&key.namespace), &proxy_service_labels(dp)?)
        .await
}

fn pod_labels(dp: &DataPlane) -> Result<BTreeMap<String, String>> {
    Ok(BTreeMap::from([(
        APP_LABEL.to_string(),
        namespaced_name(dp)?.name,
    )]))
}

fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub fn generate_deployment(dp: &DataPlane) -> Result<Deployment> {
    let mut options = dp.spec.options.clone();
    set_data_plane_defaults(&mut options);
    let options = options.deployment;

    let pod_labels = pod_labels(dp)?;
    let mut metadata = child_meta(dp, DATAPLANE_MANAGED_LABEL_VALUE, true)?;
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(pod_labels.clone());

    let container = Container {
        name: DATAPLANE_PROXY_CONTAINER_NAME.to_string(),
        image: options.image(),
        env: Some(options.env.clone()),
        env_from: (!options.env_from.is_empty()).then(|| options.env_from.clone()),
        ports: Some(vec![
            tcp_port("proxy", DATAPLANE_PROXY_PORT),
            tcp_port("proxy-ssl", DATAPLANE_PROXY_SSL_PORT),
            tcp_port("admin-ssl", DATAPLANE_ADMIN_API_PORT),
            tcp_port("metrics", DATAPLANE_METRICS_PORT),
        ]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: options.replicas,
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub fn generate_proxy_service(dp: &DataPlane) -> Result<Service> {
    let mut metadata = child_meta(dp, DATAPLANE_MANAGED_LABEL_VALUE, true)?;
    metadata.labels = Some(proxy_service_labels(dp)?);

    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(pod_labels(dp)?),
            ports: Some(vec![
                service_port("proxy", 80, DATAPLANE_PROXY_PORT),
                service_port("proxy-ssl", 443, DATAPLANE_PROXY_SSL_PORT),
                service_port("admin", DATAPLANE_ADMIN_API_PORT, DATAPLANE_ADMIN_API_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// Addresses a Service can be reached at: the load balancer ingress IPs first,
// then the cluster IP.
pub fn service_addresses(service: &Service) -> Vec<String> {
    let ingress_ips = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| ingress.ip.clone());
    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None");
    ingress_ips.chain(cluster_ip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DataPlaneSpec;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn dataplane() -> DataPlane {
        let mut dp = DataPlane::new("dp", DataPlaneSpec::default());
        dp.metadata.namespace = Some("default".to_string());
        dp.metadata.uid = Some("dp-uid".to_string());
        dp
    }

    #[test]
    fn deployment_runs_db_less_proxy() {
        let deployment = generate_deployment(&dataplane()).unwrap();
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, "proxy");
        assert_eq!(container.image.as_deref(), Some("kong:3.2"));
        let db = container
            .env
            .iter()
            .flatten()
            .find(|e| e.name == ENV_KONG_DATABASE)
            .and_then(|e| e.value.as_deref());
        assert_eq!(db, Some("off"));
    }

    #[test]
    fn proxy_service_is_labelled_for_discovery() {
        let svc = generate_proxy_service(&dataplane()).unwrap();
        let labels = svc.metadata.labels.unwrap();
        assert_eq!(
            labels.get(DATAPLANE_SERVICE_TYPE_LABEL).map(String::as_str),
            Some("proxy")
        );
        assert_eq!(labels.get(OWNER_UID_LABEL).map(String::as_str), Some("dp-uid"));
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
    }

    #[test]
    fn addresses_prefer_load_balancer_ingress() {
        let mut svc = generate_proxy_service(&dataplane()).unwrap();
        assert!(service_addresses(&svc).is_empty());

        svc.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.10".to_string());
        assert_eq!(service_addresses(&svc), vec!["10.96.0.10"]);

        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("172.18.0.100".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert_eq!(service_addresses(&svc), vec!["172.18.0.100", "10.96.0.10"]);
    }
}
