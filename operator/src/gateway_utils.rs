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

use std::collections::{BTreeMap, BTreeSet};

use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass,
    gateways::{Gateway, GatewayStatusAddresses},
};
use k8s_openapi::api::{
    core::v1::Service,
    networking::v1::{
        NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
        NetworkPolicySpec,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use kube::ResourceExt;

use crate::{
    consts::*,
    controlplane_utils::{set_control_plane_defaults, set_derived_env},
    crd::{
        ControlPlane, ControlPlaneOptions, ControlPlaneSpec, DataPlane, DataPlaneOptions,
        DataPlaneSpec, GatewayConfiguration,
    },
    dataplane_utils::{service_addresses, set_data_plane_defaults},
    metadata::{child_meta, namespaced_name},
    store::ObjectStore,
    Error, Result,
};

// Resolves the GatewayConfiguration a GatewayClass points to. A class without
// a parametersRef uses the defaults.
pub async fn gateway_configuration<S: ObjectStore>(
    store: &S,
    gateway_class: &GatewayClass,
    gateway_namespace: &str,
) -> Result<Option<GatewayConfiguration>> {
    let Some(params) = gateway_class.spec.parameters_ref.as_ref() else {
        return Ok(None);
    };

    if params.group != OPERATOR_API_GROUP || params.kind != GATEWAY_CONFIGURATION_KIND {
        return Err(Error::InvalidParametersRef(format!(
            "controller only supports {OPERATOR_API_GROUP} {GATEWAY_CONFIGURATION_KIND} resources, got {} {}",
            params.group, params.kind
        )));
    }
    if params.name.is_empty() {
        return Err(Error::InvalidParametersRef(format!(
            "GatewayClass {} has a parametersRef without a name",
            gateway_class.name_any()
        )));
    }

    let namespace = params
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(gateway_namespace);
    store
        .get::<GatewayConfiguration>(Some(namespace), &params.name)
        .await?
        .map(Some)
        .ok_or_else(|| {
            Error::InvalidConfigError(format!(
                "GatewayConfiguration {namespace}/{} not found",
                params.name
            ))
        })
}

// DataPlane options expected for Gateways using `config`, with defaults applied.
pub fn expected_dataplane_options(config: Option<&GatewayConfiguration>) -> DataPlaneOptions {
    let mut options = config
        .and_then(|c| c.spec.data_plane_options.clone())
        .unwrap_or_default();
    set_data_plane_defaults(&mut options);
    options
}

// ControlPlane options expected for Gateways using `config`, pointed at the
// given DataPlane and its proxy Service, along with the env vars derived from
// them.
pub fn expected_controlplane_options(
    config: Option<&GatewayConfiguration>,
    namespace: &str,
    dataplane: &str,
    dataplane_service: &str,
    controller_name: &str,
) -> (ControlPlaneOptions, BTreeSet<String>) {
    let mut options = config
        .and_then(|c| c.spec.control_plane_options.clone())
        .unwrap_or_default();
    if options.data_plane.as_deref().unwrap_or_default().is_empty() {
        options.data_plane = Some(dataplane.to_string());
    }
    let mut derived = BTreeSet::new();
    set_control_plane_defaults(
        &mut options,
        namespace,
        dataplane_service,
        controller_name,
        &mut derived,
    );
    (options, derived)
}

pub fn generate_dataplane(gateway: &Gateway, options: DataPlaneOptions) -> Result<DataPlane> {
    let mut metadata = child_meta(gateway, GATEWAY_MANAGED_LABEL_VALUE, true)?;
    metadata.generate_name = Some(format!("{}-", gateway.name_any()));
    Ok(DataPlane {
        metadata,
        spec: DataPlaneSpec { options },
        status: None,
    })
}

pub fn generate_controlplane(
    gateway: &Gateway,
    options: ControlPlaneOptions,
    derived: &BTreeSet<String>,
) -> Result<ControlPlane> {
    let mut metadata = child_meta(gateway, GATEWAY_MANAGED_LABEL_VALUE, true)?;
    metadata.generate_name = Some(format!("{}-", gateway.name_any()));
    set_derived_env(&mut metadata, derived);
    Ok(ControlPlane {
        metadata,
        spec: ControlPlaneSpec {
            options,
            gateway_class: Some(gateway.spec.gateway_class_name.clone()),
        },
        status: None,
    })
}

fn tcp(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some("TCP".to_string()),
        port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn match_labels(key: &str, value: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Default::default()
    }
}

// Restricts the admin API of the DataPlane to the pods of its ControlPlane.
// The proxy and metrics ports stay open.
pub fn generate_network_policy(
    gateway: &Gateway,
    dataplane: &DataPlane,
    controlplane: &ControlPlane,
) -> Result<NetworkPolicy> {
    let dataplane_key = namespaced_name(dataplane)?;
    let mut metadata = child_meta(gateway, GATEWAY_MANAGED_LABEL_VALUE, true)?;
    metadata.generate_name = Some(format!("{}-limit-admin-api-", dataplane_key.name));

    let limit_admin_api = NetworkPolicyIngressRule {
        ports: Some(vec![tcp(DATAPLANE_ADMIN_API_PORT)]),
        from: Some(vec![NetworkPolicyPeer {
            pod_selector: Some(match_labels(APP_LABEL, &controlplane.name_any())),
            namespace_selector: Some(match_labels(
                "kubernetes.io/metadata.name",
                &dataplane_key.namespace,
            )),
            ..Default::default()
        }]),
    };
    let allow_proxy = NetworkPolicyIngressRule {
        ports: Some(vec![
            tcp(DATAPLANE_PROXY_PORT),
            tcp(DATAPLANE_PROXY_SSL_PORT),
        ]),
        from: None,
    };
    let allow_metrics = NetworkPolicyIngressRule {
        ports: Some(vec![tcp(DATAPLANE_METRICS_PORT)]),
        from: None,
    };

    Ok(NetworkPolicy {
        metadata,
        spec: Some(NetworkPolicySpec {
            pod_selector: match_labels(APP_LABEL, &dataplane_key.name),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![limit_admin_api, allow_proxy, allow_metrics]),
            egress: None,
        }),
        ..Default::default()
    })
}

// Gateway addresses served by the proxy Service: the first load balancer
// ingress IP, if any, followed by the cluster IP.
pub fn gateway_addresses(service: &Service) -> Result<Vec<GatewayStatusAddresses>> {
    let has_cluster_ip = service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .is_some_and(|ip| !ip.is_empty() && ip != "None");
    if !has_cluster_ip {
        return Err(Error::DataPlaneServiceError(format!(
            "service {} doesn't have a ClusterIP yet, not ready",
            service.name_any()
        )));
    }

    let mut ips = service_addresses(service);
    if ips.len() > 2 {
        // Only the first ingress IP is published next to the cluster IP.
        ips.drain(1..ips.len() - 1);
    }
    Ok(ips
        .into_iter()
        .map(|ip| GatewayStatusAddresses {
            r#type: Some("IPAddress".to_string()),
            value: ip,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use serde_json::json;

    fn gateway_class(params: serde_json::Value) -> GatewayClass {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "GatewayClass",
            "metadata": {"name": "kong"},
            "spec": {"controllerName": DEFAULT_CONTROLLER_NAME, "parametersRef": params},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn configuration_resolution() {
        let store = FakeStore::default();
        let mut config = GatewayConfiguration::new("config", Default::default());
        config.metadata.namespace = Some("default".to_string());
        store.seed(config);

        let no_ref: GatewayClass = serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "GatewayClass",
            "metadata": {"name": "kong"},
            "spec": {"controllerName": DEFAULT_CONTROLLER_NAME},
        }))
        .unwrap();
        assert!(gateway_configuration(&store, &no_ref, "default")
            .await
            .unwrap()
            .is_none());

        let valid = gateway_class(json!({
            "group": OPERATOR_API_GROUP,
            "kind": GATEWAY_CONFIGURATION_KIND,
            "name": "config",
        }));
        assert!(gateway_configuration(&store, &valid, "default")
            .await
            .unwrap()
            .is_some());
        assert!(matches!(
            gateway_configuration(&store, &valid, "other").await,
            Err(Error::InvalidConfigError(_))
        ));

        let wrong_kind = gateway_class(json!({
            "group": "",
            "kind": "ConfigMap",
            "name": "config",
        }));
        assert!(matches!(
            gateway_configuration(&store, &wrong_kind, "default").await,
            Err(Error::InvalidParametersRef(_))
        ));
    }

    #[test]
    fn addresses_need_a_cluster_ip() {
        let mut service = Service {
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        };
        assert!(matches!(
            gateway_addresses(&service),
            Err(Error::DataPlaneServiceError(_))
        ));

        service.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.10".to_string());
        let addresses = gateway_addresses(&service).unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].value, "10.96.0.10");
        assert_eq!(addresses[0].r#type.as_deref(), Some("IPAddress"));
    }

    #[test]
    fn controlplane_options_point_at_the_dataplane() {
        let (options, derived) =
            expected_controlplane_options(None, "default", "gw-dp", "gw-svc", DEFAULT_CONTROLLER_NAME);
        assert_eq!(options.data_plane.as_deref(), Some("gw-dp"));
        assert_eq!(
            options.deployment.env_value(ENV_PUBLISH_SERVICE),
            Some("default/gw-svc")
        );
        assert!(derived.contains(ENV_PUBLISH_SERVICE));
        assert!(derived.contains(ENV_KONG_ADMIN_URL));
    }
}
