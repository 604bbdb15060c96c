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

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, Secret,
        SecretVolumeSource, ServiceAccount, Volume, VolumeMount,
    },
    rbac::v1::{ClusterRole, ClusterRoleBinding, RoleRef, Subject},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;

use crate::{
    certificate::IssuedCertificate,
    clusterroles::rules_for_controller,
    consts::*,
    crd::{ControlPlane, ControlPlaneOptions, DeploymentOptions},
    metadata::{child_meta, namespaced_name},
    Result,
};

// -----------------------------------------------------------------------------
// Defaults
// -----------------------------------------------------------------------------

fn field_ref(path: &str) -> EnvVarSource {
    EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            api_version: Some("v1".to_string()),
            field_path: path.to_string(),
        }),
        ..Default::default()
    }
}

// Appends `var` unless a variable of the same name is already declared.
fn default_env(env: &mut Vec<EnvVar>, var: EnvVar) -> bool {
    if env.iter().any(|e| e.name == var.name) {
        return false;
    }
    env.push(var);
    true
}

fn value_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

// Keeps a DataPlane derived variable in step with `var`. A variable declared
// without being listed in `derived` belongs to the user and is left alone.
fn derive_env(env: &mut Vec<EnvVar>, derived: &mut BTreeSet<String>, var: EnvVar) -> bool {
    match env.iter_mut().find(|e| e.name == var.name) {
        None => {
            derived.insert(var.name.clone());
            env.push(var);
            true
        }
        Some(existing) if derived.contains(&var.name) => {
            if *existing == var {
                return false;
            }
            *existing = var;
            true
        }
        Some(_) => false,
    }
}

fn drop_derived_env(env: &mut Vec<EnvVar>, derived: &mut BTreeSet<String>, name: &str) -> bool {
    if !derived.remove(name) {
        return false;
    }
    env.retain(|e| e.name != name);
    true
}

/// Names of the env vars recorded as derived on a ControlPlane.
pub fn derived_env(meta: &ObjectMeta) -> BTreeSet<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(DERIVED_ENV_ANNOTATION))
        .map(|names| {
            names
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn set_derived_env(meta: &mut ObjectMeta, derived: &BTreeSet<String>) {
    if derived.is_empty() {
        if let Some(annotations) = meta.annotations.as_mut() {
            annotations.remove(DERIVED_ENV_ANNOTATION);
        }
        return;
    }
    let names: Vec<&str> = derived.iter().map(String::as_str).collect();
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DERIVED_ENV_ANNOTATION.to_string(), names.join(","));
}

pub fn controller_publish_service(service: &str, namespace: &str) -> String {
    format!("{namespace}/{service}")
}

pub fn controller_kong_admin_url(service: &str, namespace: &str) -> String {
    format!("https://{service}.{namespace}.svc:{DATAPLANE_ADMIN_API_PORT}")
}

// Fills in everything the controller container needs and the user left out.
// Values the user declared are never touched. The publish service and admin
// URL follow the DataPlane: the names in `derived` are recomputed every pass
// and removed once no DataPlane is set. Returns true if the options or
// `derived` changed.
pub fn set_control_plane_defaults(
    options: &mut ControlPlaneOptions,
    namespace: &str,
    dataplane_service: &str,
    controller_name: &str,
    derived: &mut BTreeSet<String>,
) -> bool {
    let dataplane_is_set = options.data_plane.as_deref().is_some_and(|n| !n.is_empty());
    let deployment = &mut options.deployment;
    let mut changed = set_deployment_defaults(
        deployment,
        DEFAULT_CONTROLPLANE_BASE_IMAGE,
        DEFAULT_CONTROLPLANE_TAG,
    );

    let env = &mut deployment.env;
    changed |= default_env(
        env,
        EnvVar {
            name: ENV_POD_NAMESPACE.to_string(),
            value_from: Some(field_ref("metadata.namespace")),
            ..Default::default()
        },
    );
    changed |= default_env(
        env,
        EnvVar {
            name: ENV_POD_NAME.to_string(),
            value_from: Some(field_ref("metadata.name")),
            ..Default::default()
        },
    );
    changed |= default_env(
        env,
        value_env(ENV_CONTROLLER_NAME, controller_name.to_string()),
    );
    for (name, value) in [
        (
            ENV_PUBLISH_SERVICE,
            controller_publish_service(dataplane_service, namespace),
        ),
        (
            ENV_KONG_ADMIN_URL,
            controller_kong_admin_url(dataplane_service, namespace),
        ),
    ] {
        if !dataplane_is_set {
            changed |= drop_derived_env(env, derived, name);
        } else if !namespace.is_empty() && !dataplane_service.is_empty() {
            changed |= derive_env(env, derived, value_env(name, value));
        }
    }
    for (name, path) in [
        (ENV_KONG_ADMIN_TLS_CLIENT_CERT_FILE, TLS_CERT_PATH),
        (ENV_KONG_ADMIN_TLS_CLIENT_KEY_FILE, TLS_KEY_PATH),
        (ENV_KONG_ADMIN_CA_CERT_FILE, TLS_CA_PATH),
    ] {
        changed |= default_env(env, value_env(name, path.to_string()));
    }

    changed
}

// Replica count, image and version defaults shared by every deployment option set.
pub fn set_deployment_defaults(options: &mut DeploymentOptions, image: &str, tag: &str) -> bool {
    let mut changed = false;
    if options.replicas.is_none() {
        options.replicas = Some(1);
        changed = true;
    }
    if options.container_image.as_deref().unwrap_or_default().is_empty() {
        options.container_image = Some(image.to_string());
        changed = true;
    }
    if options.version.as_deref().unwrap_or_default().is_empty() {
        options.version = Some(tag.to_string());
        changed = true;
    }
    changed
}

fn sorted_env(env: &[EnvVar], ignore: &[&str]) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = env
        .iter()
        .filter(|e| !ignore.contains(&e.name.as_str()))
        .cloned()
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env
}

// Compares two option sets, ignoring env ordering and the given variables.
pub fn control_plane_options_equal(
    a: &ControlPlaneOptions,
    b: &ControlPlaneOptions,
    ignore_env: &[&str],
) -> bool {
    a.data_plane == b.data_plane && deployment_options_equal(&a.deployment, &b.deployment, ignore_env)
}

pub fn deployment_options_equal(
    a: &DeploymentOptions,
    b: &DeploymentOptions,
    ignore_env: &[&str],
) -> bool {
    a.replicas == b.replicas
        && a.container_image == b.container_image
        && a.version == b.version
        && a.env_from == b.env_from
        && sorted_env(&a.env, ignore_env) == sorted_env(&b.env, ignore_env)
}

// A Deployment is ready once it runs pods and all requested replicas are
// available.
pub fn deployment_is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    deployment.status.as_ref().is_some_and(|status| {
        status.replicas.unwrap_or_default() > 0
            && status.available_replicas.unwrap_or_default() >= desired
    })
}

// -----------------------------------------------------------------------------
// Generators
// -----------------------------------------------------------------------------

fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

pub fn generate_service_account(cp: &ControlPlane) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: child_meta(cp, CONTROLPLANE_MANAGED_LABEL_VALUE, true)?,
        ..Default::default()
    })
}

pub fn generate_cluster_role(cp: &ControlPlane) -> Result<ClusterRole> {
    let deployment = &cp.spec.options.deployment;
    Ok(ClusterRole {
        metadata: child_meta(cp, CONTROLPLANE_MANAGED_LABEL_VALUE, false)?,
        rules: Some(rules_for_controller(
            deployment.container_image.as_deref(),
            deployment.version.as_deref(),
        )?),
        ..Default::default()
    })
}

pub fn generate_cluster_role_binding(
    cp: &ControlPlane,
    cluster_role: &str,
    service_account: &str,
) -> Result<ClusterRoleBinding> {
    let key = namespaced_name(cp)?;
    Ok(ClusterRoleBinding {
        metadata: child_meta(cp, CONTROLPLANE_MANAGED_LABEL_VALUE, false)?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(key.namespace),
            ..Default::default()
        }]),
    })
}

// The certificate Secret. Without an issued certificate only the metadata is
// set, which is all that is reconciled on an existing Secret.
pub fn generate_certificate_secret(
    cp: &ControlPlane,
    issued: Option<&IssuedCertificate>,
) -> Result<Secret> {
    Ok(Secret {
        metadata: child_meta(cp, CONTROLPLANE_MANAGED_LABEL_VALUE, true)?,
        type_: Some("kubernetes.io/tls".to_string()),
        data: issued.map(IssuedCertificate::secret_data),
        ..Default::default()
    })
}

pub fn generate_deployment(
    cp: &ControlPlane,
    image: &str,
    service_account: &str,
    certificate_secret: &str,
    dataplane_is_set: bool,
) -> Result<Deployment> {
    let key = namespaced_name(cp)?;
    let options = &cp.spec.options.deployment;
    let mut metadata = child_meta(cp, CONTROLPLANE_MANAGED_LABEL_VALUE, true)?;
    let pod_labels = BTreeMap::from([(APP_LABEL.to_string(), key.name.clone())]);
    let mut labels = labels_of(&metadata);
    labels.extend(pod_labels.clone());
    metadata.labels = Some(labels);

    // Without a DataPlane the controller has nothing to configure; it stays
    // dormant at zero replicas instead of being deleted.
    let replicas = if dataplane_is_set {
        options.replicas.unwrap_or(1)
    } else {
        0
    };

    let container = Container {
        name: CONTROLPLANE_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        env: (!options.env.is_empty()).then(|| options.env.clone()),
        env_from: (!options.env_from.is_empty()).then(|| options.env_from.clone()),
        volume_mounts: Some(vec![VolumeMount {
            name: CLUSTER_CERTIFICATE_VOLUME_NAME.to_string(),
            mount_path: CLUSTER_CERTIFICATE_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
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
                    service_account_name: Some(service_account.to_string()),
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: CLUSTER_CERTIFICATE_VOLUME_NAME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(certificate_secret.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_value<'a>(options: &'a ControlPlaneOptions, name: &str) -> Option<&'a str> {
        options.deployment.env_value(name)
    }

    fn with_dataplane(name: &str) -> ControlPlaneOptions {
        ControlPlaneOptions {
            data_plane: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_in_the_env_contract() {
        let mut options = with_dataplane("dp");
        let mut derived = BTreeSet::new();
        assert!(set_control_plane_defaults(
            &mut options,
            "default",
            "proxy-svc",
            DEFAULT_CONTROLLER_NAME,
            &mut derived,
        ));

        assert_eq!(
            env_value(&options, ENV_PUBLISH_SERVICE),
            Some("default/proxy-svc")
        );
        assert_eq!(
            env_value(&options, ENV_KONG_ADMIN_URL),
            Some("https://proxy-svc.default.svc:8444")
        );
        assert_eq!(
            env_value(&options, ENV_KONG_ADMIN_TLS_CLIENT_CERT_FILE),
            Some("/var/cluster-certificate/tls.crt")
        );
        assert_eq!(
            env_value(&options, ENV_KONG_ADMIN_TLS_CLIENT_KEY_FILE),
            Some("/var/cluster-certificate/tls.key")
        );
        assert_eq!(
            env_value(&options, ENV_KONG_ADMIN_CA_CERT_FILE),
            Some("/var/cluster-certificate/ca.crt")
        );
        assert_eq!(
            env_value(&options, ENV_CONTROLLER_NAME),
            Some(DEFAULT_CONTROLLER_NAME)
        );
        let pod_namespace = options
            .deployment
            .env
            .iter()
            .find(|e| e.name == ENV_POD_NAMESPACE)
            .and_then(|e| e.value_from.as_ref())
            .and_then(|s| s.field_ref.as_ref())
            .map(|f| f.field_path.as_str());
        assert_eq!(pod_namespace, Some("metadata.namespace"));
        assert_eq!(options.deployment.replicas, Some(1));
        assert_eq!(
            options.deployment.image().as_deref(),
            Some("kong/kubernetes-ingress-controller:2.9.3")
        );

        assert_eq!(
            derived,
            BTreeSet::from([ENV_KONG_ADMIN_URL.to_string(), ENV_PUBLISH_SERVICE.to_string()])
        );

        // A second pass is a no-op.
        assert!(!set_control_plane_defaults(
            &mut options,
            "default",
            "proxy-svc",
            DEFAULT_CONTROLLER_NAME,
            &mut derived,
        ));
    }

    #[test]
    fn defaults_never_override_explicit_values() {
        let mut options = with_dataplane("dp");
        let mut derived = BTreeSet::new();
        options.deployment.env = vec![
            value_env(ENV_PUBLISH_SERVICE, "custom/svc".to_string()),
            value_env(ENV_CONTROLLER_NAME, "example.com/other".to_string()),
        ];
        options.deployment.replicas = Some(3);

        for service in ["proxy-svc", "another-svc"] {
            set_control_plane_defaults(
                &mut options,
                "default",
                service,
                DEFAULT_CONTROLLER_NAME,
                &mut derived,
            );
        }
        options.data_plane = None;
        set_control_plane_defaults(&mut options, "default", "", DEFAULT_CONTROLLER_NAME, &mut derived);

        assert_eq!(env_value(&options, ENV_PUBLISH_SERVICE), Some("custom/svc"));
        assert_eq!(
            env_value(&options, ENV_CONTROLLER_NAME),
            Some("example.com/other")
        );
        assert_eq!(options.deployment.replicas, Some(3));
        assert!(!derived.contains(ENV_PUBLISH_SERVICE));
        assert_eq!(
            options
                .deployment
                .env
                .iter()
                .filter(|e| e.name == ENV_PUBLISH_SERVICE)
                .count(),
            1
        );
    }

    #[test]
    fn admin_url_needs_a_service() {
        let mut options = with_dataplane("dp");
        let mut derived = BTreeSet::new();
        set_control_plane_defaults(&mut options, "default", "", DEFAULT_CONTROLLER_NAME, &mut derived);
        assert!(!options.deployment.has_env(ENV_KONG_ADMIN_URL));
        assert!(!options.deployment.has_env(ENV_PUBLISH_SERVICE));
        assert!(derived.is_empty());
    }

    #[test]
    fn derived_env_follows_the_dataplane() {
        let mut options = with_dataplane("dp-a");
        let mut derived = BTreeSet::new();
        set_control_plane_defaults(&mut options, "default", "svc-a", DEFAULT_CONTROLLER_NAME, &mut derived);

        options.data_plane = Some("dp-b".to_string());
        assert!(set_control_plane_defaults(
            &mut options,
            "default",
            "svc-b",
            DEFAULT_CONTROLLER_NAME,
            &mut derived,
        ));
        assert_eq!(env_value(&options, ENV_PUBLISH_SERVICE), Some("default/svc-b"));
        assert_eq!(
            env_value(&options, ENV_KONG_ADMIN_URL),
            Some("https://svc-b.default.svc:8444")
        );

        options.data_plane = None;
        assert!(set_control_plane_defaults(
            &mut options,
            "default",
            "",
            DEFAULT_CONTROLLER_NAME,
            &mut derived,
        ));
        assert!(!options.deployment.has_env(ENV_PUBLISH_SERVICE));
        assert!(!options.deployment.has_env(ENV_KONG_ADMIN_URL));
        assert!(options.deployment.has_env(ENV_CONTROLLER_NAME));
        assert!(derived.is_empty());
    }

    #[test]
    fn derived_env_names_round_trip_through_the_annotation() {
        let mut meta = ObjectMeta::default();
        assert!(derived_env(&meta).is_empty());

        let derived = BTreeSet::from([ENV_PUBLISH_SERVICE.to_string(), ENV_KONG_ADMIN_URL.to_string()]);
        set_derived_env(&mut meta, &derived);
        assert_eq!(derived_env(&meta), derived);

        set_derived_env(&mut meta, &BTreeSet::new());
        assert!(!meta.annotations.unwrap().contains_key(DERIVED_ENV_ANNOTATION));
    }

    #[test]
    fn options_equality_ignores_order_and_admin_url() {
        let mut a = with_dataplane("dp");
        set_control_plane_defaults(
            &mut a,
            "default",
            "svc-a",
            DEFAULT_CONTROLLER_NAME,
            &mut BTreeSet::new(),
        );
        let mut b = a.clone();
        b.deployment.env.reverse();
        assert!(control_plane_options_equal(&a, &b, &[]));

        for var in b.deployment.env.iter_mut() {
            if var.name == ENV_KONG_ADMIN_URL {
                var.value = Some("https://10-0-0-1.svc-a.default.svc:8444".to_string());
            }
        }
        assert!(!control_plane_options_equal(&a, &b, &[]));
        assert!(control_plane_options_equal(&a, &b, &[ENV_KONG_ADMIN_URL]));

        b.data_plane = Some("dp-b".to_string());
        assert!(!control_plane_options_equal(&a, &b, &[ENV_KONG_ADMIN_URL]));
    }
}
