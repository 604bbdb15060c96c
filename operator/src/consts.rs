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

use std::time::Duration;

// Default controller name for GatewayClasses handled by this operator.
pub const DEFAULT_CONTROLLER_NAME: &str = "konghq.com/gateway-operator";

// API group of the operator's own resources.
pub const OPERATOR_API_GROUP: &str = "gateway-operator.konghq.com";

// Kind that a GatewayClass parametersRef must point to.
pub const GATEWAY_CONFIGURATION_KIND: &str = "GatewayConfiguration";

// -----------------------------------------------------------------------------
// Labels and annotations
// -----------------------------------------------------------------------------

// Label key marking an object as managed by the operator. The value names the
// controller family which owns it.
pub const GATEWAY_OPERATOR_CONTROLLED_LABEL: &str = "konghq.com/gateway-operator";

pub const CONTROLPLANE_MANAGED_LABEL_VALUE: &str = "controlplane";
pub const DATAPLANE_MANAGED_LABEL_VALUE: &str = "dataplane";
pub const GATEWAY_MANAGED_LABEL_VALUE: &str = "gateway";

// Label identifying which role a DataPlane owned Service plays.
pub const DATAPLANE_SERVICE_TYPE_LABEL: &str = "konghq.com/dataplane-service-type";
pub const DATAPLANE_PROXY_SERVICE_LABEL_VALUE: &str = "proxy";

// Cluster-scoped objects can't carry an owner reference to a namespaced owner,
// so they are tied to the owner through its UID...
pub const OWNER_UID_LABEL: &str = "gateway-operator.konghq.com/owner-uid";
// ...and carry "<namespace>/<name>" of the owner so watch events can be mapped back.
pub const OWNER_ANNOTATION: &str = "gateway-operator.konghq.com/owner";

// Comma separated names of the ControlPlane env vars the operator derived from
// the DataPlane; any other declared variable is user owned.
pub const DERIVED_ENV_ANNOTATION: &str = "gateway-operator.konghq.com/derived-env";

// Pod label used to select the pods of a DataPlane or ControlPlane.
pub const APP_LABEL: &str = "app";

// -----------------------------------------------------------------------------
// Finalizers
// -----------------------------------------------------------------------------

pub const CONTROLPLANE_FINALIZER_CLEANUP_CLUSTER_ROLE: &str =
    "gateway-operator.konghq.com/cleanup-clusterrole";
pub const CONTROLPLANE_FINALIZER_CLEANUP_CLUSTER_ROLE_BINDING: &str =
    "gateway-operator.konghq.com/cleanup-clusterrolebinding";

pub const GATEWAY_FINALIZER_CLEANUP_DATAPLANES: &str =
    "gateway-operator.konghq.com/cleanup-dataplanes";
pub const GATEWAY_FINALIZER_CLEANUP_CONTROLPLANES: &str =
    "gateway-operator.konghq.com/cleanup-controlplanes";
pub const GATEWAY_FINALIZER_CLEANUP_NETWORK_POLICIES: &str =
    "gateway-operator.konghq.com/cleanup-network-policies";

// -----------------------------------------------------------------------------
// ControlPlane
// -----------------------------------------------------------------------------

pub const CONTROLPLANE_CONTAINER_NAME: &str = "controller";
pub const DEFAULT_CONTROLPLANE_BASE_IMAGE: &str = "kong/kubernetes-ingress-controller";
pub const DEFAULT_CONTROLPLANE_TAG: &str = "2.9.3";

// Environment contract between the operator and the controller image.
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_CONTROLLER_NAME: &str = "CONTROLLER_GATEWAY_API_CONTROLLER_NAME";
pub const ENV_PUBLISH_SERVICE: &str = "CONTROLLER_PUBLISH_SERVICE";
pub const ENV_KONG_ADMIN_URL: &str = "CONTROLLER_KONG_ADMIN_URL";
pub const ENV_KONG_ADMIN_TLS_CLIENT_CERT_FILE: &str = "CONTROLLER_KONG_ADMIN_TLS_CLIENT_CERT_FILE";
pub const ENV_KONG_ADMIN_TLS_CLIENT_KEY_FILE: &str = "CONTROLLER_KONG_ADMIN_TLS_CLIENT_KEY_FILE";
pub const ENV_KONG_ADMIN_CA_CERT_FILE: &str = "CONTROLLER_KONG_ADMIN_CA_CERT_FILE";

pub const CLUSTER_CERTIFICATE_VOLUME_NAME: &str = "cluster-certificate";
pub const CLUSTER_CERTIFICATE_MOUNT_PATH: &str = "/var/cluster-certificate";
pub const TLS_CERT_PATH: &str = "/var/cluster-certificate/tls.crt";
pub const TLS_KEY_PATH: &str = "/var/cluster-certificate/tls.key";
pub const TLS_CA_PATH: &str = "/var/cluster-certificate/ca.crt";

// -----------------------------------------------------------------------------
// DataPlane
// -----------------------------------------------------------------------------

pub const DATAPLANE_PROXY_CONTAINER_NAME: &str = "proxy";
pub const DEFAULT_DATAPLANE_BASE_IMAGE: &str = "kong";
pub const DEFAULT_DATAPLANE_TAG: &str = "3.2";

pub const ENV_KONG_DATABASE: &str = "KONG_DATABASE";

pub const DATAPLANE_ADMIN_API_PORT: i32 = 8444;
pub const DATAPLANE_PROXY_PORT: i32 = 8000;
pub const DATAPLANE_PROXY_SSL_PORT: i32 = 8443;
pub const DATAPLANE_METRICS_PORT: i32 = 8100;

// -----------------------------------------------------------------------------
// Reconciliation
// -----------------------------------------------------------------------------

// Retry delay used after an optimistic concurrency conflict.
pub const REQUEUE_WITHOUT_BACKOFF: Duration = Duration::from_millis(200);

// Delay applied by the error policies of all controllers.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);
