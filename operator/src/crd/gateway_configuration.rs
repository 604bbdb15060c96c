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

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ControlPlaneOptions, DataPlaneOptions};

/// GatewayConfiguration is referenced from a GatewayClass parametersRef and
/// carries the options used to provision the DataPlane and ControlPlane of
/// every Gateway of that class.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1alpha1",
    kind = "GatewayConfiguration",
    namespaced,
    status = "GatewayConfigurationStatus",
    shortname = "kogc"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigurationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane_options: Option<DataPlaneOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_options: Option<ControlPlaneOptions>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigurationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
}
