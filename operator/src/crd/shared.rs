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

use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DeploymentOptions is shared by every intent resource whose configuration
/// results in a Deployment managed by the operator: the number of replicas,
/// the container image and version, and environment overrides.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOptions {
    /// Number of desired pods. Unset means the operator default of 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Container image without tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// Image tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
}

impl DeploymentOptions {
    /// Returns the literal value of the first env var with the given name.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|env| env.name == name)
            .and_then(|env| env.value.as_deref())
    }

    /// Returns true if an env var with the given name is declared, whatever its source.
    pub fn has_env(&self, name: &str) -> bool {
        self.env.iter().any(|env| env.name == name)
    }

    /// Full image reference, if both image and version are set.
    pub fn image(&self) -> Option<String> {
        match (&self.container_image, &self.version) {
            (Some(image), Some(version)) if !image.is_empty() && !version.is_empty() => {
                Some(format!("{image}:{version}"))
            }
            _ => None,
        }
    }
}
