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

//! Pure validation predicates for ControlPlane and DataPlane objects.
//!
//! These are used by the reconcilers and are meant to be called as-is by an
//! admission webhook. They never talk to the API server.

use crate::{
    consts::*,
    crd::{ControlPlane, DataPlane, DeploymentOptions},
    Error, Result,
};

// Controller images the operator knows how to configure.
const SUPPORTED_CONTROLPLANE_TAGS: &[&str] = &["2.9.3", "2.9", "2.7"];

// The image is expected in the <image>:<tag> form.
pub fn is_control_plane_image_supported(image: &str) -> bool {
    match image.rsplit_once(':') {
        Some((base, tag)) => {
            base == DEFAULT_CONTROLPLANE_BASE_IMAGE && SUPPORTED_CONTROLPLANE_TAGS.contains(&tag)
        }
        None => false,
    }
}

// Returns the controller image to run. An explicitly requested image must be
// supported unless `development_mode` is on.
pub fn control_plane_image(options: &DeploymentOptions, development_mode: bool) -> Result<String> {
    let Some(image) = options.image() else {
        return Ok(format!(
            "{DEFAULT_CONTROLPLANE_BASE_IMAGE}:{DEFAULT_CONTROLPLANE_TAG}"
        ));
    };
    if !development_mode && !is_control_plane_image_supported(&image) {
        return Err(Error::UnsupportedImage(format!(
            "unsupported ControlPlane image {image}"
        )));
    }
    Ok(image)
}

pub fn validate_control_plane(controlplane: &ControlPlane, development_mode: bool) -> Result<()> {
    control_plane_image(&controlplane.spec.options.deployment, development_mode).map(|_| ())
}

// Only the DB-less mode of the proxy is supported. The last KONG_DATABASE
// literal wins, as it does for the kubelet; values sourced from a ConfigMap or
// Secret aren't resolved here.
pub fn validate_data_plane(dataplane: &DataPlane) -> Result<()> {
    let db_mode = dataplane
        .spec
        .options
        .deployment
        .env
        .iter()
        .filter(|env| env.name == ENV_KONG_DATABASE)
        .filter_map(|env| env.value.as_deref())
        .filter(|value| !value.is_empty())
        .last()
        .unwrap_or_default();

    if !db_mode.is_empty() && db_mode != "off" {
        return Err(Error::InvalidConfigError(format!(
            "database backend {db_mode} of dataplane not supported currently"
        )));
    }
    Ok(())
}
