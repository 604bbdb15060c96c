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

//! Permissions granted to the ingress controller run by a ControlPlane.

use k8s_openapi::api::rbac::v1::PolicyRule;

use crate::{consts::*, validation::is_control_plane_image_supported, Error, Result};

const GET_LIST_WATCH: &[&str] = &["get", "list", "watch"];
const LIST_WATCH: &[&str] = &["list", "watch"];
const GET_PATCH_UPDATE: &[&str] = &["get", "patch", "update"];
const GET_UPDATE: &[&str] = &["get", "update"];
const ALL: &[&str] = &["get", "list", "watch", "create", "update", "patch", "delete"];

// (apiGroup, resources, verbs) for controller versions >= 2.7.
const RULES: &[(&str, &[&str], &[&str])] = &[
    ("", &["endpoints", "nodes", "secrets"], LIST_WATCH),
    (
        "",
        &["endpoints/status", "secrets/status", "services/status"],
        GET_PATCH_UPDATE,
    ),
    ("", &["events"], &["create", "patch"]),
    ("", &["pods", "services"], GET_LIST_WATCH),
    ("", &["configmaps"], ALL),
    (
        "configuration.konghq.com",
        &[
            "ingressclassparameterses",
            "kongclusterplugins",
            "kongconsumers",
            "kongingresses",
            "kongplugins",
            "tcpingresses",
            "udpingresses",
        ],
        GET_LIST_WATCH,
    ),
    (
        "configuration.konghq.com",
        &[
            "kongclusterplugins/status",
            "kongconsumers/status",
            "kongingresses/status",
            "kongplugins/status",
            "tcpingresses/status",
            "udpingresses/status",
        ],
        GET_PATCH_UPDATE,
    ),
    ("extensions", &["ingresses"], GET_LIST_WATCH),
    ("extensions", &["ingresses/status"], GET_PATCH_UPDATE),
    (
        "networking.k8s.io",
        &["ingressclasses", "ingresses"],
        GET_LIST_WATCH,
    ),
    ("networking.k8s.io", &["ingresses/status"], GET_PATCH_UPDATE),
    (
        "gateway.networking.k8s.io",
        &[
            "gatewayclasses",
            "httproutes",
            "referencegrants",
            "tcproutes",
            "tlsroutes",
            "udproutes",
        ],
        GET_LIST_WATCH,
    ),
    ("gateway.networking.k8s.io", &["gateways"], &["get", "list", "update", "watch"]),
    (
        "gateway.networking.k8s.io",
        &[
            "gatewayclasses/status",
            "gateways/status",
            "httproutes/status",
            "tcproutes/status",
            "tlsroutes/status",
            "udproutes/status",
        ],
        GET_UPDATE,
    ),
    ("gateway.networking.k8s.io", &["referencegrants/status"], &["get"]),
    (
        "networking.internal.knative.dev",
        &["ingresses"],
        GET_LIST_WATCH,
    ),
    (
        "networking.internal.knative.dev",
        &["ingresses/status"],
        GET_PATCH_UPDATE,
    ),
    ("coordination.k8s.io", &["leases"], ALL),
];

const MINIMUM_VERSION: (u64, u64) = (2, 7);

// Extracts (major, minor) from a tag such as "2.9", "2.9.3" or "v2.9.3-rc.1".
pub fn parse_major_minor(tag: &str) -> Option<(u64, u64)> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let release = tag.split(['-', '+']).next()?;
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
    Some((major, minor))
}

// Returns the rules for the controller image described by `image` and `tag`.
//
// Images outside the supported list are granted the rules of the default
// controller version.
pub fn rules_for_controller(image: Option<&str>, tag: Option<&str>) -> Result<Vec<PolicyRule>> {
    let mut version = DEFAULT_CONTROLPLANE_TAG;
    if let (Some(image), Some(tag)) = (image, tag) {
        if !image.is_empty() && !tag.is_empty() && is_control_plane_image_supported(&format!("{image}:{tag}")) {
            version = tag;
        }
    }

    match parse_major_minor(version) {
        Some(v) if v >= MINIMUM_VERSION => Ok(RULES
            .iter()
            .map(|(group, resources, verbs)| PolicyRule {
                api_groups: Some(vec![group.to_string()]),
                resources: Some(resources.iter().map(|r| r.to_string()).collect()),
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            })
            .collect()),
        _ => Err(Error::UnsupportedImage(format!(
            "controller version {version} is not supported"
        ))),
    }
}
