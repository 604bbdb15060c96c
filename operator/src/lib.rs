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

use kube::Client;
use thiserror::Error;

pub use controlplane_controller::controller as controlplane_controller;
pub use dataplane_controller::controller as dataplane_controller;
pub use gateway_controller::controller as gateway_controller;
pub use gatewayclass_controller::controller as gatewayclass_controller;

pub mod certificate;
pub mod clusterroles;
pub mod conditions;
pub mod config;
pub mod consts;
pub mod controlplane_controller;
mod controlplane_utils;
pub mod crd;
pub mod dataplane_controller;
mod dataplane_utils;
pub mod finalizer;
pub mod gateway_controller;
mod gateway_utils;
pub mod gatewayclass_controller;
mod gatewayclass_utils;
pub mod metadata;
pub mod store;
pub mod sync;
pub mod traits;
pub mod validation;

#[cfg(test)]
mod testing;

use store::{KubeStore, ObjectStore};

// Context shared by every reconciler.
//
// The store is generic so that reconcilers can be driven against an in-memory
// store; the controllers themselves always run with a KubeStore.
#[derive(Clone)]
pub struct Context<S: ObjectStore = KubeStore> {
    pub store: S,
    /// Value a GatewayClass controllerName must match for its Gateways to be managed.
    pub controller_name: String,
    /// Secret holding the CA used to sign ControlPlane client certificates.
    pub cluster_ca: NamespacedName,
    /// Skips ControlPlane image version validation.
    pub development_mode: bool,
}

impl Context {
    pub fn new(client: Client, config: &config::Config) -> Self {
        Context {
            store: KubeStore::new(client),
            controller_name: config.controller_name.clone(),
            cluster_ca: NamespacedName {
                name: config.cluster_ca_secret_name.clone(),
                namespace: config.cluster_ca_secret_namespace.clone(),
            },
            development_mode: config.development_mode,
        }
    }

    pub fn client(&self) -> Client {
        self.store.client.clone()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("error querying CRDs: `{0}`; are the CRDs installed?")]
    CRDNotFoundError(#[source] kube::Error),
    #[error("found {count} {kind} objects for {owner}, expected at most 1")]
    TooManyChildren {
        kind: String,
        owner: String,
        count: usize,
    },
    #[error("dataplane service error: {0}")]
    DataPlaneServiceError(String),
    #[error("invalid GatewayClass parametersRef: {0}")]
    InvalidParametersRef(String),
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
    #[error("certificate error: {0}")]
    CertificateError(String),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    // Optimistic concurrency failure; a fresh read and a retry resolves it.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }
}

impl From<rcgen::Error> for Error {
    fn from(error: rcgen::Error) -> Self {
        Error::CertificateError(error.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
