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

//! Access to the API server as seen by the reconcilers.
//!
//! Reconcilers never hold a [kube::Api] directly. They read and write through
//! [ObjectStore], which keeps every call site uniform across namespaced and
//! cluster-scoped kinds and lets a whole reconciliation pass run against an
//! in-memory store in tests.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Secret, Service, ServiceAccount},
    networking::v1::NetworkPolicy,
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::*;

use crate::{
    crd::{ControlPlane, DataPlane, GatewayConfiguration},
    Error, Result,
};

// Any kind the operator reads or writes.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Object for $kind {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Object for $kind {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_object!(
    ControlPlane,
    DataPlane,
    GatewayConfiguration,
    Gateway,
    Deployment,
    NetworkPolicy,
    Secret,
    Service,
    ServiceAccount,
);

cluster_object!(GatewayClass, ClusterRole, ClusterRoleBinding);

// Renders a label map as an equality based label selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Returns None when the object doesn't exist.
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// Lists objects carrying every given label. A None namespace lists across
    /// all namespaces, or cluster-scoped objects.
    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Replaces the object. Fails with a conflict if its resourceVersion is stale.
    async fn update<K: Object>(&self, obj: &K) -> Result<K>;

    /// Replaces the status subresource. Fails with a conflict if its
    /// resourceVersion is stale.
    async fn update_status<K: Object>(&self, obj: &K) -> Result<K>;

    /// Deleting an object which is already gone is not an error.
    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeStore {
    pub client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        K::api(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(labels));
        let list = K::api(self.client.clone(), namespace)
            .list(&params)
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let created = K::api(self.client.clone(), obj.meta().namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)?;
        debug!(kind = %K::kind(&()), name = created.name_any(), "created object");
        Ok(created)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        K::api(self.client.clone(), obj.meta().namespace.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj)?;
        K::api(self.client.clone(), obj.meta().namespace.as_deref())
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        match K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(Error::KubeError(error)),
        }
    }
}
