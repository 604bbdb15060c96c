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

//! In-memory ObjectStore used by the reconciler tests.
//!
//! It mimics the API server behaviour the reconcilers depend on: generated
//! names, UIDs, resourceVersion conflicts, generation bumps on spec changes,
//! deletion blocked by finalizers and label selection. Every mutation is
//! recorded so that tests can assert on what a pass did.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{core::ErrorResponse, Resource, ResourceExt};
use serde_json::{json, Value};

use crate::{
    store::{Object, ObjectStore},
    Error, Result,
};

type Key = (String, Option<String>, String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    ops: Vec<Op>,
    counter: u64,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    conflict: AtomicBool,
    deletion: AtomicBool,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key<K: Object>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

fn key_of<K: Object>(obj: &K) -> Key {
    key::<K>(obj.meta().namespace.as_deref(), &obj.name_any())
}

fn without(value: &Value, fields: &[&str]) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        for field in fields {
            map.remove(*field);
        }
    }
    value
}

fn finalizers(value: &Value) -> usize {
    value["metadata"]["finalizers"]
        .as_array()
        .map(Vec::len)
        .unwrap_or_default()
}

fn labels_match(value: &Value, labels: &BTreeMap<String, String>) -> bool {
    labels
        .iter()
        .all(|(k, v)| value["metadata"]["labels"][k].as_str() == Some(v.as_str()))
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn record<K: Object>(&mut self, verb: &'static str, name: &str) {
        self.ops.push(Op {
            verb,
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        });
    }

    fn create<K: Object>(&mut self, obj: &K) -> Result<K> {
        let mut value = serde_json::to_value(obj)?;
        let mut name = obj.meta().name.clone().unwrap_or_default();
        if name.is_empty() {
            let prefix = obj.meta().generate_name.clone().unwrap_or_default();
            name = format!("{prefix}{:05}", self.next());
        }
        let key = key::<K>(obj.meta().namespace.as_deref(), &name);
        if self.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }

        let n = self.next();
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        value["metadata"]["name"] = json!(name);
        value["metadata"]["uid"] = json!(format!("uid-{n}"));
        value["metadata"]["resourceVersion"] = json!(n.to_string());
        value["metadata"]["generation"] = json!(1);
        self.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    fn current(&self, key: &Key, obj_version: Option<&str>) -> Result<Value> {
        let stored = self
            .objects
            .get(key)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", key.2)))?;
        let stored_version = stored["metadata"]["resourceVersion"].as_str();
        if obj_version.is_some() && obj_version != stored_version {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object {} has been modified", key.2),
            ));
        }
        Ok(stored.clone())
    }
}

impl FakeStore {
    // Stores an object without recording a mutation.
    pub fn seed<K: Object>(&self, obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        state.create(&obj).unwrap()
    }

    pub fn fetch<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn all<K: Object>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.0 == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().ops.len()
    }

    pub fn count_ops(&self, verb: &str, kind: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| op.verb == verb && op.kind == kind)
            .count()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    // Makes the next update or status update fail with a conflict.
    pub fn inject_conflict(&self) {
        self.conflict.store(true, Ordering::SeqCst);
    }

    // Makes the object of the next update or status update disappear first,
    // as if it had been deleted concurrently.
    pub fn inject_deletion(&self) {
        self.deletion.store(true, Ordering::SeqCst);
    }

    // Overwrites the status of an object, as another controller would.
    pub fn set_status<K: Object>(&self, namespace: Option<&str>, name: &str, status: Value) {
        let mut state = self.state.lock().unwrap();
        let n = state.next();
        let value = state.objects.get_mut(&key::<K>(namespace, name)).unwrap();
        value["status"] = status;
        value["metadata"]["resourceVersion"] = json!(n.to_string());
    }

    // Merges into the spec of an object, as a user would.
    pub fn patch_spec<K: Object>(&self, namespace: Option<&str>, name: &str, patch: Value) {
        let mut state = self.state.lock().unwrap();
        let n = state.next();
        let value = state.objects.get_mut(&key::<K>(namespace, name)).unwrap();
        if let (Some(spec), Some(patch)) = (value["spec"].as_object_mut(), patch.as_object()) {
            for (k, v) in patch {
                spec.insert(k.clone(), v.clone());
            }
        }
        value["metadata"]["resourceVersion"] = json!(n.to_string());
    }

    // Marks an object as being deleted at `at`, without recording a mutation.
    pub fn mark_deleted<K: Object>(&self, namespace: Option<&str>, name: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let n = state.next();
        let value = state.objects.get_mut(&key::<K>(namespace, name)).unwrap();
        value["metadata"]["deletionTimestamp"] = json!(at);
        value["metadata"]["resourceVersion"] = json!(n.to_string());
    }

    fn take_conflict(&self, name: &str) -> Result<()> {
        if self.conflict.swap(false, Ordering::SeqCst) {
            return Err(api_error(409, "Conflict", format!("the object {name} has been modified")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(self.fetch(namespace, name))
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|(k, v)| {
                k.0 == kind
                    && (namespace.is_none() || k.1.as_deref() == namespace)
                    && labels_match(v, labels)
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        let created = state.create(obj)?;
        state.record::<K>("create", &created.name_any());
        Ok(created)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        self.take_conflict(&obj.name_any())?;
        let mut state = self.state.lock().unwrap();
        let key = key_of(obj);
        if self.deletion.swap(false, Ordering::SeqCst) {
            state.objects.remove(&key);
        }
        let stored = state.current(&key, obj.meta().resource_version.as_deref())?;

        let mut value = serde_json::to_value(obj)?;
        if let Some(status) = stored.get("status") {
            value["status"] = status.clone();
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            if let Some(v) = stored["metadata"].get(field) {
                value["metadata"][field] = v.clone();
            }
        }
        let mut generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
        if without(&stored, &["metadata", "status"]) != without(&value, &["metadata", "status"]) {
            generation += 1;
        }
        let n = state.next();
        value["metadata"]["generation"] = json!(generation);
        value["metadata"]["resourceVersion"] = json!(n.to_string());

        state.record::<K>("update", &key.2);
        if value["metadata"].get("deletionTimestamp").is_some() && finalizers(&value) == 0 {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        self.take_conflict(&obj.name_any())?;
        let mut state = self.state.lock().unwrap();
        let key = key_of(obj);
        if self.deletion.swap(false, Ordering::SeqCst) {
            state.objects.remove(&key);
        }
        let mut stored = state.current(&key, obj.meta().resource_version.as_deref())?;

        let value = serde_json::to_value(obj)?;
        stored["status"] = value.get("status").cloned().unwrap_or(Value::Null);
        let n = state.next();
        stored["metadata"]["resourceVersion"] = json!(n.to_string());

        state.record::<K>("update_status", &key.2);
        state.objects.insert(key, stored.clone());
        Ok(serde_json::from_value(stored)?)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = key::<K>(namespace, name);
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Ok(());
        };
        state.record::<K>("delete", name);
        if finalizers(&stored) == 0 {
            state.objects.remove(&key);
        } else if stored["metadata"].get("deletionTimestamp").is_none() {
            let n = state.next();
            if let Some(value) = state.objects.get_mut(&key) {
                value["metadata"]["deletionTimestamp"] = json!(Utc::now());
                value["metadata"]["resourceVersion"] = json!(n.to_string());
            }
        }
        Ok(())
    }
}
