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

use std::collections::BTreeMap;

use kube::{core::ObjectMeta, Resource, ResourceExt};

use crate::{consts::*, Error, NamespacedName, Result};

// Returns the namespace and name of an object, failing if either is unset.
pub fn namespaced_name<K: Resource>(obj: &K) -> Result<NamespacedName> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;
    Ok(NamespacedName { name, namespace })
}

pub fn uid<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .uid
        .clone()
        .ok_or(Error::InvalidConfigError(format!("{} has no uid", obj.name_any())))
}

// -----------------------------------------------------------------------------
// Finalizers
// -----------------------------------------------------------------------------

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

// Adds any of the given finalizers that are missing. Returns true if the
// object changed.
pub fn ensure_finalizers<K: Resource>(obj: &mut K, finalizers: &[&str]) -> bool {
    let mut changed = false;
    for finalizer in finalizers {
        if !has_finalizer(obj, finalizer) {
            obj.finalizers_mut().push(finalizer.to_string());
            changed = true;
        }
    }
    changed
}

pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

// -----------------------------------------------------------------------------
// Labels and ownership
// -----------------------------------------------------------------------------

// Labels every child carries: the managed-by pair and the UID of its owner.
// This set is also the selector used to list the children of an owner.
pub fn owner_labels(managed_by: &str, owner_uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            GATEWAY_OPERATOR_CONTROLLED_LABEL.to_string(),
            managed_by.to_string(),
        ),
        (OWNER_UID_LABEL.to_string(), owner_uid.to_string()),
    ])
}

// Builds the metadata of a child of `owner`.
//
// Namespaced children get a controller owner reference, so that the API server
// garbage collects them. Cluster-scoped children can't reference a namespaced
// owner and instead carry the owner identity as an annotation, which watches
// use to map them back.
pub fn child_meta<K>(owner: &K, managed_by: &str, namespaced: bool) -> Result<ObjectMeta>
where
    K: Resource<DynamicType = ()>,
{
    let key = namespaced_name(owner)?;
    let mut meta = ObjectMeta {
        generate_name: Some(format!("{}-{}-", managed_by, key.name)),
        labels: Some(owner_labels(managed_by, &uid(owner)?)),
        ..Default::default()
    };
    if namespaced {
        meta.namespace = Some(key.namespace);
        meta.owner_references = owner.controller_owner_ref(&()).map(|r| vec![r]);
    } else {
        meta.annotations = Some(BTreeMap::from([(
            OWNER_ANNOTATION.to_string(),
            key.to_string(),
        )]));
    }
    Ok(meta)
}

// Parses the owner annotation of a cluster-scoped child.
pub fn owner_from_annotation(meta: &ObjectMeta) -> Option<NamespacedName> {
    let value = meta.annotations.as_ref()?.get(OWNER_ANNOTATION)?;
    let (namespace, name) = value.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(NamespacedName {
        name: name.to_string(),
        namespace: namespace.to_string(),
    })
}

// Brings the labels, annotations and owner references of `existing` in line
// with `desired`. Keys the operator doesn't set are left alone. Returns true
// if anything changed.
pub fn merge_meta(existing: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let mut changed = false;

    for (current, wanted) in [
        (&mut existing.labels, &desired.labels),
        (&mut existing.annotations, &desired.annotations),
    ] {
        if let Some(wanted) = wanted {
            let current = current.get_or_insert_with(BTreeMap::new);
            for (k, v) in wanted {
                if current.get(k) != Some(v) {
                    current.insert(k.clone(), v.clone());
                    changed = true;
                }
            }
        }
    }

    if let Some(wanted) = &desired.owner_references {
        let current = existing.owner_references.get_or_insert_with(Vec::new);
        for reference in wanted {
            match current.iter_mut().find(|r| r.uid == reference.uid) {
                Some(r) if r == reference => {}
                Some(r) => {
                    *r = reference.clone();
                    changed = true;
                }
                None => {
                    current.push(reference.clone());
                    changed = true;
                }
            }
        }
    }

    changed
}
