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

//! Ordered teardown of an owner's children while it is being deleted.
//!
//! Each child family is guarded by its own finalizer token. Families are torn
//! down in the order given, and every pass performs at most one step: delete
//! the remaining children of the current family, or remove its token once it
//! is observed empty. Both are durable in the API server, so a restarted
//! operator resumes exactly where it stopped.

use std::{collections::BTreeMap, marker::PhantomData, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{core::ObjectMeta, runtime::controller::Action, ResourceExt};
use tracing::*;

use crate::{
    metadata::{has_finalizer, remove_finalizer},
    store::{Object, ObjectStore},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionPhase {
    /// The deletion timestamp is still in the future.
    GracePeriodPending { remaining: Duration },
    /// Children of the family guarded by `finalizer` were deleted or are still
    /// going away.
    DeletingChildren {
        finalizer: &'static str,
        count: usize,
    },
    /// The family is empty and its token was removed.
    RemovingFinalizer { finalizer: &'static str },
    /// Nothing left to clean up; the API server removes the object.
    Terminal,
}

impl DeletionPhase {
    // The grace period is waited out with a single requeue at its expiry. Every
    // other phase mutated something, and the resulting event triggers the next pass.
    pub fn action(&self) -> Action {
        match self {
            DeletionPhase::GracePeriodPending { remaining } => Action::requeue(*remaining),
            _ => Action::await_change(),
        }
    }
}

// Time left before the deletion timestamp, if it is still in the future.
pub fn grace_period_remaining(meta: &ObjectMeta, now: DateTime<Utc>) -> Option<Duration> {
    let deletion = meta.deletion_timestamp.as_ref()?.0;
    (deletion - now).to_std().ok().filter(|d| !d.is_zero())
}

// A family of children guarded by one finalizer token.
#[async_trait]
pub trait CleanupFamily<S: ObjectStore>: Send + Sync {
    fn finalizer(&self) -> &'static str;

    /// Deletes the children still present and returns how many remain,
    /// including those already on their way out. Zero means the family is
    /// empty.
    async fn cleanup(&self, store: &S) -> Result<usize>;
}

// Children of one kind selected by their owner labels.
pub struct OwnedChildren<K> {
    finalizer: &'static str,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> OwnedChildren<K> {
    pub fn new(
        finalizer: &'static str,
        namespace: Option<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        OwnedChildren {
            finalizer,
            namespace,
            labels,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<S: ObjectStore, K: Object> CleanupFamily<S> for OwnedChildren<K> {
    fn finalizer(&self) -> &'static str {
        self.finalizer
    }

    async fn cleanup(&self, store: &S) -> Result<usize> {
        let namespace = self.namespace.as_deref();
        let children = store.list::<K>(namespace, &self.labels).await?;
        for child in children.iter().filter(|c| c.meta().deletion_timestamp.is_none()) {
            store.delete::<K>(namespace, &child.name_any()).await?;
        }
        Ok(children.len())
    }
}

// Runs one step of the deletion state machine for `obj`.
pub async fn run_deletion<S, K>(
    store: &S,
    obj: &K,
    families: &[&dyn CleanupFamily<S>],
) -> Result<DeletionPhase>
where
    S: ObjectStore,
    K: Object,
{
    if let Some(remaining) = grace_period_remaining(obj.meta(), Utc::now()) {
        return Ok(DeletionPhase::GracePeriodPending { remaining });
    }

    for family in families {
        let finalizer = family.finalizer();
        if !has_finalizer(obj, finalizer) {
            continue;
        }

        let count = family.cleanup(store).await?;
        if count > 0 {
            debug!(name = obj.name_any(), finalizer, count, "deleting owned children");
            return Ok(DeletionPhase::DeletingChildren { finalizer, count });
        }

        let mut updated = obj.clone();
        remove_finalizer(&mut updated, finalizer);
        store.update(&updated).await?;
        debug!(name = obj.name_any(), finalizer, "finalizer removed");
        return Ok(DeletionPhase::RemovingFinalizer { finalizer });
    }

    Ok(DeletionPhase::Terminal)
}
