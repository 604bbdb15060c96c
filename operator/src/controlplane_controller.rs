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

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use crate::{
    certificate::{issue_client_certificate, ClusterCa, IssuedCertificate},
    conditions::*,
    consts::*,
    crd::{ControlPlane, DataPlane},
    dataplane_utils::list_proxy_services,
    finalizer::{run_deletion, CleanupFamily, OwnedChildren},
    metadata::{ensure_finalizers, namespaced_name, owner_from_annotation, owner_labels, uid},
    store::ObjectStore,
    sync::*,
    validation::control_plane_image,
    Context, Error, NamespacedName, Result,
};
use crate::controlplane_utils::*;

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Secret, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{
    api::{Api, ListParams},
    core::ObjectMeta,
    runtime::{
        controller::Action,
        reflector::{ObjectRef, Store},
        watcher::Config,
        Controller,
    },
    Resource, ResourceExt,
};
use tracing::*;

pub async fn reconcile<S: ObjectStore>(
    controlplane: Arc<ControlPlane>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let key = namespaced_name(controlplane.as_ref())?;

    // The watch cache can lag behind; every pass works on the stored object.
    let Some(cp) = ctx
        .store
        .get::<ControlPlane>(Some(&key.namespace), &key.name)
        .await?
    else {
        debug!(name = key.name, namespace = key.namespace, "controlplane is gone");
        return Ok(Action::await_change());
    };

    let result = match converge(cp, &ctx).await {
        Err(error) if error.is_conflict() => {
            debug!(name = key.name, namespace = key.namespace, "conflict, retrying");
            Ok(Action::requeue(REQUEUE_WITHOUT_BACKOFF))
        }
        // Deleted mid pass; the watcher reports the removal.
        Err(error) if error.is_not_found() => {
            debug!(name = key.name, namespace = key.namespace, "gone while reconciling");
            Ok(Action::await_change())
        }
        result => result,
    };

    let duration = start.elapsed();
    info!("finished reconciling in {:?} ms", duration.as_millis());
    result
}

async fn converge<S: ObjectStore>(cp: ControlPlane, ctx: &Context<S>) -> Result<Action> {
    let store = &ctx.store;
    let key = namespaced_name(&cp)?;
    let labels = owner_labels(CONTROLPLANE_MANAGED_LABEL_VALUE, &uid(&cp)?);

    if cp.meta().deletion_timestamp.is_some() {
        let bindings = OwnedChildren::<ClusterRoleBinding>::new(
            CONTROLPLANE_FINALIZER_CLEANUP_CLUSTER_ROLE_BINDING,
            None,
            labels.clone(),
        );
        let roles = OwnedChildren::<ClusterRole>::new(
            CONTROLPLANE_FINALIZER_CLEANUP_CLUSTER_ROLE,
            None,
            labels,
        );
        let families: [&dyn CleanupFamily<S>; 2] = [&bindings, &roles];
        let phase = run_deletion(store, &cp, &families).await?;
        debug!(name = key.name, namespace = key.namespace, ?phase, "deletion step");
        return Ok(phase.action());
    }

    let mut updated = cp.clone();
    if ensure_finalizers(
        &mut updated,
        &[
            CONTROLPLANE_FINALIZER_CLEANUP_CLUSTER_ROLE,
            CONTROLPLANE_FINALIZER_CLEANUP_CLUSTER_ROLE_BINDING,
        ],
    ) {
        store.update(&updated).await?;
        debug!(name = key.name, namespace = key.namespace, "finalizers added");
        return Ok(Action::await_change());
    }

    let original = cp;
    let mut cp = original.clone();
    let generation = cp.meta().generation;
    init_ready(&mut cp);

    if !is_true(&cp, ConditionType::Scheduled) {
        set_condition(
            &mut cp,
            new_condition(
                ConditionType::Scheduled,
                true,
                ConditionReason::Scheduled,
                "",
                generation,
            ),
        );
        store.update_status(&cp).await?;
        return Ok(Action::await_change());
    }

    let image = match control_plane_image(&cp.spec.options.deployment, ctx.development_mode) {
        Ok(image) => image,
        Err(error) => {
            set_condition(
                &mut cp,
                new_condition(
                    ConditionType::Ready,
                    false,
                    ConditionReason::Invalid,
                    error.to_string(),
                    generation,
                ),
            );
            if needs_status_update(&original, &cp) {
                store.update_status(&cp).await?;
            }
            return Err(error);
        }
    };

    // A ControlPlane may exist before its DataPlane; both a missing DataPlane
    // and a missing proxy Service leave the service name empty.
    let dataplane = match cp.spec.options.data_plane.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => store.get::<DataPlane>(Some(&key.namespace), name).await?,
        None => None,
    };
    let dataplane_service = match &dataplane {
        Some(dp) => match list_proxy_services(store, dp).await?.as_slice() {
            [service] => service.name_any(),
            _ => String::new(),
        },
        None => String::new(),
    };

    let mut options = cp.spec.options.clone();
    let mut derived = derived_env(cp.meta());
    if set_control_plane_defaults(
        &mut options,
        &key.namespace,
        &dataplane_service,
        &ctx.controller_name,
        &mut derived,
    ) {
        let mut updated = original.clone();
        updated.spec.options = options;
        set_derived_env(&mut updated.metadata, &derived);
        store.update(&updated).await?;
        info!(name = key.name, namespace = key.namespace, "controlplane defaults applied");
        return Ok(Action::await_change());
    }

    let dataplane_is_set = dataplane.is_some();
    let dataplane_condition = if dataplane_is_set {
        new_condition(
            ConditionType::DataPlaneReady,
            true,
            ConditionReason::DataPlaneSet,
            "",
            generation,
        )
    } else {
        new_condition(
            ConditionType::DataPlaneReady,
            false,
            ConditionReason::DataPlaneNotSet,
            "no DataPlane is set",
            generation,
        )
    };
    set_condition(&mut cp, dataplane_condition);

    let deployment = match sync_children(ctx, &cp, &key, &labels, &image, dataplane_is_set).await {
        Ok(Some(deployment)) if !deployment.changed() => deployment.into_inner(),
        Ok(Some(_)) => {
            if !dataplane_is_set {
                set_ready(&mut cp);
                if needs_status_update(&original, &cp) {
                    store.update_status(&cp).await?;
                }
            }
            return Ok(Action::await_change());
        }
        Ok(None) => return Ok(Action::await_change()),
        Err(error @ Error::TooManyChildren { .. }) => {
            return record_error(
                store,
                &original,
                cp,
                ConditionType::Ready,
                ConditionReason::UnableToProvision,
                error,
            )
            .await
        }
        Err(error) => return Err(error),
    };

    if !deployment_is_ready(&deployment) {
        debug!(name = key.name, namespace = key.namespace, "waiting for the deployment");
        set_condition(
            &mut cp,
            new_condition(
                ConditionType::Provisioned,
                false,
                ConditionReason::WaitingToBecomeReady,
                WAITING_TO_BECOME_READY_MESSAGE,
                generation,
            ),
        );
        set_ready(&mut cp);
        if needs_status_update(&original, &cp) {
            store.update_status(&cp).await?;
        }
        return Ok(Action::await_change());
    }

    set_condition(
        &mut cp,
        new_condition(
            ConditionType::Provisioned,
            true,
            ConditionReason::Provisioned,
            "",
            generation,
        ),
    );
    set_ready(&mut cp);
    if needs_status_update(&original, &cp) {
        store.update_status(&cp).await?;
        info!(name = key.name, namespace = key.namespace, "controlplane status updated");
    }

    Ok(Action::await_change())
}

// Brings the owned children in line one at a time, in dependency order. Returns
// None when a child other than the Deployment was written this pass.
async fn sync_children<S: ObjectStore>(
    ctx: &Context<S>,
    cp: &ControlPlane,
    key: &NamespacedName,
    labels: &BTreeMap<String, String>,
    image: &str,
    dataplane_is_set: bool,
) -> Result<Option<SyncOutcome<Deployment>>> {
    let store = &ctx.store;
    let owner = key.to_string();
    let namespace = Some(key.namespace.as_str());

    let service_account = sync_owned(
        store,
        &owner,
        namespace,
        labels,
        generate_service_account(cp)?,
        no_field_diff,
    )
    .await?;
    if service_account.changed() {
        return Ok(None);
    }
    let service_account = service_account.inner().name_any();

    let cluster_role = sync_owned(
        store,
        &owner,
        None,
        labels,
        generate_cluster_role(cp)?,
        diff_cluster_role,
    )
    .await?;
    if cluster_role.changed() {
        return Ok(None);
    }

    let binding = sync_owned(
        store,
        &owner,
        None,
        labels,
        generate_cluster_role_binding(cp, &cluster_role.inner().name_any(), &service_account)?,
        diff_cluster_role_binding,
    )
    .await?;
    if binding.changed() {
        return Ok(None);
    }

    // A certificate is only issued for a new Secret; an existing one keeps its
    // key material.
    let secrets = store.list::<Secret>(namespace, labels).await?;
    let issued = if secrets.is_empty() {
        Some(issue_certificate(ctx, key).await?)
    } else {
        None
    };
    let secret = sync_child(
        store,
        &owner,
        generate_certificate_secret(cp, issued.as_ref())?,
        secrets,
        no_field_diff,
    )
    .await?;
    if secret.changed() {
        return Ok(None);
    }

    let deployment = sync_owned(
        store,
        &owner,
        namespace,
        labels,
        generate_deployment(
            cp,
            image,
            &service_account,
            &secret.inner().name_any(),
            dataplane_is_set,
        )?,
        diff_deployment,
    )
    .await?;
    Ok(Some(deployment))
}

async fn issue_certificate<S: ObjectStore>(
    ctx: &Context<S>,
    key: &NamespacedName,
) -> Result<IssuedCertificate> {
    let ca = &ctx.cluster_ca;
    let secret = ctx
        .store
        .get::<Secret>(Some(&ca.namespace), &ca.name)
        .await?
        .ok_or_else(|| Error::CertificateError(format!("cluster CA secret {ca} not found")))?;
    issue_client_certificate(
        &ClusterCa::from_secret(&secret)?,
        &format!("{}.{}", key.name, key.namespace),
    )
}

fn annotated_owner(meta: &ObjectMeta) -> Option<ObjectRef<ControlPlane>> {
    owner_from_annotation(meta).map(|owner| ObjectRef::new(&owner.name).within(&owner.namespace))
}

// ControlPlanes in the namespace of `dataplane` which reference it.
fn referencing_controlplanes(
    cache: &Store<ControlPlane>,
    dataplane: &DataPlane,
) -> Vec<ObjectRef<ControlPlane>> {
    let namespace = dataplane.namespace();
    let name = dataplane.name_any();
    cache
        .state()
        .into_iter()
        .filter(|cp| {
            cp.namespace() == namespace && cp.spec.options.data_plane.as_deref() == Some(name.as_str())
        })
        .map(|cp| ObjectRef::from_obj(cp.as_ref()))
        .collect()
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.client();
    let controlplanes = Api::<ControlPlane>::all(client.clone());
    controlplanes
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let managed = Config::default().labels(&format!(
        "{GATEWAY_OPERATOR_CONTROLLED_LABEL}={CONTROLPLANE_MANAGED_LABEL_VALUE}"
    ));
    let controller = Controller::new(controlplanes, Config::default().any_semantic());
    let cache = controller.store();

    controller
        .owns(Api::<Deployment>::all(client.clone()), managed.clone())
        .owns(Api::<ServiceAccount>::all(client.clone()), managed.clone())
        .owns(Api::<Secret>::all(client.clone()), managed.clone())
        .watches(
            Api::<ClusterRole>::all(client.clone()),
            managed.clone(),
            |role| annotated_owner(role.meta()),
        )
        .watches(
            Api::<ClusterRoleBinding>::all(client.clone()),
            managed,
            |binding| annotated_owner(binding.meta()),
        )
        .watches(
            Api::<DataPlane>::all(client),
            Config::default(),
            move |dataplane| referencing_controlplanes(&cache, &dataplane),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<ControlPlane>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(ERROR_REQUEUE)
}
