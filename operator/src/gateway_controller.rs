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

use std::{sync::Arc, time::Instant};

use crate::{
    conditions::*,
    consts::*,
    controlplane_utils::{
        control_plane_options_equal, deployment_options_equal, derived_env, set_derived_env,
    },
    crd::{ControlPlane, DataPlane, GatewayConfiguration},
    dataplane_utils::list_proxy_services,
    finalizer::{run_deletion, CleanupFamily, OwnedChildren},
    gatewayclass_utils::{is_accepted, is_supported},
    metadata::{ensure_finalizers, has_finalizer, namespaced_name, owner_labels, uid},
    store::{Object, ObjectStore},
    sync::{diff_network_policy, sync_owned},
    traits::HasConditions,
    Context, Error, Result,
};
use crate::gateway_utils::*;

use futures::StreamExt;
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::api::{core::v1::Service, networking::v1::NetworkPolicy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::Action,
        reflector::{ObjectRef, Store},
        watcher::Config,
        Controller,
    },
    Resource, ResourceExt,
};
use tracing::*;

// Finalizers guarding the children of a Gateway, in teardown order.
const GATEWAY_FINALIZERS: [&str; 3] = [
    GATEWAY_FINALIZER_CLEANUP_DATAPLANES,
    GATEWAY_FINALIZER_CLEANUP_CONTROLPLANES,
    GATEWAY_FINALIZER_CLEANUP_NETWORK_POLICIES,
];

pub async fn reconcile<S: ObjectStore>(
    gateway: Arc<Gateway>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let key = namespaced_name(gateway.as_ref())?;

    let Some(gw) = ctx
        .store
        .get::<Gateway>(Some(&key.namespace), &key.name)
        .await?
    else {
        debug!(name = key.name, namespace = key.namespace, "gateway is gone");
        return Ok(Action::await_change());
    };

    let result = match converge(gw, &ctx).await {
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

async fn converge<S: ObjectStore>(gw: Gateway, ctx: &Context<S>) -> Result<Action> {
    let store = &ctx.store;
    let key = namespaced_name(&gw)?;
    let labels = owner_labels(GATEWAY_MANAGED_LABEL_VALUE, &uid(&gw)?);

    if gw.meta().deletion_timestamp.is_some() {
        if !GATEWAY_FINALIZERS.iter().any(|f| has_finalizer(&gw, f)) {
            return Ok(Action::await_change());
        }
        let namespace = Some(key.namespace.clone());
        let dataplanes = OwnedChildren::<DataPlane>::new(
            GATEWAY_FINALIZER_CLEANUP_DATAPLANES,
            namespace.clone(),
            labels.clone(),
        );
        let controlplanes = OwnedChildren::<ControlPlane>::new(
            GATEWAY_FINALIZER_CLEANUP_CONTROLPLANES,
            namespace.clone(),
            labels.clone(),
        );
        let policies = OwnedChildren::<NetworkPolicy>::new(
            GATEWAY_FINALIZER_CLEANUP_NETWORK_POLICIES,
            namespace,
            labels,
        );
        let families: [&dyn CleanupFamily<S>; 3] = [&dataplanes, &controlplanes, &policies];
        let phase = run_deletion(store, &gw, &families).await?;
        debug!(name = key.name, namespace = key.namespace, ?phase, "deletion step");
        return Ok(phase.action());
    }

    // Gateways of other controllers never get our finalizers.
    let Some(gateway_class) = supported_class(store, &gw, &ctx.controller_name).await? else {
        debug!(name = key.name, namespace = key.namespace, "resource not supported, ignoring");
        return Ok(Action::await_change());
    };
    if !is_accepted(&gateway_class) {
        debug!(name = key.name, namespace = key.namespace, "gatewayclass not accepted, ignoring");
        return Ok(Action::await_change());
    }

    let mut updated = gw.clone();
    if ensure_finalizers(&mut updated, &GATEWAY_FINALIZERS) {
        store.update(&updated).await?;
        debug!(name = key.name, namespace = key.namespace, "finalizers added");
        return Ok(Action::await_change());
    }

    let original = gw;
    let mut gw = original.clone();
    let generation = gw.meta().generation;

    if !is_true(&gw, ConditionType::Accepted) {
        set_condition(
            &mut gw,
            new_condition(
                ConditionType::Accepted,
                true,
                ConditionReason::Accepted,
                format!(
                    "this gateway has been picked up by the {} and will be processed",
                    ctx.controller_name
                ),
                generation,
            ),
        );
    }
    init_ready_and_programmed(&mut gw);

    let config = gateway_configuration(store, &gateway_class, &key.namespace).await?;

    // DataPlane
    let expected = expected_dataplane_options(config.as_ref());
    let dataplanes = store
        .list::<DataPlane>(Some(&key.namespace), &labels)
        .await?;
    let dataplane = match dataplanes.as_slice() {
        [] => {
            let created = store.create(&generate_dataplane(&original, expected)?).await?;
            info!(
                name = key.name,
                namespace = key.namespace,
                dataplane = created.name_any(),
                "dataplane created"
            );
            set_condition(&mut gw, waiting_for(ConditionType::DataPlaneReady, generation));
            None
        }
        [existing] => {
            let mut dataplane = existing.clone();
            if !deployment_options_equal(
                &dataplane.spec.options.deployment,
                &expected.deployment,
                &[],
            ) {
                dataplane.spec.options = expected;
                dataplane = store.update(&dataplane).await?;
                info!(name = key.name, namespace = key.namespace, "dataplane options updated");
            }
            set_condition(
                &mut gw,
                mirror_readiness(&dataplane, ConditionType::DataPlaneReady, generation),
            );
            Some(dataplane)
        }
        _ => {
            return ambiguous::<S, DataPlane>(
                store,
                &original,
                gw,
                ConditionType::DataPlaneReady,
                dataplanes.len(),
            )
            .await
        }
    };

    let Some(dataplane) = dataplane.filter(|_| is_true(&gw, ConditionType::DataPlaneReady)) else {
        persist_if_flipped(store, &original, &gw, ConditionType::DataPlaneReady).await?;
        debug!(name = key.name, namespace = key.namespace, "dataplane not ready yet");
        return Ok(Action::await_change());
    };

    let services = list_proxy_services(store, &dataplane).await?;
    let service = match services.as_slice() {
        [service] => service.clone(),
        [] => {
            let error = Error::DataPlaneServiceError(format!(
                "no services found for dataplane {}/{}",
                key.namespace,
                dataplane.name_any()
            ));
            return record_error(
                store,
                &original,
                gw,
                ConditionType::GatewayService,
                ConditionReason::GatewayServiceError,
                error,
            )
            .await;
        }
        _ => {
            return ambiguous::<S, Service>(
                store,
                &original,
                gw,
                ConditionType::GatewayService,
                services.len(),
            )
            .await
        }
    };

    // ControlPlane
    let (expected, derived) = expected_controlplane_options(
        config.as_ref(),
        &key.namespace,
        &dataplane.name_any(),
        &service.name_any(),
        &ctx.controller_name,
    );
    let controlplanes = store
        .list::<ControlPlane>(Some(&key.namespace), &labels)
        .await?;
    let controlplane = match controlplanes.as_slice() {
        [] => {
            let created = store
                .create(&generate_controlplane(&original, expected, &derived)?)
                .await?;
            info!(
                name = key.name,
                namespace = key.namespace,
                controlplane = created.name_any(),
                "controlplane created"
            );
            set_condition(&mut gw, waiting_for(ConditionType::ControlPlaneReady, generation));
            None
        }
        [existing] => {
            let mut controlplane = existing.clone();
            // The admin URL is a default the ControlPlane reconciler may adjust
            // on its own.
            if !control_plane_options_equal(
                &controlplane.spec.options,
                &expected,
                &[ENV_KONG_ADMIN_URL],
            ) || derived_env(controlplane.meta()) != derived
            {
                controlplane.spec.options = expected;
                set_derived_env(&mut controlplane.metadata, &derived);
                controlplane = store.update(&controlplane).await?;
                info!(name = key.name, namespace = key.namespace, "controlplane options updated");
            }
            set_condition(
                &mut gw,
                mirror_readiness(&controlplane, ConditionType::ControlPlaneReady, generation),
            );
            Some(controlplane)
        }
        _ => {
            return ambiguous::<S, ControlPlane>(
                store,
                &original,
                gw,
                ConditionType::ControlPlaneReady,
                controlplanes.len(),
            )
            .await
        }
    };

    let Some(controlplane) =
        controlplane.filter(|_| is_true(&gw, ConditionType::ControlPlaneReady))
    else {
        persist_if_flipped(store, &original, &gw, ConditionType::ControlPlaneReady).await?;
        debug!(name = key.name, namespace = key.namespace, "controlplane not ready yet");
        return Ok(Action::await_change());
    };

    let policy = match sync_owned(
        store,
        &key.to_string(),
        Some(&key.namespace),
        &labels,
        generate_network_policy(&original, &dataplane, &controlplane)?,
        diff_network_policy,
    )
    .await
    {
        Err(Error::TooManyChildren { count, .. }) => {
            return ambiguous::<S, NetworkPolicy>(
                store,
                &original,
                gw,
                ConditionType::Programmed,
                count,
            )
            .await
        }
        result => result?,
    };
    if policy.changed() {
        debug!(name = key.name, namespace = key.namespace, "networkpolicy updated");
        return Ok(Action::await_change());
    }

    match gateway_addresses(&service) {
        Ok(addresses) => {
            gw.status.get_or_insert_with(Default::default).addresses = Some(addresses);
            set_condition(
                &mut gw,
                new_condition(
                    ConditionType::GatewayService,
                    true,
                    ConditionReason::Ready,
                    "",
                    generation,
                ),
            );
        }
        Err(error) => {
            info!(
                name = key.name,
                namespace = key.namespace,
                "could not determine gateway status: {error}"
            );
            set_condition(
                &mut gw,
                new_condition(
                    ConditionType::GatewayService,
                    false,
                    ConditionReason::GatewayServiceError,
                    error.to_string(),
                    generation,
                ),
            );
            if needs_status_update(&original, &gw) {
                store.update_status(&gw).await?;
            }
            return Ok(Action::await_change());
        }
    }

    let addresses_changed = addresses(&original) != addresses(&gw);
    if !is_true(&original, ConditionType::Programmed) || addresses_changed {
        set_ready_and_programmed(&mut gw);
        if addresses_changed || needs_status_update(&original, &gw) {
            store.update_status(&gw).await?;
            debug!(name = key.name, namespace = key.namespace, "gateway is programmed");
        }
    }

    Ok(Action::await_change())
}

// Returns the GatewayClass of `gateway` if this operator is responsible for it.
async fn supported_class<S: ObjectStore>(
    store: &S,
    gateway: &Gateway,
    controller_name: &str,
) -> Result<Option<GatewayClass>> {
    let class_name = &gateway.spec.gateway_class_name;
    if class_name.is_empty() {
        return Ok(None);
    }
    Ok(store
        .get::<GatewayClass>(None, class_name)
        .await?
        .filter(|class| is_supported(class, controller_name)))
}

fn waiting_for(type_: ConditionType, generation: Option<i64>) -> metav1::Condition {
    new_condition(
        type_,
        false,
        ConditionReason::WaitingToBecomeReady,
        WAITING_TO_BECOME_READY_MESSAGE,
        generation,
    )
}

// Reflects the Ready condition of a child as `type_` on the Gateway.
fn mirror_readiness<T: HasConditions>(
    child: &T,
    type_: ConditionType,
    generation: Option<i64>,
) -> metav1::Condition {
    if is_true(child, ConditionType::Ready) {
        new_condition(type_, true, ConditionReason::Ready, "", generation)
    } else {
        waiting_for(type_, generation)
    }
}

// A not ready dependency is only written when it is news: the condition was
// absent or True before this pass.
async fn persist_if_flipped<S: ObjectStore>(
    store: &S,
    original: &Gateway,
    gw: &Gateway,
    type_: ConditionType,
) -> Result<()> {
    let flipped = get_condition(original, type_).map_or(true, |c| c.status == "True");
    if flipped {
        store.update_status(gw).await?;
    }
    Ok(())
}

// Records that more than one child of kind K was found and fails the pass.
async fn ambiguous<S: ObjectStore, K: Object>(
    store: &S,
    original: &Gateway,
    gw: Gateway,
    type_: ConditionType,
    count: usize,
) -> Result<Action> {
    let error = Error::TooManyChildren {
        kind: K::kind(&()).to_string(),
        owner: namespaced_name(&gw)?.to_string(),
        count,
    };
    record_error(store, original, gw, type_, ConditionReason::UnableToProvision, error).await
}

fn addresses(gw: &Gateway) -> Vec<(Option<String>, String)> {
    gw.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .into_iter()
        .flatten()
        .map(|address| (address.r#type.clone(), address.value.clone()))
        .collect()
}

fn gateways_of_class(cache: &Store<Gateway>, class_name: &str) -> Vec<ObjectRef<Gateway>> {
    cache
        .state()
        .into_iter()
        .filter(|gw| gw.spec.gateway_class_name == class_name)
        .map(|gw| ObjectRef::from_obj(gw.as_ref()))
        .collect()
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.client();
    let gateways = Api::<Gateway>::all(client.clone());
    gateways
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let managed = Config::default().labels(&format!(
        "{GATEWAY_OPERATOR_CONTROLLED_LABEL}={GATEWAY_MANAGED_LABEL_VALUE}"
    ));
    let controller = Controller::new(gateways, Config::default().any_semantic());
    let class_cache = controller.store();
    let config_cache = controller.store();

    controller
        .owns(Api::<DataPlane>::all(client.clone()), managed.clone())
        .owns(Api::<ControlPlane>::all(client.clone()), managed.clone())
        .owns(Api::<NetworkPolicy>::all(client.clone()), managed)
        .watches(
            Api::<GatewayClass>::all(client.clone()),
            Config::default(),
            move |class| gateways_of_class(&class_cache, &class.name_any()),
        )
        // Passes for Gateways of classes that don't use the configuration are
        // no-ops.
        .watches(
            Api::<GatewayConfiguration>::all(client),
            Config::default(),
            move |_| {
                config_cache
                    .state()
                    .into_iter()
                    .map(|gw| ObjectRef::from_obj(gw.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<Gateway>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(ERROR_REQUEUE)
}
