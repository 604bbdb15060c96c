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
    controlplane_utils::deployment_is_ready,
    crd::{DataPlane, DataPlaneStatus},
    metadata::{namespaced_name, owner_labels, uid},
    store::ObjectStore,
    sync::*,
    validation::validate_data_plane,
    Context, Error, Result,
};
use crate::dataplane_utils::*;

use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher::Config, Controller},
    Resource, ResourceExt,
};
use tracing::*;

pub async fn reconcile<S: ObjectStore>(
    dataplane: Arc<DataPlane>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let key = namespaced_name(dataplane.as_ref())?;

    let Some(dp) = ctx
        .store
        .get::<DataPlane>(Some(&key.namespace), &key.name)
        .await?
    else {
        debug!(name = key.name, namespace = key.namespace, "dataplane is gone");
        return Ok(Action::await_change());
    };

    // Children are garbage collected through their owner references.
    if dp.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let result = match converge(dp, &ctx.store).await {
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

fn status_changed(current: &DataPlane, desired: &DataPlane) -> bool {
    let service = |dp: &DataPlane| dp.status.as_ref().and_then(|s| s.service.clone());
    let addresses = |dp: &DataPlane| {
        dp.status
            .as_ref()
            .map(|s| s.addresses.clone())
            .unwrap_or_default()
    };
    needs_status_update(current, desired)
        || service(current) != service(desired)
        || addresses(current) != addresses(desired)
}

async fn converge<S: ObjectStore>(original: DataPlane, store: &S) -> Result<Action> {
    let key = namespaced_name(&original)?;
    let mut dp = original.clone();
    let generation = dp.meta().generation;

    if let Err(error) = validate_data_plane(&dp) {
        set_condition(
            &mut dp,
            new_condition(
                ConditionType::Ready,
                false,
                ConditionReason::Invalid,
                error.to_string(),
                generation,
            ),
        );
        if needs_status_update(&original, &dp) {
            store.update_status(&dp).await?;
        }
        return Err(error);
    }

    init_ready(&mut dp);
    if !is_true(&dp, ConditionType::Scheduled) {
        set_condition(
            &mut dp,
            new_condition(
                ConditionType::Scheduled,
                true,
                ConditionReason::Scheduled,
                "",
                generation,
            ),
        );
        store.update_status(&dp).await?;
        return Ok(Action::await_change());
    }

    let (deployment, service) = match sync_children(store, &dp).await {
        Ok(Some(children)) => children,
        Ok(None) => return Ok(Action::await_change()),
        Err(error @ Error::TooManyChildren { .. }) => {
            return record_error(
                store,
                &original,
                dp,
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
        return Ok(Action::await_change());
    }

    set_condition(
        &mut dp,
        new_condition(
            ConditionType::Provisioned,
            true,
            ConditionReason::Provisioned,
            "",
            generation,
        ),
    );
    set_ready(&mut dp);
    let status = dp.status.get_or_insert_with(DataPlaneStatus::default);
    status.service = Some(service.name_any());
    status.addresses = service_addresses(&service);

    if status_changed(&original, &dp) {
        store.update_status(&dp).await?;
        info!(name = key.name, namespace = key.namespace, "dataplane status updated");
    }

    Ok(Action::await_change())
}

// Returns None when the Deployment or the proxy Service was written this pass.
async fn sync_children<S: ObjectStore>(
    store: &S,
    dp: &DataPlane,
) -> Result<Option<(Deployment, Service)>> {
    let key = namespaced_name(dp)?;
    let owner = key.to_string();
    let namespace = Some(key.namespace.as_str());

    let deployment = sync_owned(
        store,
        &owner,
        namespace,
        &owner_labels(DATAPLANE_MANAGED_LABEL_VALUE, &uid(dp)?),
        generate_deployment(dp)?,
        diff_deployment,
    )
    .await?;
    if deployment.changed() {
        return Ok(None);
    }

    let service = sync_owned(
        store,
        &owner,
        namespace,
        &proxy_service_labels(dp)?,
        generate_proxy_service(dp)?,
        diff_service,
    )
    .await?;
    if service.changed() {
        return Ok(None);
    }

    Ok(Some((deployment.into_inner(), service.into_inner())))
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.client();
    let dataplanes = Api::<DataPlane>::all(client.clone());
    dataplanes
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let managed = Config::default().labels(&format!(
        "{GATEWAY_OPERATOR_CONTROLLED_LABEL}={DATAPLANE_MANAGED_LABEL_VALUE}"
    ));
    Controller::new(dataplanes, Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), managed.clone())
        .owns(Api::<Service>::all(client), managed)
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<DataPlane>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crd::DataPlaneSpec, testing::FakeStore, NamespacedName};
    use k8s_openapi::api::core::v1::EnvVar;
    use serde_json::json;

    const NS: &str = "default";

    fn context() -> Arc<Context<FakeStore>> {
        Arc::new(Context {
            store: FakeStore::default(),
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            cluster_ca: NamespacedName::default(),
            development_mode: false,
        })
    }

    fn dataplane() -> DataPlane {
        let mut dp = DataPlane::new("dp", DataPlaneSpec::default());
        dp.metadata.namespace = Some(NS.to_string());
        dp
    }

    async fn pass(ctx: &Arc<Context<FakeStore>>) -> Result<Action> {
        reconcile(Arc::new(dataplane()), ctx.clone()).await
    }

    fn stored(ctx: &Context<FakeStore>) -> DataPlane {
        ctx.store.fetch::<DataPlane>(Some(NS), "dp").unwrap()
    }

    // Simulates the deployment controller and the load balancer provider.
    fn make_children_ready(store: &FakeStore) {
        for deployment in store.all::<Deployment>() {
            store.set_status::<Deployment>(
                Some(NS),
                &deployment.name_any(),
                json!({"replicas": 1, "availableReplicas": 1}),
            );
        }
        for service in store.all::<Service>() {
            store.set_status::<Service>(
                Some(NS),
                &service.name_any(),
                json!({"loadBalancer": {"ingress": [{"ip": "172.18.0.100"}]}}),
            );
        }
    }

    #[tokio::test]
    async fn converges_to_ready() {
        let ctx = context();
        ctx.store.seed(dataplane());

        for _ in 0..5 {
            pass(&ctx).await.unwrap();
            make_children_ready(&ctx.store);
        }

        let dp = stored(&ctx);
        assert!(is_true(&dp, ConditionType::Ready));
        assert!(is_true(&dp, ConditionType::Provisioned));

        let services = ctx.store.all::<Service>();
        assert_eq!(services.len(), 1);
        let status = dp.status.unwrap();
        assert_eq!(status.service, Some(services[0].name_any()));
        assert_eq!(status.addresses, vec!["172.18.0.100"]);

        let deployment = ctx.store.all::<Deployment>().remove(0);
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("kong:3.2"));

        ctx.store.clear_ops();
        pass(&ctx).await.unwrap();
        assert_eq!(ctx.store.mutations(), 0, "{:?}", ctx.store.ops());
    }

    #[tokio::test]
    async fn reverts_drift_on_the_proxy_service() {
        let ctx = context();
        ctx.store.seed(dataplane());
        for _ in 0..4 {
            pass(&ctx).await.unwrap();
        }

        let name = ctx.store.all::<Service>().remove(0).name_any();
        ctx.store
            .patch_spec::<Service>(Some(NS), &name, json!({"type": "ClusterIP"}));
        pass(&ctx).await.unwrap();

        let service = ctx.store.fetch::<Service>(Some(NS), &name).unwrap();
        assert_eq!(service.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(ctx.store.all::<Service>().len(), 1);
    }

    #[tokio::test]
    async fn database_backends_are_rejected() {
        let ctx = context();
        let mut dp = dataplane();
        dp.spec.options.deployment.env = vec![EnvVar {
            name: ENV_KONG_DATABASE.to_string(),
            value: Some("postgres".to_string()),
            ..Default::default()
        }];
        ctx.store.seed(dp);

        assert!(matches!(
            pass(&ctx).await,
            Err(Error::InvalidConfigError(_))
        ));
        let ready = get_condition(&stored(&ctx), ConditionType::Ready)
            .cloned()
            .unwrap();
        assert_eq!(ready.reason, "Invalid");
        assert!(ctx.store.all::<Deployment>().is_empty());
    }

    #[tokio::test]
    async fn duplicate_proxy_services_are_reported() {
        let ctx = context();
        ctx.store.seed(dataplane());
        for _ in 0..5 {
            pass(&ctx).await.unwrap();
            make_children_ready(&ctx.store);
        }
        ctx.store.seed(generate_proxy_service(&stored(&ctx)).unwrap());

        assert!(matches!(
            pass(&ctx).await,
            Err(Error::TooManyChildren { count: 2, .. })
        ));
        let ready = get_condition(&stored(&ctx), ConditionType::Ready)
            .cloned()
            .unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "UnableToProvision");
        assert!(ready.message.contains("Service"));
    }

    #[tokio::test]
    async fn dataplanes_deleted_mid_pass_are_dropped() {
        let ctx = context();
        ctx.store.seed(dataplane());
        ctx.store.inject_deletion();
        assert_eq!(pass(&ctx).await.unwrap(), Action::await_change());
        assert!(ctx.store.fetch::<DataPlane>(Some(NS), "dp").is_none());
    }

    #[tokio::test]
    async fn conflicts_requeue_without_backoff() {
        let ctx = context();
        ctx.store.seed(dataplane());
        ctx.store.inject_conflict();
        assert_eq!(
            pass(&ctx).await.unwrap(),
            Action::requeue(REQUEUE_WITHOUT_BACKOFF)
        );
    }
}
