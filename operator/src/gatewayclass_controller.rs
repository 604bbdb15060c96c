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

use futures::StreamExt;
use std::{sync::Arc, time::Instant};

use crate::{consts::*, store::ObjectStore, *};
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};

use gatewayclass_utils::*;
use tracing::*;

pub async fn reconcile<S: ObjectStore>(
    gateway_class: Arc<GatewayClass>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let name = gateway_class.name_any();

    let Some(mut gwc) = ctx.store.get::<GatewayClass>(None, &name).await? else {
        return Ok(Action::await_change());
    };

    // Classes of other controllers are left alone; a change of their
    // controllerName is a watch event of its own.
    if !is_supported(&gwc, &ctx.controller_name) {
        return Ok(Action::await_change());
    }

    if !is_accepted(&gwc) {
        info!("marking gateway class {:?} as accepted", name);
        accept(&mut gwc, &ctx.controller_name);
        match ctx.store.update_status(&gwc).await {
            Err(error) if error.is_conflict() => {
                return Ok(Action::requeue(REQUEUE_WITHOUT_BACKOFF))
            }
            Err(error) if error.is_not_found() => return Ok(Action::await_change()),
            result => {
                result?;
            }
        }
    }

    let duration = start.elapsed();
    info!("finished reconciling in {:?} ms", duration.as_millis());
    Ok(Action::await_change())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gwc_api = Api::<GatewayClass>::all(ctx.client());
    gwc_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(gwc_api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<GatewayClass>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(ERROR_REQUEUE)
}
