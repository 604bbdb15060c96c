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

use gateway_operator::{config::Config, *};

use clap::Parser;
use kube::Client;
use tokio::try_join;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let subscriber = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    if config.development_mode {
        subscriber.pretty().init();
    } else {
        subscriber.init();
    }

    let client = Client::try_default().await?;
    let ctx = Context::new(client, &config);
    info!(
        controller_name = config.controller_name,
        development_mode = config.development_mode,
        "starting controllers"
    );

    if let Err(error) = try_join!(
        gatewayclass_controller(ctx.clone()),
        gateway_controller(ctx.clone()),
        controlplane_controller(ctx.clone()),
        dataplane_controller(ctx),
    ) {
        error!("failed to start controllers: {error:?}");
        std::process::exit(1);
    }

    Ok(())
}
