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

use clap::Parser;

use crate::consts::DEFAULT_CONTROLLER_NAME;

/// Command line and environment configuration of the manager.
#[derive(Parser, Clone, Debug)]
#[command(name = "manager", version, about = "Kong gateway operator")]
pub struct Config {
    /// GatewayClasses with this controllerName are managed by this operator.
    #[arg(
        long,
        env = "GATEWAY_OPERATOR_CONTROLLER_NAME",
        default_value = DEFAULT_CONTROLLER_NAME
    )]
    pub controller_name: String,

    /// Name of the Secret holding the CA that signs ControlPlane certificates.
    #[arg(
        long,
        env = "GATEWAY_OPERATOR_CLUSTER_CA_SECRET_NAME",
        default_value = "kong-operator-ca"
    )]
    pub cluster_ca_secret_name: String,

    #[arg(
        long,
        env = "GATEWAY_OPERATOR_CLUSTER_CA_SECRET_NAMESPACE",
        default_value = "kong-system"
    )]
    pub cluster_ca_secret_namespace: String,

    /// Allows any ControlPlane image and enables human readable logs.
    #[arg(long, env = "GATEWAY_OPERATOR_DEVELOPMENT_MODE")]
    pub development_mode: bool,
}
