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

//! Custom resources owned by the operator.
//!
//! Gateway and GatewayClass come from the `gateway-api` crate; the types here
//! describe the ControlPlane and DataPlane intent resources and the
//! GatewayConfiguration a GatewayClass can point to through its parametersRef.

mod controlplane;
mod dataplane;
mod gateway_configuration;
mod shared;

pub use controlplane::{ControlPlane, ControlPlaneOptions, ControlPlaneSpec, ControlPlaneStatus};
pub use dataplane::{DataPlane, DataPlaneOptions, DataPlaneSpec, DataPlaneStatus};
pub use gateway_configuration::{
    GatewayConfiguration, GatewayConfigurationSpec, GatewayConfigurationStatus,
};
pub use shared::DeploymentOptions;
