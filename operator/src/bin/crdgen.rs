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

// Prints the CustomResourceDefinitions of the operator as a multi document YAML stream.

use gateway_operator::crd::{ControlPlane, DataPlane, GatewayConfiguration};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        ControlPlane::crd(),
        DataPlane::crd(),
        GatewayConfiguration::crd(),
    ];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}
