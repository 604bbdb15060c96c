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

use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;

use crate::crd::{ControlPlane, DataPlane};

// Capability shared by every object whose status carries a list of conditions.
// The condition algorithms in crate::conditions work on anything implementing it.
pub trait HasConditions: Resource {
    fn get_conditions(&self) -> &[metav1::Condition];
    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition>;
}

impl HasConditions for Gateway {
    fn get_conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
    }
}

impl HasConditions for GatewayClass {
    fn get_conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
    }
}

impl HasConditions for ControlPlane {
    fn get_conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HasConditions for DataPlane {
    fn get_conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }

    fn get_conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
