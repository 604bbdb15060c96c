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

use chrono::Utc;
use gateway_api::apis::standard::{
    constants::{GatewayConditionReason, GatewayConditionType},
    gatewayclasses::GatewayClass,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::conditions::{is_true, set_condition, ConditionType};

// Whether Gateways of this class are handled by the operator running as
// `controller_name`.
pub fn is_supported(gateway_class: &GatewayClass, controller_name: &str) -> bool {
    gateway_class.spec.controller_name == controller_name
}

pub fn is_accepted(gateway_class: &GatewayClass) -> bool {
    is_true(gateway_class, ConditionType::Accepted)
}

pub fn accept(gateway_class: &mut GatewayClass, controller_name: &str) {
    let now = metav1::Time(Utc::now());
    let accepted = metav1::Condition {
        type_: GatewayConditionType::Accepted.to_string(),
        status: String::from("True"),
        reason: GatewayConditionReason::Accepted.to_string(),
        observed_generation: gateway_class.metadata.generation,
        last_transition_time: now,
        message: format!("{controller_name} accepts responsibility for this GatewayClass"),
    };
    set_condition(gateway_class, accepted);
}
