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

//! Condition helpers shared by every object implementing [HasConditions].
//!
//! A condition type is a unique key within an object's status: setting a
//! condition always replaces the previous entry of the same type.

use std::fmt;

use chrono::Utc;
use kube::runtime::controller::Action;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::{
    store::{Object, ObjectStore},
    traits::HasConditions,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
    Scheduled,
    Accepted,
    Programmed,
    Provisioned,
    DataPlaneReady,
    ControlPlaneReady,
    GatewayService,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Scheduled => "Scheduled",
            ConditionType::Accepted => "Accepted",
            ConditionType::Programmed => "Programmed",
            ConditionType::Provisioned => "Provisioned",
            ConditionType::DataPlaneReady => "DataPlaneReady",
            ConditionType::ControlPlaneReady => "ControlPlaneReady",
            ConditionType::GatewayService => "GatewayService",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionReason {
    Accepted,
    DependenciesNotReady,
    Ready,
    Scheduled,
    Provisioned,
    Programmed,
    WaitingToBecomeReady,
    UnableToProvision,
    Pending,
    GatewayServiceError,
    DataPlaneSet,
    DataPlaneNotSet,
    Invalid,
}

impl ConditionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::Accepted => "Accepted",
            ConditionReason::DependenciesNotReady => "DependenciesNotReady",
            ConditionReason::Ready => "Ready",
            ConditionReason::Scheduled => "Scheduled",
            ConditionReason::Provisioned => "Provisioned",
            ConditionReason::Programmed => "Programmed",
            ConditionReason::WaitingToBecomeReady => "WaitingToBecomeReady",
            ConditionReason::UnableToProvision => "UnableToProvision",
            ConditionReason::Pending => "Pending",
            ConditionReason::GatewayServiceError => "GatewayServiceError",
            ConditionReason::DataPlaneSet => "DataPlaneSet",
            ConditionReason::DataPlaneNotSet => "DataPlaneNotSet",
            ConditionReason::Invalid => "Invalid",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEPENDENCIES_NOT_READY_MESSAGE: &str = "There are other conditions that are not yet ready";
pub const WAITING_TO_BECOME_READY_MESSAGE: &str = "waiting for the resource to become ready";

fn status_str(status: bool) -> &'static str {
    if status {
        "True"
    } else {
        "False"
    }
}

pub fn new_condition(
    type_: ConditionType,
    status: bool,
    reason: ConditionReason,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: status_str(status).to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: metav1::Time(Utc::now()),
    }
}

// Replaces any condition of the same type and appends the new one. The
// transition time of the replaced condition is carried over when its status
// doesn't change.
pub fn set_condition<T: HasConditions>(obj: &mut T, mut new_cond: metav1::Condition) {
    let conditions = obj.get_conditions_mut();
    if let Some(idx) = conditions.iter().position(|c| c.type_ == new_cond.type_) {
        let old = conditions.remove(idx);
        if old.status == new_cond.status {
            new_cond.last_transition_time = old.last_transition_time;
        }
    }
    conditions.push(new_cond);
}

pub fn get_condition<T: HasConditions>(obj: &T, type_: ConditionType) -> Option<&metav1::Condition> {
    obj.get_conditions()
        .iter()
        .find(|c| c.type_ == type_.as_str())
}

pub fn is_true<T: HasConditions>(obj: &T, type_: ConditionType) -> bool {
    get_condition(obj, type_).is_some_and(|c| c.status == "True")
}

fn init<T: HasConditions>(obj: &mut T, type_: ConditionType, reason: ConditionReason) {
    if get_condition(obj, type_).is_none() {
        let generation = obj.meta().generation;
        set_condition(
            obj,
            new_condition(type_, false, reason, DEPENDENCIES_NOT_READY_MESSAGE, generation),
        );
    }
}

pub fn init_ready<T: HasConditions>(obj: &mut T) {
    init(obj, ConditionType::Ready, ConditionReason::DependenciesNotReady);
}

pub fn init_programmed<T: HasConditions>(obj: &mut T) {
    init(obj, ConditionType::Programmed, ConditionReason::Pending);
}

pub fn init_ready_and_programmed<T: HasConditions>(obj: &mut T) {
    init_ready(obj);
    init_programmed(obj);
}

// Returns true if persisting `desired` would change anything observable in the
// conditions of `current`. Order and timestamps are ignored.
pub fn needs_status_update<T: HasConditions>(current: &T, desired: &T) -> bool {
    let current = current.get_conditions();
    let desired = desired.get_conditions();
    if current.len() != desired.len() {
        return true;
    }
    desired.iter().any(|d| {
        match current.iter().find(|c| c.type_ == d.type_) {
            Some(c) => c.status != d.status || c.reason != d.reason || c.message != d.message,
            None => true,
        }
    })
}

// Records `error` as a False condition of `type_` on `obj`, persisting the
// status only if it changed compared to `original`, and fails the pass with it.
pub async fn record_error<S, K>(
    store: &S,
    original: &K,
    mut obj: K,
    type_: ConditionType,
    reason: ConditionReason,
    error: Error,
) -> Result<Action>
where
    S: ObjectStore,
    K: HasConditions + Object,
{
    let generation = obj.meta().generation;
    set_condition(
        &mut obj,
        new_condition(type_, false, reason, error.to_string(), generation),
    );
    if needs_status_update(original, &obj) {
        store.update_status(&obj).await?;
    }
    Err(error)
}

// True when every condition other than Ready and Programmed, which are derived
// from the others, is True.
pub fn all_dependencies_true<T: HasConditions>(obj: &T) -> bool {
    obj.get_conditions()
        .iter()
        .filter(|c| {
            c.type_ != ConditionType::Ready.as_str() && c.type_ != ConditionType::Programmed.as_str()
        })
        .all(|c| c.status == "True")
}

fn set_aggregate<T: HasConditions>(obj: &mut T, type_: ConditionType, reason: ConditionReason) {
    let generation = obj.meta().generation;
    let cond = if all_dependencies_true(obj) {
        new_condition(type_, true, reason, "", generation)
    } else {
        new_condition(
            type_,
            false,
            ConditionReason::DependenciesNotReady,
            DEPENDENCIES_NOT_READY_MESSAGE,
            generation,
        )
    };
    set_condition(obj, cond);
}

pub fn set_ready<T: HasConditions>(obj: &mut T) {
    set_aggregate(obj, ConditionType::Ready, ConditionReason::Ready);
}

pub fn set_programmed<T: HasConditions>(obj: &mut T) {
    set_aggregate(obj, ConditionType::Programmed, ConditionReason::Programmed);
}

pub fn set_ready_and_programmed<T: HasConditions>(obj: &mut T) {
    set_ready(obj);
    set_programmed(obj);
}
