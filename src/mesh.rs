/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The mesh model: services, workload endpoints, and the proxies that
//! subscribe to them.

pub mod endpoint;
pub mod locality;
pub mod proxy;
pub mod service;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use self::{
    endpoint::{Discoverability, HealthStatus, MeshEndpoint, TunnelAbility},
    locality::Locality,
    proxy::{NodeType, Proxy, ProxyView, SidecarScope, TrafficDirection, WaypointScope},
    service::{Resolution, Service, ServiceAttributes, ServicePort, ServicePorts},
};

/// A set of workload or service labels.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    /// Returns whether every label in `self` is present with the same value
    /// in `other`.
    pub fn subset_of(&self, other: &Self) -> bool {
        self.0
            .iter()
            .all(|(key, value)| other.0.get(key).map(String::as_str) == Some(value))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` is set to a non-empty value.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| !value.is_empty())
    }
}

impl std::ops::Deref for Labels {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for Labels {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Labels {
    fn from(value: [(K, V); N]) -> Self {
        value.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_of() {
        let subset = Labels::from([("version", "v1")]);
        let labels = Labels::from([("app", "reviews"), ("version", "v1")]);

        assert!(subset.subset_of(&labels));
        assert!(!labels.subset_of(&subset));
        assert!(Labels::default().subset_of(&labels));
        assert!(!Labels::from([("version", "v2")]).subset_of(&labels));
    }
}
