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

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use super::{Labels, Locality, Proxy};
use crate::generated::envoy::config::endpoint::v3::LbEndpoint;

/// The TLS mode label value marking a workload that can terminate mesh
/// mutual TLS.
pub const TLS_MODE_MUTUAL: &str = "istio";

/// The health of an endpoint as reported by its registry.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    schemars::JsonSchema,
)]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
    /// Terminating: only advertised to clusters with persistent sessions.
    Draining,
    Degraded,
}

impl HealthStatus {
    /// The matching `envoy.config.core.v3.HealthStatus` wire value.
    pub fn as_envoy(self) -> i32 {
        match self {
            Self::Healthy => 1,
            Self::Unhealthy => 2,
            Self::Draining => 3,
            Self::Degraded => 5,
        }
    }
}

/// Tunneling protocols an endpoint advertises support for.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    schemars::JsonSchema,
)]
pub enum TunnelAbility {
    #[default]
    None,
    /// The endpoint accepts HTTP CONNECT tunnels on the well-known inbound
    /// port.
    Http,
}

impl TunnelAbility {
    pub fn supports_http(self) -> bool {
        matches!(self, Self::Http)
    }
}

/// Which proxies an endpoint may be advertised to.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    schemars::JsonSchema,
)]
pub enum Discoverability {
    /// Visible to every proxy in the mesh.
    #[default]
    Global,
    /// Visible only to proxies in the endpoint's own cluster.
    SameCluster,
}

/// The subset of endpoint state that is rendered into LbEndpoint metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointMetadata {
    pub namespace: String,
    pub workload_name: String,
    pub labels: Labels,
    pub tls_mode: String,
}

/// A fully built LbEndpoint memoized on its endpoint, together with the mTLS
/// decision it was built under. Rebuilt when that decision flips.
#[derive(Clone, Debug)]
pub struct PrecomputedEndpoint {
    pub lb_endpoint: LbEndpoint,
    pub mtls: bool,
}

/// One reachable backend instance of a service.
///
/// The address may be empty when the endpoint can only be reached through a
/// network gateway; such endpoints are rewritten during assembly.
#[derive(Debug, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub struct MeshEndpoint {
    #[serde(default)]
    pub address: String,
    pub endpoint_port: u16,
    /// The *name* of the service port this endpoint serves; endpoints are
    /// keyed by port name, not number.
    pub service_port_name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub locality: Locality,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub labels: Labels,
    /// Plain account name or SPIFFE identity URI.
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub health_status: HealthStatus,
    /// Zero is treated as the default weight of one.
    #[serde(default)]
    pub load_balancing_weight: u32,
    /// [`TLS_MODE_MUTUAL`] or empty.
    #[serde(default)]
    pub tls_mode: String,
    #[serde(default)]
    pub tunnel: TunnelAbility,
    #[serde(default)]
    pub discoverability: Discoverability,
    #[serde(skip)]
    #[schemars(skip)]
    pub(crate) precomputed: ArcSwapOption<PrecomputedEndpoint>,
}

impl MeshEndpoint {
    /// The endpoint's effective load balancing weight, at least one.
    pub fn weight(&self) -> u32 {
        self.load_balancing_weight.max(1)
    }

    /// The memoized LbEndpoint, if any. Writers race benignly: every writer
    /// derives the value from the same immutable push inputs.
    pub fn precomputed(&self) -> Option<Arc<PrecomputedEndpoint>> {
        self.precomputed.load_full()
    }

    pub fn store_precomputed(&self, lb_endpoint: LbEndpoint, mtls: bool) {
        self.precomputed
            .store(Some(Arc::new(PrecomputedEndpoint { lb_endpoint, mtls })));
    }

    /// The bare service-account name, with any SPIFFE URI prefix stripped.
    pub fn service_account_name(&self) -> &str {
        match self.service_account.split_once("/sa/") {
            Some((prefix, account)) if prefix.starts_with("spiffe://") => account,
            _ => &self.service_account,
        }
    }

    pub fn discoverable_from(&self, proxy: &Proxy) -> bool {
        match self.discoverability {
            Discoverability::Global => true,
            Discoverability::SameCluster => self.locality.cluster_id == proxy.cluster_id,
        }
    }

    pub fn metadata(&self) -> EndpointMetadata {
        EndpointMetadata {
            namespace: self.namespace.clone(),
            workload_name: self.workload_name.clone(),
            labels: self.labels.clone(),
            tls_mode: self.tls_mode.clone(),
        }
    }
}

impl Clone for MeshEndpoint {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            endpoint_port: self.endpoint_port,
            service_port_name: self.service_port_name.clone(),
            network: self.network.clone(),
            locality: self.locality.clone(),
            node_name: self.node_name.clone(),
            namespace: self.namespace.clone(),
            workload_name: self.workload_name.clone(),
            labels: self.labels.clone(),
            service_account: self.service_account.clone(),
            health_status: self.health_status,
            load_balancing_weight: self.load_balancing_weight,
            tls_mode: self.tls_mode.clone(),
            tunnel: self.tunnel,
            discoverability: self.discoverability,
            precomputed: ArcSwapOption::new(self.precomputed.load_full()),
        }
    }
}

impl PartialEq for MeshEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.endpoint_port == other.endpoint_port
            && self.service_port_name == other.service_port_name
            && self.network == other.network
            && self.locality == other.locality
            && self.node_name == other.node_name
            && self.namespace == other.namespace
            && self.workload_name == other.workload_name
            && self.labels == other.labels
            && self.service_account == other.service_account
            && self.health_status == other.health_status
            && self.load_balancing_weight == other.load_balancing_weight
            && self.tls_mode == other.tls_mode
            && self.tunnel == other.tunnel
            && self.discoverability == other.discoverability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_defaults_to_one() {
        let endpoint = MeshEndpoint::default();
        assert_eq!(endpoint.weight(), 1);

        let endpoint = MeshEndpoint {
            load_balancing_weight: 3,
            ..MeshEndpoint::default()
        };
        assert_eq!(endpoint.weight(), 3);
    }

    #[test]
    fn service_account_name() {
        let endpoint = MeshEndpoint {
            service_account: "spiffe://cluster.local/ns/default/sa/bookinfo-reviews".into(),
            ..MeshEndpoint::default()
        };
        assert_eq!(endpoint.service_account_name(), "bookinfo-reviews");

        let endpoint = MeshEndpoint {
            service_account: "bookinfo-reviews".into(),
            ..MeshEndpoint::default()
        };
        assert_eq!(endpoint.service_account_name(), "bookinfo-reviews");
    }

    #[test]
    fn precomputed_slot_survives_clone() {
        let endpoint = MeshEndpoint::default();
        assert!(endpoint.precomputed().is_none());

        endpoint.store_precomputed(<_>::default(), true);
        let clone = endpoint.clone();
        assert!(clone.precomputed().is_some_and(|pre| pre.mtls));
    }
}
