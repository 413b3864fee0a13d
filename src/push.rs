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

//! The per-push view of the mesh. A [`PushContext`] is immutable once
//! published; every concurrent build of the same push generation shares one
//! instance.

use std::{
    collections::{HashMap, HashSet},
    hash::{Hash, Hasher},
    net::IpAddr,
    sync::Arc,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    cluster::ServiceKey,
    config::MeshConfig,
    mesh::{Labels, MeshEndpoint, Service, WaypointScope},
};

const SUBSYSTEM: &str = "push";

fn cluster_no_instances() -> &'static prometheus::IntCounterVec {
    static CLUSTER_NO_INSTANCES: Lazy<prometheus::IntCounterVec> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntCounterVec::new(
                crate::metrics::opts(
                    "cluster_no_instances_total",
                    SUBSYSTEM,
                    "Builds that produced an assignment with no endpoints.",
                ),
                &["cluster"],
            )
            .unwrap(),
        )
    });

    &CLUSTER_NO_INSTANCES
}

/// Conditions surfaced as push metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyStatus {
    /// A cluster was built with no usable endpoints.
    ClusterNoInstances,
}

/// The kinds of configuration an assignment can depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    DestinationRule,
    ServiceEntry,
}

/// Identifies one piece of configuration for cache invalidation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub kind: ConfigKind,
    pub name: String,
    pub namespace: String,
}

/// The 64-bit digest consumers key invalidations on.
pub type ConfigHash = u64;

impl ConfigKey {
    pub fn new(kind: ConfigKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn hash_code(&self) -> ConfigHash {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A gateway fronting one network. `address` is an IP for the resolved table
/// and may be a hostname in the unresolved one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkGateway {
    pub network: String,
    pub address: String,
    pub port: u16,
}

/// Gateways grouped by the network they front.
#[derive(Clone, Debug, Default)]
pub struct NetworkGateways {
    by_network: HashMap<String, Vec<NetworkGateway>>,
}

impl NetworkGateways {
    pub fn for_network(&self, network: &str) -> &[NetworkGateway] {
        self.by_network
            .get(network)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_network.is_empty()
    }
}

impl FromIterator<NetworkGateway> for NetworkGateways {
    fn from_iter<T: IntoIterator<Item = NetworkGateway>>(iter: T) -> Self {
        let mut by_network: HashMap<String, Vec<NetworkGateway>> = HashMap::new();
        for gateway in iter {
            by_network
                .entry(gateway.network.clone())
                .or_default()
                .push(gateway);
        }
        Self { by_network }
    }
}

/// The cross-network gateway tables for a push: `gateways` with resolved IP
/// addresses, `unresolved` with the raw (possibly hostname) addresses used
/// when the client cluster resolves by DNS anyway.
#[derive(Clone, Debug, Default)]
pub struct NetworkManager {
    pub gateways: NetworkGateways,
    pub unresolved: NetworkGateways,
}

/// Whether peer authentication requires, permits, or forbids mutual TLS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum MtlsMode {
    Strict,
    #[default]
    Permissive,
    Disable,
}

/// The authentication-policy state a push was computed against.
#[derive(Clone, Debug, Default)]
pub struct AuthnPolicies {
    /// An opaque version that changes whenever any authentication policy
    /// does; part of the assignment cache key.
    pub version: String,
    pub default_mode: MtlsMode,
    pub port_modes: HashMap<u16, MtlsMode>,
}

impl AuthnPolicies {
    pub fn get_version(&self) -> &str {
        &self.version
    }

    /// Whether policy permits mutual TLS towards workloads on `port`.
    pub fn mtls_enabled_for_port(&self, port: u16) -> bool {
        let mode = self.port_modes.get(&port).unwrap_or(&self.default_mode);
        *mode != MtlsMode::Disable
    }
}

/// Runtime feature gates. Carried on the push context so builds stay pure
/// functions of their inputs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Features {
    /// Globally enables HTTP CONNECT tunneling. Also bypasses the
    /// per-endpoint precomputed artifact, which is keyed without it.
    pub enable_hbone: bool,
    /// A label marking endpoints as draining regardless of health status.
    pub draining_label: Option<String>,
    /// The service label that keeps draining endpoints advertised.
    pub persistent_session_label: String,
    /// Inject canonical-service labels into endpoint metadata for
    /// mesh-external service entries.
    pub canonical_services_for_mesh_external: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            enable_hbone: false,
            draining_label: None,
            persistent_session_label: "istio.io/persistent-session".into(),
            canonical_services_for_mesh_external: false,
        }
    }
}

/// A snapshot of the mesh state one push generation is computed from.
///
/// Everything here is immutable after construction; concurrent builds share
/// the context by reference for their whole lifetime.
#[derive(Debug, Default)]
pub struct PushContext {
    /// Services by hostname.
    pub services: HashMap<String, Arc<Service>>,
    /// Per-service endpoint snapshots used for inline (CDS) assignment
    /// construction.
    pub service_endpoints: HashMap<ServiceKey, Vec<Arc<MeshEndpoint>>>,
    /// Hostnames forced cluster-local by mesh configuration, in addition to
    /// services marked cluster-local by their own attributes.
    pub cluster_local_hosts: HashSet<String>,
    pub network_manager: NetworkManager,
    /// Waypoint addresses by the scope they serve.
    pub waypoints: HashMap<WaypointScope, Vec<IpAddr>>,
    /// `(network, address)` pairs known to terminate HTTP CONNECT tunnels.
    pub tunnel_capable: HashSet<(String, String)>,
    pub authn_policies: AuthnPolicies,
    pub mesh: MeshConfig,
    pub features: Features,
}

impl PushContext {
    pub fn service_for_hostname(&self, hostname: &str) -> Option<Arc<Service>> {
        self.services.get(hostname).cloned()
    }

    /// The service's endpoints for `port`, filtered to `subset_labels` when
    /// given. This reads the push-time snapshot rather than the live index.
    pub fn service_endpoints_by_port(
        &self,
        service: &Service,
        port: u16,
        subset_labels: Option<&Labels>,
    ) -> Vec<Arc<MeshEndpoint>> {
        let Some(svc_port) = service.ports.get_by_port(port) else {
            return Vec::new();
        };

        let key = ServiceKey::new(&service.hostname, service.namespace());
        self.service_endpoints
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|ep| ep.service_port_name == svc_port.name)
            .filter(|ep| subset_labels.map_or(true, |labels| labels.subset_of(&ep.labels)))
            .cloned()
            .collect()
    }

    pub fn is_cluster_local(&self, service: &Service) -> bool {
        service.attributes.cluster_local || self.cluster_local_hosts.contains(&service.hostname)
    }

    pub fn network_manager(&self) -> &NetworkManager {
        &self.network_manager
    }

    pub fn waypoints_for(&self, scope: &WaypointScope) -> &[IpAddr] {
        self.waypoints
            .get(scope)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the workload at `(network, address)` is known to terminate
    /// tunnels (e.g. has a node proxy in front of it).
    pub fn supports_tunnel(&self, network: &str, address: &str) -> bool {
        self.tunnel_capable
            .contains(&(network.to_owned(), address.to_owned()))
    }

    pub fn authn_policies(&self) -> &AuthnPolicies {
        &self.authn_policies
    }

    pub fn add_metric(&self, status: ProxyStatus, cluster: &str) {
        match status {
            ProxyStatus::ClusterNoInstances => {
                cluster_no_instances().with_label_values(&[cluster]).inc();
            }
        }
    }

    /// Reads the current value of a push metric, mainly for tests and the
    /// debug interface.
    pub fn metric_value(status: ProxyStatus, cluster: &str) -> u64 {
        match status {
            ProxyStatus::ClusterNoInstances => {
                cluster_no_instances().with_label_values(&[cluster]).get()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtls_port_override() {
        let policies = AuthnPolicies {
            version: "v1".into(),
            default_mode: MtlsMode::Permissive,
            port_modes: [(9080, MtlsMode::Disable)].into(),
        };

        assert!(!policies.mtls_enabled_for_port(9080));
        assert!(policies.mtls_enabled_for_port(9081));
    }

    #[test]
    fn config_key_hash_is_stable_and_distinct() {
        let key = ConfigKey::new(ConfigKind::DestinationRule, "reviews", "default");
        assert_eq!(key.hash_code(), key.hash_code());

        let other = ConfigKey::new(ConfigKind::ServiceEntry, "reviews", "default");
        assert_ne!(key.hash_code(), other.hash_code());
    }

    #[test]
    fn gateways_grouped_by_network() {
        let gateways: NetworkGateways = [
            NetworkGateway {
                network: "n2".into(),
                address: "203.0.113.5".into(),
                port: 15443,
            },
            NetworkGateway {
                network: "n2".into(),
                address: "203.0.113.6".into(),
                port: 15443,
            },
        ]
        .into_iter()
        .collect();

        assert_eq!(gateways.for_network("n2").len(), 2);
        assert!(gateways.for_network("n1").is_empty());
    }
}
