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

//! Builds the cluster load assignment for one `(proxy, cluster)` pair.
//!
//! An [`EndpointBuilder`] is created per build, lives for the duration of
//! one assignment construction, and is discarded; the endpoint index and
//! push context outlive it. Every failure mode degrades to an empty or
//! partial assignment, which the data plane treats as "no endpoints".

pub(crate) mod mtls;
pub(crate) mod network;
pub(crate) mod tunnel;

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::Hasher,
    sync::Arc,
};

use crate::{
    cluster::{is_dns_srv_key, ClusterKey, EndpointIndex, EndpointShards},
    config::{self, ConsolidatedDestRule, DestinationRule},
    generated::envoy::config::{
        core::v3 as core,
        endpoint::v3::{ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints},
    },
    mesh::{
        HealthStatus, Labels, Locality, MeshEndpoint, NodeType, Proxy, ProxyView, Service,
        ServicePort, TrafficDirection,
    },
    push::{ConfigHash, ConfigKey, ConfigKind, NetworkGateways, ProxyStatus, PushContext},
    xds::loadbalancer,
};

use self::mtls::MtlsChecker;

const SEPARATOR: &[u8] = b"~";
const SLASH: &[u8] = b"/";

/// One locality's endpoints during assembly: the mesh endpoints and the
/// LbEndpoints built from them, positionally aligned.
#[derive(Clone, Debug, Default)]
pub(crate) struct LocalityEndpoints {
    pub(crate) mesh_endpoints: Vec<Arc<MeshEndpoint>>,
    pub(crate) llb_endpoints: LocalityLbEndpoints,
}

impl LocalityEndpoints {
    pub(crate) fn new(locality: Option<core::Locality>) -> Self {
        Self {
            mesh_endpoints: Vec::new(),
            llb_endpoints: LocalityLbEndpoints {
                locality,
                ..LocalityLbEndpoints::default()
            },
        }
    }

    pub(crate) fn push(&mut self, ep: Arc<MeshEndpoint>, lb_endpoint: LbEndpoint) {
        self.mesh_endpoints.push(ep);
        self.llb_endpoints.lb_endpoints.push(lb_endpoint);
    }

    /// Recomputes the group weight as the saturating sum of the member
    /// weights. Returns whether the sum overflowed.
    pub(crate) fn refresh_weight(&mut self) -> bool {
        if self.llb_endpoints.lb_endpoints.is_empty() {
            self.llb_endpoints.load_balancing_weight = None;
            return false;
        }

        let mut overflowed = false;
        let mut total = 0u32;
        for lb_endpoint in &self.llb_endpoints.lb_endpoints {
            let weight = lb_endpoint.load_balancing_weight.unwrap_or(1);
            match total.checked_add(weight) {
                Some(sum) => total = sum,
                None => {
                    total = u32::MAX;
                    overflowed = true;
                }
            }
        }
        self.llb_endpoints.load_balancing_weight = Some(total);
        overflowed
    }
}

fn convert_locality(label: &str) -> Option<core::Locality> {
    if label.is_empty() {
        return None;
    }

    let locality = Locality::from_label(label);
    Some(core::Locality {
        region: locality.region,
        zone: locality.zone,
        sub_zone: locality.sub_zone,
    })
}

/// An assignment with a name but no endpoints.
pub fn empty_cluster_load_assignment(cluster_name: &str) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster_name.into(),
        ..ClusterLoadAssignment::default()
    }
}

/// Assembles the cluster load assignment for one `(proxy, cluster)` pair.
///
/// The primary-key fields at the top double as the assignment cache key; see
/// [`EndpointBuilder::cache_key`].
#[derive(Clone)]
pub struct EndpointBuilder<'a> {
    pub(crate) cluster_name: String,
    pub(crate) network: String,
    proxy_view: ProxyView,
    cluster_id: String,
    locality: Locality,
    destination_rule: Option<Arc<ConsolidatedDestRule>>,
    pub(crate) service: Option<Arc<Service>>,
    cluster_local: bool,
    node_type: NodeType,
    failover_priority_labels: Vec<u8>,

    subset_name: String,
    subset_labels: Option<Labels>,
    pub(crate) hostname: String,
    pub(crate) port: u16,
    pub(crate) push: &'a PushContext,
    pub(crate) proxy: &'a Proxy,
    pub(crate) dir: TrafficDirection,

    mtls_checker: MtlsChecker,
}

impl<'a> EndpointBuilder<'a> {
    /// Builds from a cluster name, resolving the service and destination
    /// rule from the push context. Used on the endpoint discovery path.
    pub fn new(cluster_name: &str, proxy: &'a Proxy, push: &'a PushContext) -> Self {
        let key = ClusterKey::parse(cluster_name);
        let service = push.service_for_hostname(&key.hostname);
        let destination_rule = service.as_ref().and_then(|service| {
            proxy
                .sidecar_scope
                .destination_rule(TrafficDirection::Outbound, &service.hostname)
        });

        Self::for_cds(
            proxy,
            push,
            cluster_name,
            key.direction,
            key.subset,
            key.hostname,
            key.port,
            service,
            destination_rule,
        )
    }

    /// Builds with the service and destination rule already resolved, for
    /// cluster emission where both are at hand.
    #[allow(clippy::too_many_arguments)]
    pub fn for_cds(
        proxy: &'a Proxy,
        push: &'a PushContext,
        cluster_name: &str,
        dir: TrafficDirection,
        subset_name: String,
        hostname: String,
        port: u16,
        service: Option<Arc<Service>>,
        destination_rule: Option<Arc<ConsolidatedDestRule>>,
    ) -> Self {
        let cluster_local = service
            .as_deref()
            .map(|service| push.is_cluster_local(service))
            .unwrap_or(false);

        let mut builder = Self {
            cluster_name: cluster_name.into(),
            network: proxy.network.clone(),
            proxy_view: proxy.view.clone(),
            cluster_id: proxy.cluster_id.clone(),
            locality: proxy.locality.clone(),
            destination_rule,
            service,
            cluster_local,
            node_type: proxy.node_type,
            failover_priority_labels: Vec::new(),
            subset_name,
            subset_labels: None,
            hostname,
            port,
            push,
            proxy,
            dir,
            mtls_checker: MtlsChecker::disabled(),
        };
        builder.populate_subset_info();
        builder.populate_failover_priority_labels();
        builder
    }

    /// A copy of this builder retargeted at another subset of the same
    /// cluster.
    pub fn with_subset(&self, subset: &str) -> Self {
        let mut builder = self.clone();
        builder.subset_name = subset.into();
        builder.populate_subset_info();
        builder
    }

    fn rule_spec(&self) -> Option<&DestinationRule> {
        self.destination_rule
            .as_deref()
            .and_then(ConsolidatedDestRule::rule)
    }

    fn populate_subset_info(&mut self) {
        if self.dir == TrafficDirection::InboundVip {
            if let Some(stripped) = self.subset_name.strip_prefix("http/") {
                self.subset_name = stripped.into();
            }
            if let Some(stripped) = self.subset_name.strip_prefix("tcp/") {
                self.subset_name = stripped.into();
            }
        }

        let rule = self.destination_rule.clone();
        let rule = rule.as_deref().and_then(ConsolidatedDestRule::rule);
        self.mtls_checker = MtlsChecker::new(self.push, self.port, rule, &self.subset_name);
        self.subset_labels = config::subset_labels(rule, &self.subset_name);
    }

    fn populate_failover_priority_labels(&mut self) {
        let rule = self.destination_rule.clone();
        let rule = rule.as_deref().and_then(ConsolidatedDestRule::rule);
        let (enable_failover, lb) =
            config::outlier_and_lb_settings(rule, self.port, &self.subset_name);
        if !enable_failover {
            return;
        }

        let setting = loadbalancer::locality_lb_setting(
            self.push.mesh.locality_lb_setting(),
            lb.as_ref().and_then(|lb| lb.locality_lb_setting.as_ref()),
        );
        if let Some(setting) = setting {
            if setting.distribute.is_empty() && !setting.failover_priority.is_empty() {
                self.failover_priority_labels = loadbalancer::failover_priority_labels(
                    &self.proxy.labels,
                    &setting.failover_priority,
                );
            }
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn service_found(&self) -> bool {
        self.service.is_some()
    }

    /// Whether endpoint resolution is delegated to DNS, which suppresses
    /// endpoint discovery for the cluster.
    pub fn is_dns_cluster(&self) -> bool {
        self.service
            .as_deref()
            .is_some_and(|service| service.resolution.is_dns())
    }

    fn service_port(&self, port: u16) -> Option<&ServicePort> {
        let Some(service) = self.service.as_deref() else {
            tracing::debug!(
                cluster = %self.cluster_name,
                hostname = %self.hostname,
                "no service for cluster",
            );
            return None;
        };

        let svc_port = service.ports.get_by_port(port);
        if svc_port.is_none() {
            tracing::debug!(
                cluster = %self.cluster_name,
                port,
                "service port not found for cluster",
            );
        }
        svc_port
    }

    /// The gateway table for cross-network rewriting; DNS-resolved clusters
    /// take the unresolved one since the client resolves hostnames anyway.
    pub(crate) fn gateways(&self) -> &NetworkGateways {
        if self.is_dns_cluster() {
            &self.push.network_manager().unresolved
        } else {
            &self.push.network_manager().gateways
        }
    }

    /// The 64-bit assignment cache key: a pure function of every input that
    /// can change how endpoints are generated for this `(proxy, cluster)`.
    pub fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.write_hash(&mut hasher);
        hasher.finish()
    }

    fn write_hash(&self, hasher: &mut impl Hasher) {
        hasher.write(self.cluster_name.as_bytes());
        hasher.write(SEPARATOR);
        hasher.write(self.network.as_bytes());
        hasher.write(SEPARATOR);
        hasher.write(self.cluster_id.as_bytes());
        hasher.write(SEPARATOR);
        hasher.write(self.node_type.to_string().as_bytes());
        hasher.write(SEPARATOR);
        hasher.write(self.cluster_local.to_string().as_bytes());
        hasher.write(SEPARATOR);
        if self.push.features.enable_hbone {
            hasher.write(self.proxy.is_proxyless_grpc().to_string().as_bytes());
            hasher.write(SEPARATOR);
        }
        hasher.write(self.locality.label().as_bytes());
        hasher.write(SEPARATOR);
        if !self.failover_priority_labels.is_empty() {
            hasher.write(&self.failover_priority_labels);
            hasher.write(SEPARATOR);
        }
        if self
            .service
            .as_deref()
            .is_some_and(|service| service.attributes.node_local)
        {
            hasher.write(self.proxy.node_name.as_bytes());
            hasher.write(SEPARATOR);
        }

        hasher.write(self.push.authn_policies().get_version().as_bytes());
        hasher.write(SEPARATOR);

        if let Some(destination_rule) = &self.destination_rule {
            for (name, namespace) in destination_rule.from() {
                hasher.write(name.as_bytes());
                hasher.write(SLASH);
                hasher.write(namespace.as_bytes());
            }
        }
        hasher.write(SEPARATOR);

        if let Some(service) = self.service.as_deref() {
            hasher.write(service.hostname.as_bytes());
            hasher.write(SLASH);
            hasher.write(service.namespace().as_bytes());
        }
        hasher.write(SEPARATOR);

        hasher.write(self.proxy_view.to_string().as_bytes());
        hasher.write(SEPARATOR);
    }

    /// Whether the result may be cached at all. Without a service there is
    /// no config to key invalidation on (and the assignment is empty
    /// anyway).
    pub fn cacheable(&self) -> bool {
        self.service.is_some()
    }

    /// The config digests whose changes must invalidate a cached result.
    pub fn dependent_configs(&self) -> Vec<ConfigHash> {
        let mut configs = Vec::new();
        if let Some(destination_rule) = &self.destination_rule {
            for (name, namespace) in destination_rule.from() {
                configs
                    .push(ConfigKey::new(ConfigKind::DestinationRule, name, namespace).hash_code());
            }
        }
        if let Some(service) = self.service.as_deref() {
            configs.push(
                ConfigKey::new(
                    ConfigKind::ServiceEntry,
                    &service.hostname,
                    service.namespace(),
                )
                .hash_code(),
            );
        }
        configs
    }

    /// Builds locality endpoints from the push context's per-service
    /// snapshot. Used for cluster emission; does not touch the per-endpoint
    /// precomputed artifact.
    pub fn from_service_endpoints(&self) -> Vec<LocalityLbEndpoints> {
        let Some(service) = self.service.as_deref() else {
            return Vec::new();
        };
        let eps =
            self.push
                .service_endpoints_by_port(service, self.port, self.subset_labels.as_ref());
        self.generate(eps, false)
            .into_iter()
            .map(|group| group.llb_endpoints)
            .collect()
    }

    /// Builds the cluster load assignment from the live endpoint index. Used
    /// for endpoint discovery; reuses and updates the per-endpoint
    /// precomputed artifact.
    pub fn build_cluster_load_assignment(&self, index: &EndpointIndex) -> ClusterLoadAssignment {
        let eps = self.snapshot_shards(index);
        let locality_endpoints = self.generate(eps, true);
        if locality_endpoints.is_empty() {
            return empty_cluster_load_assignment(&self.cluster_name);
        }

        let mut assignment = self.cluster_load_assignment(&locality_endpoints);

        // Failover without outlier detection would never trip; the data
        // plane could not detect unhealthy tiers to fail away from.
        let (enable_failover, lb) =
            config::outlier_and_lb_settings(self.rule_spec(), self.port, &self.subset_name);
        let setting = loadbalancer::locality_lb_setting(
            self.push.mesh.locality_lb_setting(),
            lb.as_ref().and_then(|lb| lb.locality_lb_setting.as_ref()),
        );
        if let Some(setting) = setting {
            loadbalancer::apply_locality_lb_setting(
                &mut assignment,
                &locality_endpoints,
                &self.locality,
                &self.proxy.labels,
                setting,
                enable_failover,
            );
        }

        assignment
    }

    /// Generates the locality-grouped endpoints: filter, build (or reuse)
    /// each LbEndpoint, group by locality in lexicographic order, sum
    /// weights, and apply the cross-network rewrite.
    fn generate(
        &self,
        eps: Vec<Arc<MeshEndpoint>>,
        allow_precomputed: bool,
    ) -> Vec<LocalityEndpoints> {
        if !self.service_found() {
            self.push
                .add_metric(ProxyStatus::ClusterNoInstances, &self.cluster_name);
            return Vec::new();
        }
        let Some(svc_port) = self.service_port(self.port) else {
            return Vec::new();
        };

        let eps: Vec<_> = eps
            .into_iter()
            .filter(|ep| self.keep_endpoint(ep, svc_port))
            .collect();

        let mut by_locality: HashMap<String, LocalityEndpoints> = HashMap::new();
        for ep in eps {
            let mtls_enabled = self.mtls_checker.check(&ep);

            // The artifact is invalid when the mTLS decision flipped, and is
            // bypassed wholesale under global HBONE, where generation also
            // depends on the requesting proxy.
            let mut lb_endpoint = None;
            if allow_precomputed && !self.push.features.enable_hbone {
                if let Some(precomputed) = ep.precomputed() {
                    if precomputed.mtls == mtls_enabled {
                        lb_endpoint = Some(precomputed.lb_endpoint.clone());
                    }
                }
            }
            let lb_endpoint = match lb_endpoint {
                Some(lb_endpoint) => lb_endpoint,
                None => {
                    let Some(lb_endpoint) = tunnel::build_lb_endpoint(self, &ep, mtls_enabled)
                    else {
                        continue;
                    };
                    if allow_precomputed {
                        ep.store_precomputed(lb_endpoint.clone(), mtls_enabled);
                    }
                    lb_endpoint
                }
            };

            let label = ep.locality.label();
            by_locality
                .entry(label.clone())
                .or_insert_with(|| LocalityEndpoints::new(convert_locality(&label)))
                .push(ep, lb_endpoint);
        }

        let mut labels: Vec<String> = by_locality.keys().cloned().collect();
        if labels.len() >= 2 {
            labels.sort();
        }

        let mut groups = Vec::with_capacity(labels.len());
        for label in labels {
            let Some(mut group) = by_locality.remove(&label) else {
                continue;
            };
            if group.refresh_weight() {
                tracing::warn!(
                    service = %self.hostname,
                    port = self.port,
                    locality = %label,
                    "locality weight sum overflowed, clamped",
                );
            }
            groups.push(group);
        }

        if groups.is_empty() {
            self.push
                .add_metric(ProxyStatus::ClusterNoInstances, &self.cluster_name);
        }

        let groups = network::apply_network_gateways(self, groups);

        if is_dns_srv_key(&self.cluster_name) {
            // These clusters front an auto-passthrough gateway, which cannot
            // tell mTLS traffic from anything else; only advertise endpoints
            // the tunneled TLS will terminate on.
            return network::retain_mtls_capable(groups);
        }

        groups
    }

    /// The endpoint filter. Predicates run in a fixed order; the first
    /// failure rejects the endpoint.
    fn keep_endpoint(&self, ep: &MeshEndpoint, svc_port: &ServicePort) -> bool {
        let Some(service) = self.service.as_deref() else {
            return false;
        };

        if service.attributes.node_local && ep.node_name != self.proxy.node_name {
            return false;
        }
        if !self.proxy_view.visible(&ep.network) {
            return false;
        }
        if self.cluster_local && self.cluster_id != ep.locality.cluster_id {
            return false;
        }
        if !ep.discoverable_from(self.proxy) {
            return false;
        }
        if svc_port.name != ep.service_port_name {
            return false;
        }
        if let Some(subset_labels) = &self.subset_labels {
            if !subset_labels.subset_of(&ep.labels) {
                return false;
            }
        }
        // An addressless endpoint is only usable if a gateway address will
        // replace it.
        if ep.address.is_empty() && ep.network == self.network {
            return false;
        }

        let draining = ep.health_status == HealthStatus::Draining
            || self
                .push
                .features
                .draining_label
                .as_deref()
                .is_some_and(|label| ep.labels.has(label));
        if draining
            && !service
                .attributes
                .labels
                .has(&self.push.features.persistent_session_label)
        {
            return false;
        }

        true
    }

    fn find_shards(&self, index: &EndpointIndex) -> Option<Arc<EndpointShards>> {
        let Some(service) = self.service.as_deref() else {
            tracing::debug!(cluster = %self.cluster_name, "no service for cluster");
            return None;
        };

        // Resolution may have flipped to DNS while the cluster is still in
        // the proxy's endpoint subscriptions; sending endpoints for it would
        // fight the DNS cluster the proxy is warming up.
        if self.is_dns_cluster() {
            tracing::info!(
                cluster = %self.cluster_name,
                resolution = ?service.resolution,
                "cluster subscribed for endpoint discovery but resolves by DNS, skipping",
            );
            return None;
        }

        match index.shards_for_service(&self.hostname, service.namespace()) {
            Some(shards) => Some(shards),
            None => {
                tracing::debug!(cluster = %self.cluster_name, "no endpoint shards for cluster");
                None
            }
        }
    }

    /// Copies the endpoint pointers out of the service's shards, in stable
    /// shard-key order, under the shard read lock. Nothing else runs under
    /// the lock.
    fn snapshot_shards(&self, index: &EndpointIndex) -> Vec<Arc<MeshEndpoint>> {
        let Some(shards) = self.find_shards(index) else {
            return Vec::new();
        };

        let node_local = self
            .service
            .as_deref()
            .is_some_and(|service| service.attributes.node_local);
        let local_only = self.cluster_local || node_local;

        shards.select(|key| key.cluster == self.cluster_id || !local_only)
    }

    fn cluster_load_assignment(&self, groups: &[LocalityEndpoints]) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: self.cluster_name.clone(),
            endpoints: groups
                .iter()
                .map(|group| group.llb_endpoints.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{Provider, ShardKey},
        config::{LocalityLbSetting, OutlierDetection, Subset, TrafficPolicy},
        test_utils::{endpoint, push_context, service, sidecar},
    };

    const CLUSTER: &str = "outbound|9080||reviews.default.svc.cluster.local";

    fn indexed(eps: Vec<MeshEndpoint>) -> EndpointIndex {
        let index = EndpointIndex::new();
        let shards = index.get_or_create("reviews.default.svc.cluster.local", "default");
        shards.insert(
            ShardKey::new("c1", Provider::Kubernetes),
            eps.into_iter().map(Arc::new).collect(),
        );
        index
    }

    #[test]
    fn locality_groups_are_sorted_and_aligned() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");

        let mut west = endpoint("10.0.0.2", 9080, "http");
        west.locality = Locality::new("us-west", "a", "1").cluster_id("c1");
        let mut east = endpoint("10.0.0.1", 9080, "http");
        east.locality = Locality::new("us-east", "a", "1").cluster_id("c1");
        let index = indexed(vec![west, east]);

        let builder = EndpointBuilder::new(CLUSTER, &proxy, &push);
        let assignment = builder.build_cluster_load_assignment(&index);

        let localities: Vec<String> = assignment
            .endpoints
            .iter()
            .map(|group| group.locality.clone().unwrap().region)
            .collect();
        assert_eq!(localities, vec!["us-east", "us-west"]);

        let eps = builder.generate(
            builder.snapshot_shards(&index),
            false,
        );
        for group in &eps {
            assert_eq!(
                group.mesh_endpoints.len(),
                group.llb_endpoints.lb_endpoints.len(),
            );
        }
    }

    #[test]
    fn group_weight_is_sum_of_members() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");

        let mut a = endpoint("10.0.0.1", 9080, "http");
        a.load_balancing_weight = 2;
        let mut b = endpoint("10.0.0.2", 9080, "http");
        b.load_balancing_weight = 3;
        let index = indexed(vec![a, b]);

        let assignment =
            EndpointBuilder::new(CLUSTER, &proxy, &push).build_cluster_load_assignment(&index);
        assert_eq!(assignment.endpoints[0].load_balancing_weight, Some(5));
    }

    #[test]
    fn weight_overflow_clamps() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");

        let mut a = endpoint("10.0.0.1", 9080, "http");
        a.load_balancing_weight = 0x9000_0000;
        let mut b = endpoint("10.0.0.2", 9080, "http");
        b.load_balancing_weight = 0x9000_0000;
        let index = indexed(vec![a, b]);

        let assignment =
            EndpointBuilder::new(CLUSTER, &proxy, &push).build_cluster_load_assignment(&index);
        assert_eq!(
            assignment.endpoints[0].load_balancing_weight,
            Some(u32::MAX),
        );
    }

    #[test]
    fn filter_is_idempotent() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");
        let builder = EndpointBuilder::new(CLUSTER, &proxy, &push);

        let eps = vec![
            Arc::new(endpoint("10.0.0.1", 9080, "http")),
            Arc::new(endpoint("10.0.0.2", 9080, "grpc")),
            Arc::new({
                let mut ep = endpoint("10.0.0.3", 9080, "http");
                ep.health_status = HealthStatus::Draining;
                ep
            }),
        ];

        let svc_port = builder.service_port(9080).unwrap();
        let once: Vec<_> = eps
            .iter()
            .filter(|ep| builder.keep_endpoint(ep, svc_port))
            .cloned()
            .collect();
        let twice: Vec<_> = once
            .iter()
            .filter(|ep| builder.keep_endpoint(ep, svc_port))
            .cloned()
            .collect();

        assert_eq!(once.len(), 1);
        assert_eq!(once.len(), twice.len());
        assert_eq!(once[0].address, twice[0].address);
    }

    #[test]
    fn unknown_service_builds_empty_assignment() {
        let push = push_context(Vec::new());
        let proxy = sidecar("n1", "c1");
        let index = EndpointIndex::new();

        let cluster = "outbound|9080||unknown.default.svc.cluster.local";
        let builder = EndpointBuilder::new(cluster, &proxy, &push);
        assert!(!builder.service_found());
        assert!(!builder.cacheable());

        let before = PushContext::metric_value(ProxyStatus::ClusterNoInstances, cluster);
        let assignment = builder.build_cluster_load_assignment(&index);
        assert_eq!(assignment.cluster_name, cluster);
        assert!(assignment.endpoints.is_empty());
        assert_eq!(
            PushContext::metric_value(ProxyStatus::ClusterNoInstances, cluster),
            before + 1,
        );
    }

    #[test]
    fn malformed_cluster_name_builds_empty_assignment() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("n1", "c1");
        let index = EndpointIndex::new();

        let assignment = EndpointBuilder::new("not-a-cluster-name", &proxy, &push)
            .build_cluster_load_assignment(&index);
        assert!(assignment.endpoints.is_empty());
    }

    #[test]
    fn missing_port_builds_empty_assignment() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");
        let index = indexed(vec![endpoint("10.0.0.1", 9080, "http")]);

        let assignment =
            EndpointBuilder::new("outbound|9999||reviews.default.svc.cluster.local", &proxy, &push)
                .build_cluster_load_assignment(&index);
        assert!(assignment.endpoints.is_empty());
    }

    #[test]
    fn dns_resolution_suppresses_endpoints() {
        let mut svc = service("reviews.default.svc.cluster.local", "default");
        svc.resolution = crate::mesh::Resolution::Dns;
        let push = push_context(vec![svc]);
        let proxy = sidecar("", "c1");
        let index = indexed(vec![endpoint("10.0.0.1", 9080, "http")]);

        let builder = EndpointBuilder::new(CLUSTER, &proxy, &push);
        assert!(builder.is_dns_cluster());

        let assignment = builder.build_cluster_load_assignment(&index);
        assert!(assignment.endpoints.is_empty());
    }

    #[test]
    fn inbound_vip_subset_prefixes_are_stripped() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");

        let builder = EndpointBuilder::for_cds(
            &proxy,
            &push,
            "inbound-vip|9080|http/v1|reviews.default.svc.cluster.local",
            TrafficDirection::InboundVip,
            "http/v1".into(),
            "reviews.default.svc.cluster.local".into(),
            9080,
            push.service_for_hostname("reviews.default.svc.cluster.local"),
            None,
        );
        assert_eq!(builder.subset_name, "v1");

        let outbound = EndpointBuilder::new(CLUSTER, &proxy, &push);
        assert_eq!(outbound.subset_name, "");
        assert_eq!(outbound.with_subset("v2").subset_name, "v2");
    }

    #[test]
    fn cache_key_is_pure_and_sensitive() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("n1", "c1");

        let key = EndpointBuilder::new(CLUSTER, &proxy, &push).cache_key();
        assert_eq!(key, EndpointBuilder::new(CLUSTER, &proxy, &push).cache_key());

        // Cluster name.
        assert_ne!(
            key,
            EndpointBuilder::new("outbound|9080|v1|reviews.default.svc.cluster.local", &proxy, &push)
                .cache_key(),
        );

        // Proxy network.
        let mut other = sidecar("n2", "c1");
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &other, &push).cache_key());

        // Proxy cluster.
        other = sidecar("n1", "c2");
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &other, &push).cache_key());

        // Node type.
        other = sidecar("n1", "c1");
        other.node_type = NodeType::Router;
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &other, &push).cache_key());

        // Proxy locality.
        other = sidecar("n1", "c1");
        other.locality = Locality::new("us-east", "a", "1");
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &other, &push).cache_key());

        // Proxy view.
        other = sidecar("n1", "c1");
        other.view = ProxyView::Limited(["n1".to_owned()].into());
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &other, &push).cache_key());

        // Authn policy version.
        let mut other_push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        other_push.authn_policies.version = "v2".into();
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &proxy, &other_push).cache_key());
    }

    #[test]
    fn cache_key_covers_destination_rules() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let mut proxy = sidecar("n1", "c1");

        let key = EndpointBuilder::new(CLUSTER, &proxy, &push).cache_key();

        let rule = ConsolidatedDestRule::from_rule(
            "reviews-rule",
            "default",
            DestinationRule {
                host: "reviews.default.svc.cluster.local".into(),
                ..DestinationRule::default()
            },
        );
        proxy.sidecar_scope = crate::mesh::SidecarScope::new(
            [(
                "reviews.default.svc.cluster.local".to_owned(),
                Arc::new(rule),
            )]
            .into(),
        );

        let with_rule = EndpointBuilder::new(CLUSTER, &proxy, &push);
        assert_ne!(key, with_rule.cache_key());
        assert_eq!(with_rule.dependent_configs().len(), 2);
    }

    #[test]
    fn precomputed_artifact_reused_for_eds_only() {
        let mut push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);
        let proxy = sidecar("", "c1");

        let ep = Arc::new(endpoint("10.0.0.1", 9080, "http"));
        let index = EndpointIndex::new();
        index
            .get_or_create("reviews.default.svc.cluster.local", "default")
            .insert(ShardKey::new("c1", Provider::Kubernetes), vec![Arc::clone(&ep)]);

        let cds_ep = Arc::new(endpoint("10.0.0.2", 9080, "http"));
        push.service_endpoints.insert(
            crate::cluster::ServiceKey::new("reviews.default.svc.cluster.local", "default"),
            vec![Arc::clone(&cds_ep)],
        );

        let builder = EndpointBuilder::new(CLUSTER, &proxy, &push);
        assert!(ep.precomputed().is_none());

        builder.build_cluster_load_assignment(&index);
        let precomputed = ep.precomputed().expect("endpoint discovery memoizes");

        builder.build_cluster_load_assignment(&index);
        let reused = ep.precomputed().unwrap();
        assert!(Arc::ptr_eq(&precomputed, &reused), "second build reuses");

        let groups = builder.from_service_endpoints();
        assert_eq!(groups.len(), 1);
        assert!(
            cds_ep.precomputed().is_none(),
            "cluster emission must not touch the artifact slot",
        );
    }

    #[test]
    fn failover_priority_labels_feed_the_cache_key() {
        let push = push_context(vec![service("reviews.default.svc.cluster.local", "default")]);

        let rule = DestinationRule {
            host: "reviews.default.svc.cluster.local".into(),
            traffic_policy: Some(TrafficPolicy {
                outlier_detection: Some(OutlierDetection::default()),
                load_balancer: Some(crate::config::LoadBalancerSettings {
                    locality_lb_setting: Some(LocalityLbSetting {
                        failover_priority: vec!["topology.kubernetes.io/network".into()],
                        ..LocalityLbSetting::default()
                    }),
                    ..crate::config::LoadBalancerSettings::default()
                }),
                ..TrafficPolicy::default()
            }),
            subsets: vec![Subset {
                name: "v1".into(),
                labels: Labels::from([("version", "v1")]),
                ..Subset::default()
            }],
        };

        let mut proxy = sidecar("n1", "c1");
        proxy.sidecar_scope = crate::mesh::SidecarScope::new(
            [(
                "reviews.default.svc.cluster.local".to_owned(),
                Arc::new(ConsolidatedDestRule::from_rule("reviews-rule", "default", rule)),
            )]
            .into(),
        );

        let key = EndpointBuilder::new(CLUSTER, &proxy, &push).cache_key();

        proxy.labels = Labels::from([("topology.kubernetes.io/network", "n1")]);
        assert_ne!(key, EndpointBuilder::new(CLUSTER, &proxy, &push).cache_key());
    }
}
