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

//! The concurrent endpoint store: per-service shards written by registry
//! adapters and snapshotted by endpoint builders.

pub mod key;

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::mesh::MeshEndpoint;

pub use self::key::{is_dns_srv_key, ClusterKey};

const SUBSYSTEM: &str = "cluster";

pub(crate) fn active_services() -> &'static prometheus::IntGauge {
    static ACTIVE_SERVICES: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntGauge::with_opts(crate::metrics::opts(
                "active_services",
                SUBSYSTEM,
                "Number of services with endpoint shards.",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_SERVICES
}

pub(crate) fn active_endpoints() -> &'static prometheus::IntGauge {
    static ACTIVE_ENDPOINTS: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntGauge::with_opts(crate::metrics::opts(
                "active_endpoints",
                SUBSYSTEM,
                "Number of currently indexed endpoints.",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_ENDPOINTS
}

/// The registry that discovered a shard of endpoints.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
pub enum Provider {
    #[default]
    Kubernetes,
    External,
}

/// Identifies one shard of a service's endpoints: the source cluster and the
/// registry that discovered it. Ordered so shard iteration is stable between
/// builds.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
pub struct ShardKey {
    pub cluster: String,
    pub provider: Provider,
}

impl ShardKey {
    pub fn new(cluster: impl Into<String>, provider: Provider) -> Self {
        Self {
            cluster: cluster.into(),
            provider,
        }
    }
}

/// Identifies a service by `(hostname, namespace)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ServiceKey {
    pub hostname: String,
    pub namespace: String,
}

impl ServiceKey {
    pub fn new(hostname: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            namespace: namespace.into(),
        }
    }
}

/// One service's endpoints, sharded by source cluster and provider.
///
/// Registry adapters replace whole shards under the write lock; builders
/// copy the endpoint pointers out under the read lock and never run
/// downstream work while holding it.
#[derive(Debug, Default)]
pub struct EndpointShards {
    shards: RwLock<BTreeMap<ShardKey, Vec<Arc<MeshEndpoint>>>>,
}

impl EndpointShards {
    /// Installs or replaces one shard, returning the previous contents.
    pub fn insert(
        &self,
        key: ShardKey,
        endpoints: Vec<Arc<MeshEndpoint>>,
    ) -> Option<Vec<Arc<MeshEndpoint>>> {
        let new_len = endpoints.len() as i64;
        let old = self.shards.write().insert(key, endpoints);
        let old_len = old.as_ref().map_or(0, Vec::len) as i64;
        active_endpoints().add(new_len - old_len);
        old
    }

    /// Deletes one shard, returning its contents.
    pub fn remove(&self, key: &ShardKey) -> Option<Vec<Arc<MeshEndpoint>>> {
        let old = self.shards.write().remove(key);
        if let Some(old) = &old {
            active_endpoints().sub(old.len() as i64);
        }
        old
    }

    /// A snapshot of the shard keys, in their stable iteration order.
    pub fn keys(&self) -> Vec<ShardKey> {
        self.shards.read().keys().cloned().collect()
    }

    /// Copies the endpoint pointers of every shard accepted by `keep`, in
    /// stable key order. The read lock is released before returning.
    pub fn select(&self, mut keep: impl FnMut(&ShardKey) -> bool) -> Vec<Arc<MeshEndpoint>> {
        let shards = self.shards.read();
        let mut endpoints = Vec::new();
        for (key, shard) in shards.iter() {
            if keep(key) {
                endpoints.extend(shard.iter().cloned());
            }
        }
        endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    pub fn num_endpoints(&self) -> usize {
        self.shards.read().values().map(Vec::len).sum()
    }
}

/// Maps every service to its endpoint shards. Created once at process start,
/// mutated by registry adapters, read by endpoint builders.
#[derive(Debug, Default)]
pub struct EndpointIndex {
    index: DashMap<ServiceKey, Arc<EndpointShards>>,
}

impl EndpointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shards for `(hostname, namespace)`, if the service is known. The
    /// returned handle shares the live shard table, not a copy.
    pub fn shards_for_service(
        &self,
        hostname: &str,
        namespace: &str,
    ) -> Option<Arc<EndpointShards>> {
        self.index
            .get(&ServiceKey::new(hostname, namespace))
            .map(|shards| Arc::clone(&shards))
    }

    /// The shards for `(hostname, namespace)`, creating an empty table if the
    /// service is new.
    pub fn get_or_create(&self, hostname: &str, namespace: &str) -> Arc<EndpointShards> {
        let shards = self
            .index
            .entry(ServiceKey::new(hostname, namespace))
            .or_insert_with(|| {
                active_services().inc();
                <_>::default()
            });
        Arc::clone(&shards)
    }

    /// Drops a service and all its shards.
    pub fn delete_service(&self, hostname: &str, namespace: &str) {
        if let Some((_, shards)) = self.index.remove(&ServiceKey::new(hostname, namespace)) {
            active_services().dec();
            active_endpoints().sub(shards.num_endpoints() as i64);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::endpoint;

    #[test]
    fn shard_keys_are_ordered() {
        let shards = EndpointShards::default();
        shards.insert(
            ShardKey::new("c2", Provider::Kubernetes),
            vec![Arc::new(endpoint("10.0.0.2", 9080, "http"))],
        );
        shards.insert(
            ShardKey::new("c1", Provider::External),
            vec![Arc::new(endpoint("10.0.0.1", 9080, "http"))],
        );
        shards.insert(
            ShardKey::new("c1", Provider::Kubernetes),
            vec![Arc::new(endpoint("10.0.0.3", 9080, "http"))],
        );

        let keys = shards.keys();
        assert_eq!(
            keys,
            vec![
                ShardKey::new("c1", Provider::Kubernetes),
                ShardKey::new("c1", Provider::External),
                ShardKey::new("c2", Provider::Kubernetes),
            ],
        );

        // Same order every time.
        assert_eq!(keys, shards.keys());
    }

    #[test]
    fn replace_shard() {
        let shards = EndpointShards::default();
        let key = ShardKey::new("c1", Provider::Kubernetes);

        assert!(shards
            .insert(key.clone(), vec![Arc::new(endpoint("10.0.0.1", 9080, "http"))])
            .is_none());

        let old = shards
            .insert(key.clone(), vec![Arc::new(endpoint("10.0.0.2", 9080, "http"))])
            .unwrap();
        assert_eq!(old[0].address, "10.0.0.1");

        let removed = shards.remove(&key).unwrap();
        assert_eq!(removed[0].address, "10.0.0.2");
        assert!(shards.is_empty());
    }

    #[test]
    fn select_filters_by_shard_key() {
        let shards = EndpointShards::default();
        shards.insert(
            ShardKey::new("c1", Provider::Kubernetes),
            vec![Arc::new(endpoint("10.0.0.1", 9080, "http"))],
        );
        shards.insert(
            ShardKey::new("c2", Provider::Kubernetes),
            vec![Arc::new(endpoint("10.0.0.2", 9080, "http"))],
        );

        let local = shards.select(|key| key.cluster == "c1");
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].address, "10.0.0.1");

        assert_eq!(shards.select(|_| true).len(), 2);
    }

    #[test]
    fn index_lookup() {
        let index = EndpointIndex::new();
        assert!(index
            .shards_for_service("reviews.default.svc.cluster.local", "default")
            .is_none());

        let shards = index.get_or_create("reviews.default.svc.cluster.local", "default");
        shards.insert(
            ShardKey::new("c1", Provider::Kubernetes),
            vec![Arc::new(endpoint("10.0.0.1", 9080, "http"))],
        );

        let found = index
            .shards_for_service("reviews.default.svc.cluster.local", "default")
            .unwrap();
        assert_eq!(found.num_endpoints(), 1);

        index.delete_service("reviews.default.svc.cluster.local", "default");
        assert!(index
            .shards_for_service("reviews.default.svc.cluster.local", "default")
            .is_none());
    }
}
