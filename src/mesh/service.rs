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

use serde::{Deserialize, Serialize};

use super::Labels;

/// How a service's endpoints are resolved by connecting proxies.
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
pub enum Resolution {
    /// Endpoints are statically known and delivered over EDS.
    #[default]
    Static,
    /// The hostname is resolved by DNS, one address at a time.
    Dns,
    /// The hostname is resolved by DNS, rotating through all addresses.
    DnsRoundRobin,
    /// Traffic is passed through to the requested address.
    Passthrough,
}

impl Resolution {
    /// Whether endpoint discovery is delegated to DNS, suppressing EDS.
    pub fn is_dns(self) -> bool {
        matches!(self, Self::Dns | Self::DnsRoundRobin)
    }
}

/// A named port exposed by a [`Service`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub app_protocol: Option<String>,
}

/// The ordered port list of a [`Service`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct ServicePorts(pub Vec<ServicePort>);

impl ServicePorts {
    pub fn get_by_port(&self, port: u16) -> Option<&ServicePort> {
        self.0.iter().find(|svc_port| svc_port.port == port)
    }
}

impl std::ops::Deref for ServicePorts {
    type Target = Vec<ServicePort>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<ServicePort>> for ServicePorts {
    fn from(ports: Vec<ServicePort>) -> Self {
        Self(ports)
    }
}

/// Properties of a service beyond its hostname and ports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ServiceAttributes {
    pub namespace: String,
    /// Service-level labels, e.g. canonical-service and persistent-session
    /// markers.
    #[serde(default)]
    pub labels: Labels,
    /// Restricts the service's endpoints to the node its client runs on.
    #[serde(default)]
    pub node_local: bool,
    /// Restricts the service's endpoints to the client's own cluster.
    #[serde(default)]
    pub cluster_local: bool,
}

/// A service as seen by the control plane: a hostname with ports, resolution
/// behavior, and attributes. Immutable for the duration of a push.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct Service {
    pub hostname: String,
    #[serde(default)]
    pub ports: ServicePorts,
    #[serde(default)]
    pub resolution: Resolution,
    /// Whether the service lives outside the mesh (a service entry for an
    /// external host).
    #[serde(default)]
    pub mesh_external: bool,
    #[serde(default)]
    pub attributes: ServiceAttributes,
}

impl Service {
    pub fn namespace(&self) -> &str {
        &self.attributes.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_lookup_is_by_number() {
        let service = Service {
            hostname: "reviews.default.svc.cluster.local".into(),
            ports: vec![
                ServicePort {
                    name: "http".into(),
                    port: 9080,
                    app_protocol: None,
                },
                ServicePort {
                    name: "grpc".into(),
                    port: 9081,
                    app_protocol: Some("grpc".into()),
                },
            ]
            .into(),
            ..Service::default()
        };

        assert_eq!(service.ports.get_by_port(9081).unwrap().name, "grpc");
        assert!(service.ports.get_by_port(9082).is_none());
    }

    #[test]
    fn deserialize() {
        let service: Service = serde_yaml::from_str(
            "
hostname: reviews.default.svc.cluster.local
ports:
  - name: http
    port: 9080
resolution: Dns
attributes:
  namespace: default
  cluster_local: true
",
        )
        .unwrap();

        assert_eq!(service.hostname, "reviews.default.svc.cluster.local");
        assert!(service.resolution.is_dns());
        assert!(service.attributes.cluster_local);
    }
}
