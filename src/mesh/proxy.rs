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

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use super::{Labels, Locality};
use crate::config::ConsolidatedDestRule;

/// The role of a connected proxy.
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
pub enum NodeType {
    #[default]
    Sidecar,
    Router,
    /// An ambient-mesh proxy terminating tunnels for a namespace/account
    /// scope.
    Waypoint,
    Ztunnel,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sidecar => "sidecar",
            Self::Router => "router",
            Self::Waypoint => "waypoint",
            Self::Ztunnel => "ztunnel",
        })
    }
}

/// The direction of traffic a cluster carries, as encoded in its name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum TrafficDirection {
    #[default]
    Outbound,
    Inbound,
    /// Inbound via a service VIP; only used by waypoint proxies.
    InboundVip,
}

impl TrafficDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
            Self::InboundVip => "inbound-vip",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "outbound" => Some(Self::Outbound),
            "inbound" => Some(Self::Inbound),
            "inbound-vip" => Some(Self::InboundVip),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of networks whose endpoints a proxy wants to see. The default
/// view sees every network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ProxyView {
    #[default]
    All,
    Limited(BTreeSet<String>),
}

impl ProxyView {
    pub fn visible(&self, network: &str) -> bool {
        match self {
            Self::All => true,
            Self::Limited(networks) => networks.contains(network),
        }
    }
}

impl std::fmt::Display for ProxyView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => Ok(()),
            Self::Limited(networks) => {
                f.write_str("visible:")?;
                let mut first = true;
                for network in networks {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    f.write_str(network)?;
                }
                Ok(())
            }
        }
    }
}

/// The workloads a waypoint proxy is authoritative for: a namespace, and
/// optionally a single service account within it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct WaypointScope {
    pub namespace: String,
    #[serde(default)]
    pub service_account: Option<String>,
}

/// The slice of configuration visible to one proxy, pre-resolved per push.
/// Only outbound destination rules are kept; inbound traffic is governed by
/// server-side policy.
#[derive(Clone, Debug, Default)]
pub struct SidecarScope {
    destination_rules: HashMap<String, Arc<ConsolidatedDestRule>>,
}

impl SidecarScope {
    pub fn new(destination_rules: HashMap<String, Arc<ConsolidatedDestRule>>) -> Self {
        Self { destination_rules }
    }

    pub fn destination_rule(
        &self,
        direction: TrafficDirection,
        hostname: &str,
    ) -> Option<Arc<ConsolidatedDestRule>> {
        if direction != TrafficDirection::Outbound {
            return None;
        }

        self.destination_rules.get(hostname).cloned()
    }
}

/// A connected proxy requesting cluster load assignments.
#[derive(Clone, Debug, Default)]
pub struct Proxy {
    pub node_type: NodeType,
    pub network: String,
    pub cluster_id: String,
    pub node_name: String,
    pub labels: Labels,
    pub locality: Locality,
    pub view: ProxyView,
    /// Proxyless gRPC clients cannot originate tunnels even when the server
    /// side can terminate them.
    pub proxyless_grpc: bool,
    pub hbone: bool,
    pub ambient: bool,
    pub waypoint_scope: WaypointScope,
    pub sidecar_scope: SidecarScope,
}

impl Proxy {
    pub fn is_proxyless_grpc(&self) -> bool {
        self.proxyless_grpc
    }

    pub fn enable_hbone(&self) -> bool {
        self.hbone
    }

    pub fn is_waypoint_proxy(&self) -> bool {
        self.node_type == NodeType::Waypoint
    }

    pub fn is_ambient(&self) -> bool {
        self.ambient
    }

    pub fn waypoint_scope(&self) -> &WaypointScope {
        &self.waypoint_scope
    }

    pub fn view(&self) -> &ProxyView {
        &self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_visibility() {
        assert!(ProxyView::All.visible("n1"));

        let limited = ProxyView::Limited(["n1".to_owned()].into());
        assert!(limited.visible("n1"));
        assert!(!limited.visible("n2"));
    }

    #[test]
    fn view_display() {
        assert_eq!(ProxyView::All.to_string(), "");
        assert_eq!(
            ProxyView::Limited(["n2".to_owned(), "n1".to_owned()].into()).to_string(),
            "visible:n1,n2",
        );
    }

    #[test]
    fn direction_round_trip() {
        for direction in [
            TrafficDirection::Outbound,
            TrafficDirection::Inbound,
            TrafficDirection::InboundVip,
        ] {
            assert_eq!(TrafficDirection::parse(direction.as_str()), Some(direction));
        }
        assert_eq!(TrafficDirection::parse("sideways"), None);
    }
}
