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

//! Split-horizon endpoint rewriting: endpoints on foreign networks are
//! replaced by that network's gateway addresses.

use std::{collections::BTreeMap, sync::Arc};

use super::{tunnel, EndpointBuilder, LocalityEndpoints};
use crate::{
    generated::envoy::config::{
        core::v3 as core,
        endpoint::v3::{lb_endpoint::HostIdentifier, Endpoint, LbEndpoint},
    },
    mesh::{endpoint::TLS_MODE_MUTUAL, HealthStatus, MeshEndpoint},
    push::NetworkGateway,
};

/// Replaces endpoints on networks other than the proxy's with per-network
/// gateway addresses.
///
/// All cross-network endpoints behind one network collapse into one
/// synthesized endpoint per gateway; the network's weight total is divided
/// evenly across its gateways, rounding up. Endpoints on unreachable
/// networks (no gateway) are dropped.
pub(crate) fn apply_network_gateways(
    builder: &EndpointBuilder,
    groups: Vec<LocalityEndpoints>,
) -> Vec<LocalityEndpoints> {
    let local = |network: &str| network == builder.network;
    if groups
        .iter()
        .all(|group| group.mesh_endpoints.iter().all(|ep| local(&ep.network)))
    {
        return groups;
    }

    let gateways = builder.gateways();
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let mut kept = LocalityEndpoints::new(group.llb_endpoints.locality.clone());
        kept.llb_endpoints.priority = group.llb_endpoints.priority;

        let mut cross: BTreeMap<String, u32> = BTreeMap::new();
        for (ep, lb_endpoint) in group
            .mesh_endpoints
            .iter()
            .zip(group.llb_endpoints.lb_endpoints.iter())
        {
            if local(&ep.network) {
                kept.push(Arc::clone(ep), lb_endpoint.clone());
            } else {
                let weight = lb_endpoint.load_balancing_weight.unwrap_or(1);
                let total = cross.entry(ep.network.clone()).or_insert(0);
                *total = total.saturating_add(weight);
            }
        }

        for (network, total_weight) in cross {
            let network_gateways = gateways.for_network(&network);
            if network_gateways.is_empty() {
                tracing::debug!(
                    cluster = %builder.cluster_name,
                    %network,
                    "no gateway for network, dropping its endpoints",
                );
                continue;
            }

            let share = total_weight.div_ceil(network_gateways.len() as u32);
            for gateway in network_gateways {
                let (ep, lb_endpoint) = gateway_endpoint(gateway, share);
                kept.push(Arc::new(ep), lb_endpoint);
            }
        }

        if kept.llb_endpoints.lb_endpoints.is_empty() {
            continue;
        }
        if kept.refresh_weight() {
            tracing::warn!(
                service = %builder.hostname,
                port = builder.port,
                "locality weight sum overflowed after gateway rewrite, clamped",
            );
        }
        out.push(kept);
    }

    out
}

/// A synthesized endpoint standing in for everything behind one gateway.
/// Cross-network traffic always rides mutual TLS through the gateway.
fn gateway_endpoint(gateway: &NetworkGateway, weight: u32) -> (MeshEndpoint, LbEndpoint) {
    let ep = MeshEndpoint {
        address: gateway.address.clone(),
        endpoint_port: gateway.port,
        network: gateway.network.clone(),
        load_balancing_weight: weight,
        tls_mode: TLS_MODE_MUTUAL.into(),
        ..MeshEndpoint::default()
    };

    let lb_endpoint = LbEndpoint {
        health_status: HealthStatus::Healthy.as_envoy(),
        load_balancing_weight: Some(weight),
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(tunnel::socket_address(&gateway.address, gateway.port)),
            hostname: String::new(),
        })),
        metadata: Some(core::Metadata {
            filter_metadata: [(
                tunnel::TRANSPORT_SOCKET_METADATA_KEY.to_owned(),
                tunnel::tls_mode_metadata(TLS_MODE_MUTUAL),
            )]
            .into(),
        }),
    };

    (ep, lb_endpoint)
}

/// Drops every endpoint that cannot do mutual TLS. Applied to DNS-SRV subset
/// clusters, whose gateway passes tunneled TLS through without inspecting
/// it.
pub(crate) fn retain_mtls_capable(groups: Vec<LocalityEndpoints>) -> Vec<LocalityEndpoints> {
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let mut kept = LocalityEndpoints::new(group.llb_endpoints.locality.clone());
        kept.llb_endpoints.priority = group.llb_endpoints.priority;

        for (ep, lb_endpoint) in group
            .mesh_endpoints
            .iter()
            .zip(group.llb_endpoints.lb_endpoints.iter())
        {
            if tunnel::lb_endpoint_is_mtls(lb_endpoint) {
                kept.push(Arc::clone(ep), lb_endpoint.clone());
            }
        }

        if !kept.llb_endpoints.lb_endpoints.is_empty() {
            kept.refresh_weight();
            out.push(kept);
        }
    }
    out
}
