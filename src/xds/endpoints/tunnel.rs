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

//! Per-endpoint transport selection: direct connection, or an HTTP CONNECT
//! tunnel through the origination listener, possibly via a waypoint.

use std::collections::BTreeMap;

use super::EndpointBuilder;
use crate::{
    generated::envoy::config::{
        core::v3 as core,
        endpoint::v3::{lb_endpoint::HostIdentifier, Endpoint, LbEndpoint},
    },
    mesh::{
        endpoint::{EndpointMetadata, TLS_MODE_MUTUAL},
        HealthStatus, MeshEndpoint, TrafficDirection, WaypointScope,
    },
    push::PushContext,
};

/// The internal listener that originates HTTP CONNECT tunnels.
pub(crate) const CONNECT_ORIGINATE: &str = "connect_originate";

/// The well-known port tunnel-capable workloads accept CONNECT on.
pub(crate) const HBONE_INBOUND_PORT: u16 = 15008;

/// Filter metadata key carrying the tunnel target.
pub(crate) const TUNNEL_METADATA_KEY: &str = "tunnel";

/// Filter metadata key driving Envoy's transport socket match.
pub(crate) const TRANSPORT_SOCKET_METADATA_KEY: &str = "envoy.transport_socket_match";

pub(crate) const TLS_MODE_KEY: &str = "tlsMode";

const TUNNEL_HTTP: &str = "http";

const MESH_METADATA_KEY: &str = "istio";

/// Label marking gateways managed by the mesh controller, i.e. waypoints.
const MANAGED_GATEWAY_LABEL: &str = "gateway.istio.io/managed";
const MANAGED_GATEWAY_MESH_CONTROLLER: &str = "istio.io-mesh-controller";

const CANONICAL_SERVICE_LABEL: &str = "service.istio.io/canonical-name";
const CANONICAL_REVISION_LABEL: &str = "service.istio.io/canonical-revision";

/// How traffic should reach one endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transport {
    /// Connect straight to the endpoint address.
    Direct,
    /// The endpoint is not owned by the requesting waypoint; it must not be
    /// advertised at all.
    OutOfScope,
    /// Waypoint inbound: tunnel to the endpoint itself on the well-known
    /// inbound port.
    InboundVip,
    /// Tunnel through `address` (the endpoint itself, or its waypoint).
    Tunnel { address: String },
}

pub(crate) fn select_transport(builder: &EndpointBuilder, ep: &MeshEndpoint) -> Transport {
    let supports_tunnel = supports_tunnel(builder, ep);

    if builder.dir == TrafficDirection::InboundVip {
        // A waypoint can partially select a service. Requests have already
        // been balanced across the waypoint set, so only advertise workloads
        // behind this one.
        if !waypoint_in_scope(builder, ep) {
            return Transport::OutOfScope;
        }
        if supports_tunnel {
            return Transport::InboundVip;
        }
        return Transport::Direct;
    }

    if !supports_tunnel {
        return Transport::Direct;
    }

    let mut tunnel_address = ep.address.clone();
    if builder.dir == TrafficDirection::Outbound
        && !builder.proxy.is_waypoint_proxy()
        && !builder.proxy.is_ambient()
    {
        // Sidecars and ingress connect via the destination's waypoint when it
        // has one.
        if let Some(waypoint) = find_waypoints(builder.push, ep).first() {
            tunnel_address = waypoint.to_string();
        }
    }

    Transport::Tunnel {
        address: tunnel_address,
    }
}

/// Builds the LbEndpoint for one surviving endpoint, or `None` when the
/// endpoint must be dropped entirely.
pub(crate) fn build_lb_endpoint(
    builder: &EndpointBuilder,
    ep: &MeshEndpoint,
    mtls_enabled: bool,
) -> Option<LbEndpoint> {
    let mut health_status = ep.health_status;
    if builder
        .push
        .features
        .draining_label
        .as_deref()
        .is_some_and(|label| ep.labels.has(label))
    {
        health_status = HealthStatus::Draining;
    }

    let mut meta = endpoint_metadata(builder, ep);
    if !mtls_enabled {
        meta.tls_mode = String::new();
    }
    let mut metadata = core::Metadata::default();
    append_lb_endpoint_metadata(&meta, &mut metadata);

    let mut lb_endpoint = LbEndpoint {
        health_status: health_status.as_envoy(),
        load_balancing_weight: Some(ep.weight()),
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(&ep.address, ep.endpoint_port)),
            hostname: String::new(),
        })),
        metadata: None,
    };

    match select_transport(builder, ep) {
        Transport::OutOfScope => return None,
        Transport::Direct => {
            lb_endpoint.metadata = Some(metadata);
        }
        Transport::InboundVip => {
            // Tell the origination listener to tunnel to ip:15008, recording
            // the original port for detunneling.
            metadata.filter_metadata.insert(
                TUNNEL_METADATA_KEY.into(),
                tunnel_metadata(&ep.address, &ep.address, ep.endpoint_port, HBONE_INBOUND_PORT),
            );
            lb_endpoint = LbEndpoint {
                host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                    address: Some(internal_address(CONNECT_ORIGINATE, String::new())),
                    hostname: String::new(),
                })),
                metadata: Some(metadata),
                load_balancing_weight: Some(ep.weight()),
                ..<_>::default()
            };
        }
        Transport::Tunnel { address } => {
            lb_endpoint.host_identifier = Some(HostIdentifier::Endpoint(Endpoint {
                address: Some(internal_address(
                    CONNECT_ORIGINATE,
                    format!("{}:{}", ep.address, ep.endpoint_port),
                )),
                hostname: String::new(),
            }));
            metadata.filter_metadata.insert(
                TUNNEL_METADATA_KEY.into(),
                tunnel_metadata(&address, &ep.address, ep.endpoint_port, HBONE_INBOUND_PORT),
            );
            metadata.filter_metadata.insert(
                TRANSPORT_SOCKET_METADATA_KEY.into(),
                prost_types::Struct {
                    fields: BTreeMap::from([(TUNNEL_METADATA_KEY.into(), string_value(TUNNEL_HTTP))]),
                },
            );
            lb_endpoint.metadata = Some(metadata);
        }
    }

    Some(lb_endpoint)
}

/// Whether the endpoint can be reached over an HTTP CONNECT tunnel by this
/// proxy: it is a waypoint itself, its address is known tunnel-capable, or it
/// advertises tunnel support. Clients that cannot originate tunnels always
/// connect directly.
fn supports_tunnel(builder: &EndpointBuilder, ep: &MeshEndpoint) -> bool {
    if builder.proxy.is_proxyless_grpc() || !builder.proxy.enable_hbone() {
        return false;
    }

    ep.labels.get(MANAGED_GATEWAY_LABEL) == Some(MANAGED_GATEWAY_MESH_CONTROLLER)
        || builder.push.supports_tunnel(&ep.network, &ep.address)
        || ep.tunnel.supports_http()
}

/// Whether the endpoint is owned by the requesting waypoint's scope.
fn waypoint_in_scope(builder: &EndpointBuilder, ep: &MeshEndpoint) -> bool {
    let scope = builder.proxy.waypoint_scope();
    if scope.namespace != ep.namespace {
        return false;
    }

    match scope.service_account.as_deref() {
        Some(account) if !account.is_empty() => account == ep.service_account_name(),
        _ => true,
    }
}

fn find_waypoints(push: &PushContext, ep: &MeshEndpoint) -> Vec<std::net::IpAddr> {
    let account = ep.service_account_name();
    let scope = WaypointScope {
        namespace: ep.namespace.clone(),
        service_account: (!account.is_empty()).then(|| account.to_owned()),
    };
    push.waypoints_for(&scope).to_vec()
}

/// Endpoint metadata, with canonical-service labels injected from the
/// service for mesh-external service entries.
fn endpoint_metadata(builder: &EndpointBuilder, ep: &MeshEndpoint) -> EndpointMetadata {
    let mut meta = ep.metadata();
    let Some(service) = builder.service.as_deref() else {
        return meta;
    };

    if builder.push.features.canonical_services_for_mesh_external && service.mesh_external {
        let svc_labels = &service.attributes.labels;
        if let Some(canonical) = svc_labels.get(CANONICAL_SERVICE_LABEL) {
            meta.labels
                .insert(CANONICAL_SERVICE_LABEL.into(), canonical.into());
            if let Some(revision) = svc_labels.get(CANONICAL_REVISION_LABEL) {
                meta.labels
                    .insert(CANONICAL_REVISION_LABEL.into(), revision.into());
            }
        }
        meta.namespace = service.namespace().to_owned();
    }

    meta
}

/// Renders endpoint metadata onto the LbEndpoint. Telemetry and endpoint
/// TLS transport selection both read these entries.
fn append_lb_endpoint_metadata(meta: &EndpointMetadata, target: &mut core::Metadata) {
    if !meta.tls_mode.is_empty() {
        target.filter_metadata.insert(
            TRANSPORT_SOCKET_METADATA_KEY.into(),
            tls_mode_metadata(&meta.tls_mode),
        );
    }

    let mut fields = BTreeMap::new();
    if !meta.workload_name.is_empty() {
        fields.insert("workload".to_owned(), string_value(&meta.workload_name));
    }
    if !meta.namespace.is_empty() {
        fields.insert("namespace".to_owned(), string_value(&meta.namespace));
    }
    if let Some(canonical) = meta.labels.get(CANONICAL_SERVICE_LABEL) {
        fields.insert("canonical_name".to_owned(), string_value(canonical));
    }
    if let Some(revision) = meta.labels.get(CANONICAL_REVISION_LABEL) {
        fields.insert("canonical_revision".to_owned(), string_value(revision));
    }
    if !fields.is_empty() {
        target
            .filter_metadata
            .insert(MESH_METADATA_KEY.into(), prost_types::Struct { fields });
    }
}

pub(crate) fn tls_mode_metadata(tls_mode: &str) -> prost_types::Struct {
    prost_types::Struct {
        fields: BTreeMap::from([(TLS_MODE_KEY.into(), string_value(tls_mode))]),
    }
}

pub(crate) fn socket_address(address: &str, port: u16) -> core::Address {
    core::Address {
        address: Some(core::address::Address::SocketAddress(core::SocketAddress {
            protocol: core::socket_address::Protocol::Tcp as i32,
            address: address.into(),
            port_specifier: Some(core::socket_address::PortSpecifier::PortValue(port.into())),
            ..<_>::default()
        })),
    }
}

fn internal_address(server_listener_name: &str, endpoint_id: String) -> core::Address {
    core::Address {
        address: Some(core::address::Address::EnvoyInternalAddress(
            core::EnvoyInternalAddress {
                endpoint_id,
                address_name_specifier: Some(
                    core::envoy_internal_address::AddressNameSpecifier::ServerListenerName(
                        server_listener_name.into(),
                    ),
                ),
            },
        )),
    }
}

/// The filter metadata the origination listener reads to set up one tunnel.
fn tunnel_metadata(
    address: &str,
    destination: &str,
    destination_port: u16,
    tunnel_port: u16,
) -> prost_types::Struct {
    prost_types::Struct {
        fields: BTreeMap::from([
            ("address".to_owned(), string_value(address)),
            ("destination".to_owned(), string_value(destination)),
            (
                "destinationPort".to_owned(),
                number_value(destination_port.into()),
            ),
            ("tunnelPort".to_owned(), number_value(tunnel_port.into())),
        ]),
    }
}

fn string_value(value: &str) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::StringValue(value.into())),
    }
}

fn number_value(value: f64) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::NumberValue(value)),
    }
}

/// Whether a built LbEndpoint carries the mesh mutual-TLS marker.
pub(crate) fn lb_endpoint_is_mtls(lb_endpoint: &LbEndpoint) -> bool {
    lb_endpoint
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.filter_metadata.get(TRANSPORT_SOCKET_METADATA_KEY))
        .and_then(|entry| entry.fields.get(TLS_MODE_KEY))
        .and_then(|value| match &value.kind {
            Some(prost_types::value::Kind::StringValue(mode)) => Some(mode.as_str()),
            _ => None,
        })
        == Some(TLS_MODE_MUTUAL)
}
