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

//! Fixtures shared by unit and integration tests.

use std::sync::Arc;

use crate::{
    mesh::{MeshEndpoint, Proxy, Service, ServicePort},
    push::PushContext,
};

/// A healthy endpoint with the given address serving the named port.
/// Network, locality, and labels are left unset.
pub fn endpoint(address: &str, port: u16, service_port: &str) -> MeshEndpoint {
    MeshEndpoint {
        address: address.into(),
        endpoint_port: port,
        service_port_name: service_port.into(),
        ..MeshEndpoint::default()
    }
}

/// A statically resolved service in `namespace` with one port,
/// `http` on 9080.
pub fn service(hostname: &str, namespace: &str) -> Service {
    let mut service = Service {
        hostname: hostname.into(),
        ports: vec![ServicePort {
            name: "http".into(),
            port: 9080,
            app_protocol: None,
        }]
        .into(),
        ..Service::default()
    };
    service.attributes.namespace = namespace.into();
    service
}

/// A sidecar proxy on the given network and cluster.
pub fn sidecar(network: &str, cluster_id: &str) -> Proxy {
    Proxy {
        network: network.into(),
        cluster_id: cluster_id.into(),
        ..Proxy::default()
    }
}

/// A push context indexing the given services by hostname.
pub fn push_context(services: Vec<Service>) -> PushContext {
    PushContext {
        services: services
            .into_iter()
            .map(|service| (service.hostname.clone(), Arc::new(service)))
            .collect(),
        ..PushContext::default()
    }
}
