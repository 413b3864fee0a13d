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

//! Endpoint assembly for a service-mesh control plane.
//!
//! Transforms a snapshot of the mesh's service, endpoint, and policy state
//! into per-proxy cluster load assignments: reachable backends grouped by
//! locality, weighted, filtered for visibility, and annotated with transport
//! metadata.

pub mod cluster;
pub mod config;
pub mod generated;
pub mod mesh;
pub mod metrics;
pub mod push;
pub mod xds;

#[doc(hidden)]
pub mod test_utils;

pub type Result<T, E = eyre::Error> = std::result::Result<T, E>;

#[doc(inline)]
pub use self::{
    cluster::{EndpointIndex, EndpointShards, Provider, ShardKey},
    mesh::{MeshEndpoint, Proxy, Service},
    push::PushContext,
    xds::endpoints::EndpointBuilder,
};
