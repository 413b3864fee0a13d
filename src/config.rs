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

//! Traffic configuration applied during endpoint assembly: destination rules
//! with their subsets and traffic policies, and mesh-wide defaults.

pub mod destination_rule;
pub mod locality;

use serde::{Deserialize, Serialize};

pub use self::{
    destination_rule::{
        merge_traffic_policy, outlier_and_lb_settings, resolved_traffic_policy, subset_labels,
        ClientTlsMode, ClientTlsSettings, ConsolidatedDestRule, DestinationRule,
        LoadBalancerSettings, OutlierDetection, PortTrafficPolicy, Subset, TrafficPolicy,
    },
    locality::{LocalityDistribute, LocalityLbSetting, RegionFailover},
};

/// Mesh-wide configuration relevant to endpoint assembly.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct MeshConfig {
    /// The mesh-wide locality load balancing defaults, overridable per
    /// destination rule.
    #[serde(default)]
    pub locality_lb_setting: Option<LocalityLbSetting>,
}

impl MeshConfig {
    pub fn locality_lb_setting(&self) -> Option<&LocalityLbSetting> {
        self.locality_lb_setting.as_ref()
    }
}
