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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Explicit traffic distribution for clients in a source locality.
///
/// `from` and the keys of `to` are `region/zone/sub_zone` patterns; segments
/// may be `*`, and missing trailing segments match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LocalityDistribute {
    pub from: String,
    /// Destination locality pattern to percentage weight.
    pub to: BTreeMap<String, u32>,
}

/// A region-to-region failover preference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct RegionFailover {
    pub from: String,
    pub to: String,
}

/// Locality-aware load balancing behavior, merged from the mesh defaults and
/// a destination rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LocalityLbSetting {
    /// Explicit weight distribution. Mutually exclusive with failover
    /// settings; distribution wins when both are present.
    #[serde(default)]
    pub distribute: Vec<LocalityDistribute>,
    /// Region failover preferences applied when prioritizing localities.
    #[serde(default)]
    pub failover: Vec<RegionFailover>,
    /// An ordered list of workload label keys; endpoints sharing a longer
    /// prefix of these labels with the client get a better priority.
    #[serde(default)]
    pub failover_priority: Vec<String>,
    /// Explicitly enables or disables locality load balancing. Unset means
    /// enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl LocalityLbSetting {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize() {
        let setting: LocalityLbSetting = serde_yaml::from_str(
            "
distribute:
  - from: us-east/a/*
    to:
      us-east/a/*: 80
      us-east/b/*: 20
failover_priority:
  - topology.kubernetes.io/network
",
        )
        .unwrap();

        assert!(setting.enabled());
        assert_eq!(setting.distribute.len(), 1);
        assert_eq!(setting.failover_priority.len(), 1);
    }
}
