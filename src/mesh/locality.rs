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

/// The location of a workload or proxy, including the cluster of the registry
/// that discovered it.
#[derive(
    Clone,
    Default,
    Debug,
    Hash,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    schemars::JsonSchema,
    PartialOrd,
    Ord,
)]
pub struct Locality {
    /// The geographic region.
    #[serde(default)]
    pub region: String,
    /// The zone within the `region`, if applicable.
    #[serde(default)]
    pub zone: String,
    /// The subzone within the `zone`, if applicable.
    #[serde(default)]
    pub sub_zone: String,
    /// The cluster of the registry the workload was discovered by. Not part
    /// of the routing label.
    #[serde(default)]
    pub cluster_id: String,
}

impl Locality {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        sub_zone: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            sub_zone: sub_zone.into(),
            ..Self::default()
        }
    }

    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn sub_zone(mut self, sub_zone: impl Into<String>) -> Self {
        self.sub_zone = sub_zone.into();
        self
    }

    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    /// The `region/zone/sub_zone` label used to group endpoints for routing.
    /// Empty when no part of the location is known.
    pub fn label(&self) -> String {
        if self.region.is_empty() && self.zone.is_empty() && self.sub_zone.is_empty() {
            return String::new();
        }

        format!("{}/{}/{}", self.region, self.zone, self.sub_zone)
    }

    /// Parses a `region/zone/sub_zone` label. Missing segments are empty.
    pub fn from_label(label: &str) -> Self {
        let mut segments = label.splitn(3, '/');

        Self {
            region: segments.next().unwrap_or_default().into(),
            zone: segments.next().unwrap_or_default().into(),
            sub_zone: segments.next().unwrap_or_default().into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.label().fmt(f)
    }
}

impl std::str::FromStr for Locality {
    type Err = eyre::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.split('/').count() > 3 {
            return Err(eyre::eyre!("invalid locality identifier"));
        }

        Ok(Self::from_label(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trip() {
        let locality = Locality::new("us-east", "a", "1");
        assert_eq!(locality.label(), "us-east/a/1");
        assert_eq!(Locality::from_label("us-east/a/1"), locality);
        assert_eq!(Locality::from_label("us-east"), Locality::region("us-east"));
        assert_eq!(Locality::default().label(), "");
    }

    #[test]
    fn parse() {
        assert!("us-east/a/1".parse::<Locality>().is_ok());
        assert!("us-east/a/1/too-deep".parse::<Locality>().is_err());
    }
}
