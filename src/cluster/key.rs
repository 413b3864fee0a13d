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

use crate::mesh::TrafficDirection;

/// The separator of `<direction>|<port>|<subset>|<host>` cluster names.
const KEY_SEPARATOR: &str = "|";

/// The segment separator of DNS-SRV subset cluster names,
/// `<direction>_.<port>_.<subset>_.<host>`.
const DNS_SRV_SEPARATOR: &str = "_.";

const OUTBOUND_DNS_SRV_PREFIX: &str = "outbound_.";

/// A cluster name decomposed into its `(direction, port, subset, host)`
/// components.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterKey {
    pub direction: TrafficDirection,
    pub port: u16,
    pub subset: String,
    pub hostname: String,
}

impl ClusterKey {
    /// Parses a cluster name. Malformed names parse to an empty hostname and
    /// zero port rather than an error; the service lookup downstream absorbs
    /// the failure and yields an empty assignment.
    pub fn parse(name: &str) -> Self {
        let separator = if name.contains(DNS_SRV_SEPARATOR) {
            DNS_SRV_SEPARATOR
        } else {
            KEY_SEPARATOR
        };

        let parts: Vec<&str> = name.split(separator).collect();
        if parts.len() != 4 {
            return Self::default();
        }

        let Some(direction) = TrafficDirection::parse(parts[0]) else {
            return Self::default();
        };
        let Ok(port) = parts[1].parse::<u16>() else {
            return Self::default();
        };

        Self {
            direction,
            port,
            subset: parts[2].into(),
            hostname: parts[3].into(),
        }
    }

    pub fn format(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.direction, self.port, self.subset, self.hostname
        )
    }
}

/// Whether the cluster name is a DNS-SRV subset key. Those clusters front an
/// auto-passthrough gateway, which drives an extra mTLS-only endpoint pass.
pub fn is_dns_srv_key(name: &str) -> bool {
    name.starts_with(OUTBOUND_DNS_SRV_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_outbound() {
        let key = ClusterKey::parse("outbound|9080|v1|reviews.default.svc.cluster.local");
        assert_eq!(key.direction, TrafficDirection::Outbound);
        assert_eq!(key.port, 9080);
        assert_eq!(key.subset, "v1");
        assert_eq!(key.hostname, "reviews.default.svc.cluster.local");
    }

    #[test]
    fn parse_empty_subset() {
        let key = ClusterKey::parse("outbound|9080||reviews.default.svc.cluster.local");
        assert_eq!(key.subset, "");
        assert_eq!(key.hostname, "reviews.default.svc.cluster.local");
    }

    #[test]
    fn parse_inbound_vip() {
        let key = ClusterKey::parse("inbound-vip|9080|http/|reviews.default.svc.cluster.local");
        assert_eq!(key.direction, TrafficDirection::InboundVip);
        assert_eq!(key.subset, "http/");
    }

    #[test]
    fn parse_dns_srv() {
        let name = "outbound_.9080_.v1_.reviews.default.svc.cluster.local";
        let key = ClusterKey::parse(name);
        assert_eq!(key.direction, TrafficDirection::Outbound);
        assert_eq!(key.port, 9080);
        assert_eq!(key.subset, "v1");
        assert_eq!(key.hostname, "reviews.default.svc.cluster.local");
        assert!(is_dns_srv_key(name));
        assert!(!is_dns_srv_key(
            "outbound|9080|v1|reviews.default.svc.cluster.local"
        ));
    }

    #[test]
    fn malformed_names_parse_to_empty() {
        for name in [
            "",
            "reviews.default.svc.cluster.local",
            "outbound|9080|reviews.default.svc.cluster.local",
            "sideways|9080||reviews.default.svc.cluster.local",
            "outbound|nine||reviews.default.svc.cluster.local",
            "outbound|99999999||reviews.default.svc.cluster.local",
        ] {
            let key = ClusterKey::parse(name);
            assert_eq!(key.hostname, "", "{name:?}");
            assert_eq!(key.port, 0, "{name:?}");
        }
    }

    #[test]
    fn format_round_trip() {
        let name = "outbound|9080|v1|reviews.default.svc.cluster.local";
        assert_eq!(ClusterKey::parse(name).format(), name);
    }
}
