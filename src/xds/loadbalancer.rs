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

//! Locality-aware load balancing: explicit weight distribution, priority
//! failover by locality hierarchy, and label-based failover priorities.
//! Applied to an assignment relative to the requesting proxy's own locality.

use std::collections::BTreeMap;

use super::endpoints::LocalityEndpoints;
use crate::{
    config::{LocalityDistribute, LocalityLbSetting, RegionFailover},
    generated::envoy::config::endpoint::v3::{ClusterLoadAssignment, LocalityLbEndpoints},
    mesh::{Labels, Locality},
};

/// The locality LB setting in effect: the destination rule's, falling back
/// to the mesh-wide default, and `None` when the winner is explicitly
/// disabled.
pub(crate) fn locality_lb_setting<'a>(
    mesh: Option<&'a LocalityLbSetting>,
    rule: Option<&'a LocalityLbSetting>,
) -> Option<&'a LocalityLbSetting> {
    let setting = rule.or(mesh)?;
    setting.enabled().then_some(setting)
}

/// Precomputes the byte string mixed into the assignment cache key for
/// label-based failover: one `key=value` line per configured priority label,
/// valued from the proxy's labels.
pub(crate) fn failover_priority_labels(proxy_labels: &Labels, priorities: &[String]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for key in priorities {
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(b'=');
        if let Some(value) = proxy_labels.get(key) {
            bytes.extend_from_slice(value.as_bytes());
        }
        bytes.push(b'\n');
    }
    bytes
}

/// Applies the locality LB setting to `assignment`.
///
/// Priority failover only engages together with outlier detection
/// (`enable_failover`); without it the data plane would never mark a
/// priority tier unhealthy and the failover tiers would be dead
/// configuration.
pub(crate) fn apply_locality_lb_setting(
    assignment: &mut ClusterLoadAssignment,
    wrapped: &[LocalityEndpoints],
    proxy_locality: &Locality,
    proxy_labels: &Labels,
    setting: &LocalityLbSetting,
    enable_failover: bool,
) {
    if !setting.distribute.is_empty() {
        apply_locality_weights(assignment, proxy_locality, &setting.distribute);
    } else if enable_failover {
        if !setting.failover_priority.is_empty() {
            apply_failover_priorities(
                assignment,
                wrapped,
                proxy_labels,
                &setting.failover_priority,
            );
        } else {
            apply_locality_failover(assignment, proxy_locality, &setting.failover);
        }
    }
}

/// Matches a `region/zone/sub_zone` pattern against a locality label.
/// Segments may be `*`; missing trailing segments match anything.
fn locality_pattern_match(pattern: &str, label: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut label_segments = label.split('/');
    loop {
        match (pattern_segments.next(), label_segments.next()) {
            (None, _) => return true,
            (Some(_), None) => return false,
            (Some(pattern), Some(label)) => {
                if pattern != "*" && pattern != label {
                    return false;
                }
            }
        }
    }
}

fn locality_label(group: &LocalityLbEndpoints) -> String {
    group
        .locality
        .as_ref()
        .map(|locality| format!("{}/{}/{}", locality.region, locality.zone, locality.sub_zone))
        .unwrap_or_default()
}

/// Explicit weight distribution: the first rule whose `from` matches the
/// proxy's locality assigns weights to matching destination localities,
/// split evenly across multiple matches. Localities the rule does not
/// mention carry no load.
fn apply_locality_weights(
    assignment: &mut ClusterLoadAssignment,
    proxy_locality: &Locality,
    distribute: &[LocalityDistribute],
) {
    let proxy_label = proxy_locality.label();
    let Some(rule) = distribute
        .iter()
        .find(|rule| locality_pattern_match(&rule.from, &proxy_label))
    else {
        return;
    };

    for group in &mut assignment.endpoints {
        group.load_balancing_weight = None;
    }

    for (pattern, weight) in &rule.to {
        let matched: Vec<usize> = assignment
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, group)| locality_pattern_match(pattern, &locality_label(group)))
            .map(|(index, _)| index)
            .collect();
        if matched.is_empty() {
            continue;
        }

        let share = weight / matched.len() as u32;
        let mut remainder = weight % matched.len() as u32;
        for index in matched {
            let mut assigned = share;
            if remainder > 0 {
                remainder -= 1;
                assigned += 1;
            }
            let group = &mut assignment.endpoints[index];
            group.load_balancing_weight =
                Some(group.load_balancing_weight.unwrap_or(0).saturating_add(assigned));
        }
    }
}

/// Priority tiers relative to the proxy: same subzone, same zone, same
/// region, a configured failover region, then everything else. Failover
/// regions rank above unrelated localities; preferring them is the point of
/// configuring them.
fn failover_tier(proxy: &Locality, endpoint: &Locality, failover: &[RegionFailover]) -> u32 {
    if proxy.region == endpoint.region {
        if proxy.zone == endpoint.zone {
            if proxy.sub_zone == endpoint.sub_zone {
                return 0;
            }
            return 1;
        }
        return 2;
    }

    if failover
        .iter()
        .any(|rule| rule.from == proxy.region && rule.to == endpoint.region)
    {
        return 3;
    }
    4
}

fn apply_locality_failover(
    assignment: &mut ClusterLoadAssignment,
    proxy_locality: &Locality,
    failover: &[RegionFailover],
) {
    for group in &mut assignment.endpoints {
        let locality = Locality::from_label(&locality_label(group));
        group.priority = failover_tier(proxy_locality, &locality, failover);
    }
    normalize_priorities(&mut assignment.endpoints);
}

/// The number of leading priority labels whose values the proxy and the
/// endpoint share.
fn matching_label_prefix(proxy_labels: &Labels, endpoint_labels: &Labels, keys: &[String]) -> usize {
    keys.iter()
        .take_while(|key| {
            matches!(
                (proxy_labels.get(key), endpoint_labels.get(key)),
                (Some(proxy), Some(endpoint)) if proxy == endpoint
            )
        })
        .count()
}

/// Label-based failover: every locality group is split by how many of the
/// ordered priority labels each endpoint shares with the proxy. A longer
/// shared prefix is a better priority.
fn apply_failover_priorities(
    assignment: &mut ClusterLoadAssignment,
    wrapped: &[LocalityEndpoints],
    proxy_labels: &Labels,
    keys: &[String],
) {
    let mut split = Vec::with_capacity(assignment.endpoints.len());
    for (group, wrapped_group) in assignment.endpoints.iter().zip(wrapped) {
        let mut by_priority: BTreeMap<u32, LocalityLbEndpoints> = BTreeMap::new();
        for (lb_endpoint, ep) in group
            .lb_endpoints
            .iter()
            .zip(wrapped_group.mesh_endpoints.iter())
        {
            let matched = matching_label_prefix(proxy_labels, &ep.labels, keys);
            let priority = (keys.len() - matched) as u32;
            by_priority
                .entry(priority)
                .or_insert_with(|| LocalityLbEndpoints {
                    locality: group.locality.clone(),
                    priority,
                    ..LocalityLbEndpoints::default()
                })
                .lb_endpoints
                .push(lb_endpoint.clone());
        }

        for (_, mut new_group) in by_priority {
            new_group.load_balancing_weight = group_weight(&new_group);
            split.push(new_group);
        }
    }

    assignment.endpoints = split;
    normalize_priorities(&mut assignment.endpoints);
}

fn group_weight(group: &LocalityLbEndpoints) -> Option<u32> {
    if group.lb_endpoints.is_empty() {
        return None;
    }
    Some(
        group
            .lb_endpoints
            .iter()
            .map(|lb_endpoint| lb_endpoint.load_balancing_weight.unwrap_or(1))
            .fold(0u32, u32::saturating_add),
    )
}

/// Compacts priorities to consecutive values starting at zero; the data
/// plane rejects gaps.
fn normalize_priorities(groups: &mut [LocalityLbEndpoints]) {
    let mut distinct: Vec<u32> = groups.iter().map(|group| group.priority).collect();
    distinct.sort_unstable();
    distinct.dedup();

    for group in groups {
        group.priority = distinct
            .iter()
            .position(|priority| *priority == group.priority)
            .unwrap_or(0) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_match() {
        assert!(locality_pattern_match("us-east/a/1", "us-east/a/1"));
        assert!(locality_pattern_match("us-east/*", "us-east/a/1"));
        assert!(locality_pattern_match("us-east", "us-east/a/1"));
        assert!(locality_pattern_match("*/a", "us-east/a/1"));
        assert!(!locality_pattern_match("us-west", "us-east/a/1"));
        assert!(!locality_pattern_match("us-east/a/1/extra", "us-east/a/1"));
    }

    #[test]
    fn failover_tiers() {
        let proxy = Locality::new("us-east", "a", "1");
        let failover = vec![RegionFailover {
            from: "us-east".into(),
            to: "us-central".into(),
        }];

        let tier = |locality: Locality| failover_tier(&proxy, &locality, &failover);

        assert_eq!(tier(Locality::new("us-east", "a", "1")), 0);
        assert_eq!(tier(Locality::new("us-east", "a", "2")), 1);
        assert_eq!(tier(Locality::new("us-east", "b", "1")), 2);
        assert_eq!(tier(Locality::new("us-central", "a", "1")), 3);
        assert_eq!(tier(Locality::new("eu-west", "a", "1")), 4);
    }

    #[test]
    fn priorities_are_compacted() {
        let mut groups = vec![
            LocalityLbEndpoints {
                priority: 4,
                ..LocalityLbEndpoints::default()
            },
            LocalityLbEndpoints {
                priority: 0,
                ..LocalityLbEndpoints::default()
            },
            LocalityLbEndpoints {
                priority: 4,
                ..LocalityLbEndpoints::default()
            },
        ];

        normalize_priorities(&mut groups);
        assert_eq!(
            groups.iter().map(|group| group.priority).collect::<Vec<_>>(),
            vec![1, 0, 1],
        );
    }

    #[test]
    fn setting_merge_prefers_rule_and_respects_disabled() {
        let mesh = LocalityLbSetting::default();
        let rule = LocalityLbSetting {
            failover_priority: vec!["network".into()],
            ..LocalityLbSetting::default()
        };

        let chosen = locality_lb_setting(Some(&mesh), Some(&rule)).unwrap();
        assert_eq!(chosen.failover_priority.len(), 1);

        assert!(locality_lb_setting(None, None).is_none());
        assert!(locality_lb_setting(Some(&mesh), None).is_some());

        let disabled = LocalityLbSetting {
            enabled: Some(false),
            ..LocalityLbSetting::default()
        };
        assert!(locality_lb_setting(Some(&mesh), Some(&disabled)).is_none());
    }

    #[test]
    fn priority_label_bytes() {
        let labels = Labels::from([("network", "n1"), ("rack", "r7")]);
        let bytes = failover_priority_labels(
            &labels,
            &["network".to_owned(), "rack".to_owned(), "host".to_owned()],
        );
        assert_eq!(bytes, b"network=n1\nrack=r7\nhost=\n");
    }
}
