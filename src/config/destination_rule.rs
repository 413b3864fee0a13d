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

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::locality::LocalityLbSetting;
use crate::mesh::Labels;

/// How clients should negotiate TLS towards a destination.
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
pub enum ClientTlsMode {
    /// No TLS.
    Disable,
    /// One-way TLS.
    Simple,
    /// Mutual TLS with caller-provided certificates.
    Mutual,
    /// Mutual TLS with mesh-issued certificates.
    #[default]
    IstioMutual,
}

/// Client TLS settings from a destination rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ClientTlsSettings {
    pub mode: ClientTlsMode,
}

/// Passive health checking settings. Presence alone enables locality
/// failover; the thresholds themselves are consumed by the cluster builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct OutlierDetection {
    #[serde(default)]
    pub consecutive_5xx_errors: Option<u32>,
    #[serde(default)]
    pub consecutive_gateway_errors: Option<u32>,
}

/// Simple load balancing algorithms.
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
pub enum SimpleLb {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
    Passthrough,
}

/// Load balancer settings from a destination rule.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LoadBalancerSettings {
    #[serde(default)]
    pub simple: Option<SimpleLb>,
    #[serde(default)]
    pub locality_lb_setting: Option<LocalityLbSetting>,
}

/// A traffic policy scoped to a single service port.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct PortTrafficPolicy {
    pub port: u16,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerSettings>,
    #[serde(default)]
    pub outlier_detection: Option<OutlierDetection>,
    #[serde(default)]
    pub tls: Option<ClientTlsSettings>,
}

/// Client-side traffic handling for a destination or one of its subsets.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct TrafficPolicy {
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerSettings>,
    #[serde(default)]
    pub outlier_detection: Option<OutlierDetection>,
    #[serde(default)]
    pub tls: Option<ClientTlsSettings>,
    #[serde(default)]
    pub port_level_settings: Vec<PortTrafficPolicy>,
}

/// A label-selected slice of a service's endpoints.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct Subset {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub traffic_policy: Option<TrafficPolicy>,
}

/// Traffic configuration for one destination host.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct DestinationRule {
    pub host: String,
    #[serde(default)]
    pub traffic_policy: Option<TrafficPolicy>,
    #[serde(default)]
    pub subsets: Vec<Subset>,
}

/// The merged view of every destination rule that applies to a host: the
/// principal rule plus the `(name, namespace)` origins it was merged from,
/// kept for cache invalidation.
#[derive(Clone, Debug, Default)]
pub struct ConsolidatedDestRule {
    rule: Option<Arc<DestinationRule>>,
    from: Vec<(String, String)>,
}

impl ConsolidatedDestRule {
    pub fn new(rule: Option<Arc<DestinationRule>>, from: Vec<(String, String)>) -> Self {
        Self { rule, from }
    }

    /// A consolidated view of a single source rule.
    pub fn from_rule(
        name: impl Into<String>,
        namespace: impl Into<String>,
        rule: DestinationRule,
    ) -> Self {
        Self {
            rule: Some(Arc::new(rule)),
            from: vec![(name.into(), namespace.into())],
        }
    }

    pub fn rule(&self) -> Option<&DestinationRule> {
        self.rule.as_deref()
    }

    /// The `(name, namespace)` tuples of the source rules.
    pub fn from(&self) -> &[(String, String)] {
        &self.from
    }
}

/// Overlays `overlay` on `base`, then applies `overlay`'s port-scoped
/// settings for `port`. Later (more specific) settings win per field.
pub fn merge_traffic_policy(
    base: Option<&TrafficPolicy>,
    overlay: Option<&TrafficPolicy>,
    port: u16,
) -> Option<TrafficPolicy> {
    let Some(overlay) = overlay else {
        return base.cloned();
    };

    let mut merged = base.cloned().unwrap_or_default();
    if overlay.load_balancer.is_some() {
        merged.load_balancer = overlay.load_balancer.clone();
    }
    if overlay.outlier_detection.is_some() {
        merged.outlier_detection = overlay.outlier_detection.clone();
    }
    if overlay.tls.is_some() {
        merged.tls = overlay.tls.clone();
    }

    if let Some(port_policy) = overlay
        .port_level_settings
        .iter()
        .find(|policy| policy.port == port)
    {
        if port_policy.load_balancer.is_some() {
            merged.load_balancer = port_policy.load_balancer.clone();
        }
        if port_policy.outlier_detection.is_some() {
            merged.outlier_detection = port_policy.outlier_detection.clone();
        }
        if port_policy.tls.is_some() {
            merged.tls = port_policy.tls.clone();
        }
    }

    Some(merged)
}

/// The traffic policy in effect for `(port, subset)`: the rule-level policy
/// with its port override, with the named subset's policy merged on top.
/// The first subset with a matching name wins; later duplicates are ignored.
pub fn resolved_traffic_policy(
    rule: Option<&DestinationRule>,
    port: u16,
    subset_name: &str,
) -> Option<TrafficPolicy> {
    let rule = rule?;
    let mut policy = merge_traffic_policy(None, rule.traffic_policy.as_ref(), port);

    if let Some(subset) = rule.subsets.iter().find(|subset| subset.name == subset_name) {
        policy = merge_traffic_policy(policy.as_ref(), subset.traffic_policy.as_ref(), port);
    }

    policy
}

/// Whether outlier detection is enabled for `(port, subset)`, and the load
/// balancer settings that apply there.
pub fn outlier_and_lb_settings(
    rule: Option<&DestinationRule>,
    port: u16,
    subset_name: &str,
) -> (bool, Option<LoadBalancerSettings>) {
    match resolved_traffic_policy(rule, port, subset_name) {
        Some(policy) => (policy.outlier_detection.is_some(), policy.load_balancer),
        None => (false, None),
    }
}

/// The label selector of the named subset, or `None` when the subset name is
/// empty, the rule is absent, the subset is unknown, or it selects nothing.
pub fn subset_labels(rule: Option<&DestinationRule>, subset_name: &str) -> Option<Labels> {
    if subset_name.is_empty() {
        return None;
    }

    rule?
        .subsets
        .iter()
        .find(|subset| subset.name == subset_name)
        .filter(|subset| !subset.labels.is_empty())
        .map(|subset| subset.labels.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_with_subsets() -> DestinationRule {
        serde_yaml::from_str(
            "
host: reviews.default.svc.cluster.local
traffic_policy:
  outlier_detection:
    consecutive_5xx_errors: 7
subsets:
  - name: v1
    labels:
      version: v1
  - name: v1
    labels:
      version: duplicate-ignored
  - name: v2
    labels:
      version: v2
    traffic_policy:
      tls:
        mode: Disable
",
        )
        .unwrap()
    }

    #[test]
    fn subset_lookup() {
        let rule = rule_with_subsets();

        let labels = subset_labels(Some(&rule), "v1").unwrap();
        assert_eq!(labels.get("version"), Some("v1"));

        assert_eq!(subset_labels(Some(&rule), ""), None);
        assert_eq!(subset_labels(Some(&rule), "v9"), None);
        assert_eq!(subset_labels(None, "v1"), None);
    }

    #[test]
    fn first_matching_subset_wins() {
        let rule = rule_with_subsets();
        let labels = subset_labels(Some(&rule), "v1").unwrap();
        assert_eq!(labels.get("version"), Some("v1"));
    }

    #[test]
    fn subset_policy_overlays_rule_policy() {
        let rule = rule_with_subsets();

        let policy = resolved_traffic_policy(Some(&rule), 9080, "v2").unwrap();
        assert_eq!(
            policy.tls.unwrap().mode,
            ClientTlsMode::Disable,
            "subset tls should override",
        );
        assert!(policy.outlier_detection.is_some(), "rule policy retained");

        let (outlier, lb) = outlier_and_lb_settings(Some(&rule), 9080, "v1");
        assert!(outlier);
        assert!(lb.is_none());
    }

    #[test]
    fn port_override_beats_rule_policy() {
        let rule: DestinationRule = serde_yaml::from_str(
            "
host: reviews.default.svc.cluster.local
traffic_policy:
  tls:
    mode: IstioMutual
  port_level_settings:
    - port: 9080
      tls:
        mode: Disable
",
        )
        .unwrap();

        let policy = resolved_traffic_policy(Some(&rule), 9080, "").unwrap();
        assert_eq!(policy.tls.unwrap().mode, ClientTlsMode::Disable);

        let policy = resolved_traffic_policy(Some(&rule), 9081, "").unwrap();
        assert_eq!(policy.tls.unwrap().mode, ClientTlsMode::IstioMutual);
    }
}
