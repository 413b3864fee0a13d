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

use crate::{
    config::{self, ClientTlsMode, DestinationRule},
    mesh::{endpoint::TLS_MODE_MUTUAL, MeshEndpoint},
    push::PushContext,
};

/// Decides whether mutual TLS applies to an endpoint of one `(port, subset)`.
///
/// The policy evaluation happens once at construction and is reused across
/// every endpoint of the build. Destination-rule TLS settings take precedence
/// over peer-authentication policy; an endpoint that cannot terminate mesh
/// mTLS is always plaintext regardless of either.
#[derive(Clone, Debug)]
pub(crate) struct MtlsChecker {
    enabled_by_config: bool,
}

impl MtlsChecker {
    pub(crate) const fn disabled() -> Self {
        Self {
            enabled_by_config: false,
        }
    }

    pub(crate) fn new(
        push: &PushContext,
        port: u16,
        rule: Option<&DestinationRule>,
        subset_name: &str,
    ) -> Self {
        let tls = config::resolved_traffic_policy(rule, port, subset_name)
            .and_then(|policy| policy.tls);

        let enabled_by_config = match tls {
            Some(tls) => tls.mode == ClientTlsMode::IstioMutual,
            None => push.authn_policies().mtls_enabled_for_port(port),
        };

        Self { enabled_by_config }
    }

    pub(crate) fn check(&self, endpoint: &MeshEndpoint) -> bool {
        self.enabled_by_config && endpoint.tls_mode == TLS_MODE_MUTUAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ClientTlsSettings, TrafficPolicy},
        push::{AuthnPolicies, MtlsMode},
        test_utils::endpoint,
    };

    fn mutual_endpoint() -> MeshEndpoint {
        MeshEndpoint {
            tls_mode: TLS_MODE_MUTUAL.into(),
            ..endpoint("10.0.0.1", 9080, "http")
        }
    }

    #[test]
    fn endpoint_without_mutual_tls_is_always_plaintext() {
        let push = PushContext::default();
        let checker = MtlsChecker::new(&push, 9080, None, "");

        assert!(checker.check(&mutual_endpoint()));
        assert!(!checker.check(&endpoint("10.0.0.1", 9080, "http")));
    }

    #[test]
    fn policy_disable_wins_without_a_rule() {
        let push = PushContext {
            authn_policies: AuthnPolicies {
                default_mode: MtlsMode::Disable,
                ..AuthnPolicies::default()
            },
            ..PushContext::default()
        };

        let checker = MtlsChecker::new(&push, 9080, None, "");
        assert!(!checker.check(&mutual_endpoint()));
    }

    #[test]
    fn rule_tls_overrides_policy() {
        let push = PushContext {
            authn_policies: AuthnPolicies {
                default_mode: MtlsMode::Disable,
                ..AuthnPolicies::default()
            },
            ..PushContext::default()
        };

        let rule = DestinationRule {
            host: "reviews.default.svc.cluster.local".into(),
            traffic_policy: Some(TrafficPolicy {
                tls: Some(ClientTlsSettings {
                    mode: ClientTlsMode::IstioMutual,
                }),
                ..TrafficPolicy::default()
            }),
            ..DestinationRule::default()
        };

        let checker = MtlsChecker::new(&push, 9080, Some(&rule), "");
        assert!(checker.check(&mutual_endpoint()));

        let rule = DestinationRule {
            traffic_policy: Some(TrafficPolicy {
                tls: Some(ClientTlsSettings {
                    mode: ClientTlsMode::Simple,
                }),
                ..TrafficPolicy::default()
            }),
            ..rule
        };
        let checker = MtlsChecker::new(&PushContext::default(), 9080, Some(&rule), "");
        assert!(!checker.check(&mutual_endpoint()));
    }
}
