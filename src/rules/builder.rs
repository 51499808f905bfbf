use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::{RuleConfig, RuleGroupConfig};
use crate::geoip::GeoDb;

use super::group::Group;
use super::http::{HeaderRule, MethodRule, PathRule, UaRule};
use super::network::{AsnRule, GeoRule, IpRule};
use super::rate_limit::RateLimitRule;
use super::time::{parse_time_window, TimeRule};
use super::tls::{SniRule, TlsVersionRule};
use super::Rule;

const DEFAULT_RATE_MAX_REQUESTS: u32 = 100;
const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Build a rule group from configuration. Construction errors are
/// recoverable per rule: the offending rule is logged and omitted, and a
/// group left empty never matches.
pub fn build_group(cfg: &RuleGroupConfig, geodb: Option<&Arc<GeoDb>>) -> Group {
    let mut group = Group::new();

    for rc in &cfg.and {
        if let Some(rule) = build_rule(rc, geodb) {
            group.and.push(rule);
        }
    }

    for rc in &cfg.or {
        if let Some(rule) = build_rule(rc, geodb) {
            group.or.push(rule);
        }
    }

    if let Some(rc) = &cfg.not {
        group.not = build_rule(rc, geodb);
    }

    if let Some(rc) = &cfg.rule {
        group.single = build_rule(rc, geodb);
    }

    group
}

fn build_rule(rc: &RuleConfig, geodb: Option<&Arc<GeoDb>>) -> Option<Box<dyn Rule>> {
    let built: anyhow::Result<Box<dyn Rule>> = match rc.rule_type.as_str() {
        "ip_allow" => IpRule::new(&rc.cidrs, "allow").map(boxed),
        "ip_deny" => IpRule::new(&rc.cidrs, "deny").map(boxed),
        "ua_whitelist" | "ua_match" => UaRule::new(&rc.patterns, "whitelist").map(boxed),
        "ua_blacklist" => UaRule::new(&rc.patterns, "blacklist").map(boxed),
        "geo_allow" => GeoRule::new(&rc.countries, "allow", geodb.cloned()).map(boxed),
        "geo_deny" => GeoRule::new(&rc.countries, "deny", geodb.cloned()).map(boxed),
        "asn_allow" => AsnRule::new(&rc.asns, "allow", geodb.cloned()).map(boxed),
        "asn_deny" => AsnRule::new(&rc.asns, "deny", geodb.cloned()).map(boxed),
        "method_allow" => MethodRule::new(&rc.methods, "allow").map(boxed),
        "method_deny" => MethodRule::new(&rc.methods, "deny").map(boxed),
        "path_allow" => PathRule::new(&rc.paths, "allow").map(boxed),
        "path_deny" => PathRule::new(&rc.paths, "deny").map(boxed),
        "header_allow" => {
            HeaderRule::new(&rc.header_name, &rc.patterns, rc.require_header, "allow").map(boxed)
        }
        "header_deny" => {
            HeaderRule::new(&rc.header_name, &rc.patterns, rc.require_header, "deny").map(boxed)
        }
        "tls_version" => {
            TlsVersionRule::new(&rc.tls_min_version, &rc.tls_max_version).map(boxed)
        }
        "sni_allow" => SniRule::new(&rc.sni_patterns, rc.require_sni, "allow").map(boxed),
        "sni_deny" => SniRule::new(&rc.sni_patterns, rc.require_sni, "deny").map(boxed),
        "rate_limit" => {
            let max_requests = if rc.max_requests == 0 {
                DEFAULT_RATE_MAX_REQUESTS
            } else {
                rc.max_requests
            };
            let window = rc.window.unwrap_or(DEFAULT_RATE_WINDOW);
            Ok(boxed(RateLimitRule::new(max_requests, window)))
        }
        "time_window" => {
            let mut windows = Vec::with_capacity(rc.time_windows.len());
            for tw in &rc.time_windows {
                match parse_time_window(&tw.days, &tw.start, &tw.end) {
                    Ok(parsed) => windows.push(parsed),
                    Err(e) => warn!("failed to parse time window: {}", e),
                }
            }
            Ok(boxed(TimeRule::new(windows)))
        }
        other => {
            warn!("unknown rule type: {}", other);
            return None;
        }
    };

    match built {
        Ok(rule) => Some(rule),
        Err(e) => {
            warn!("failed to build rule type {}: {}", rc.rule_type, e);
            None
        }
    }
}

fn boxed<R: Rule + 'static>(rule: R) -> Box<dyn Rule> {
    Box::new(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleGroupConfig;

    fn rule_cfg(rule_type: &str) -> RuleConfig {
        RuleConfig {
            rule_type: rule_type.to_string(),
            ..RuleConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bad_rule_is_omitted() {
        let cfg = RuleGroupConfig {
            and: vec![
                RuleConfig {
                    rule_type: "ip_allow".to_string(),
                    cidrs: vec!["not-a-cidr".to_string()],
                    ..RuleConfig::default()
                },
                RuleConfig {
                    rule_type: "ip_allow".to_string(),
                    cidrs: vec!["10.0.0.0/8".to_string()],
                    ..RuleConfig::default()
                },
            ],
            ..RuleGroupConfig::default()
        };

        let group = build_group(&cfg, None);
        assert_eq!(group.and.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_rule_type_is_omitted() {
        let cfg = RuleGroupConfig {
            or: vec![rule_cfg("made_up_type")],
            ..RuleGroupConfig::default()
        };

        let group = build_group(&cfg, None);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_defaults() {
        let cfg = RuleGroupConfig {
            rule: Some(Box::new(rule_cfg("rate_limit"))),
            ..RuleGroupConfig::default()
        };

        let group = build_group(&cfg, None);
        let single = group.single.expect("rate limit rule should build");
        assert_eq!(single.type_tag(), "rate_limit");
    }

    #[tokio::test]
    async fn test_ua_match_alias() {
        let cfg = RuleGroupConfig {
            rule: Some(Box::new(RuleConfig {
                rule_type: "ua_match".to_string(),
                patterns: vec![".*".to_string()],
                ..RuleConfig::default()
            })),
            ..RuleGroupConfig::default()
        };

        let group = build_group(&cfg, None);
        assert_eq!(group.single.expect("ua rule").type_tag(), "ua_whitelist");
    }
}
