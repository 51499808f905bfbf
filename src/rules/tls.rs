use anyhow::Result;
use regex::Regex;

use super::{Context, Rule, RuleResult};

fn parse_tls_version(s: &str) -> Result<Option<u16>> {
    match s {
        "" => Ok(None),
        "1.0" => Ok(Some(0x0301)),
        "1.1" => Ok(Some(0x0302)),
        "1.2" => Ok(Some(0x0303)),
        "1.3" => Ok(Some(0x0304)),
        _ => anyhow::bail!("invalid TLS version: {:?}", s),
    }
}

/// Bounds the negotiated TLS protocol version. Plain-HTTP requests only
/// match when both bounds are empty.
pub struct TlsVersionRule {
    min: Option<u16>,
    max: Option<u16>,
}

impl TlsVersionRule {
    pub fn new(min: &str, max: &str) -> Result<Self> {
        Ok(Self {
            min: parse_tls_version(min)?,
            max: parse_tls_version(max)?,
        })
    }
}

impl Rule for TlsVersionRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let version = match &ctx.tls {
            Some(tls) if tls.version != 0 => tls.version,
            _ => {
                return if self.min.is_none() && self.max.is_none() {
                    RuleResult::hit("no TLS version constraints", self.type_tag())
                } else {
                    RuleResult::miss("no TLS on connection")
                };
            }
        };

        if let Some(min) = self.min {
            if version < min {
                return RuleResult::miss(format!("TLS version 0x{:04x} below minimum", version));
            }
        }
        if let Some(max) = self.max {
            if version > max {
                return RuleResult::miss(format!("TLS version 0x{:04x} above maximum", version));
            }
        }

        RuleResult::hit(
            format!("TLS version 0x{:04x} within bounds", version),
            self.type_tag(),
        )
    }

    fn type_tag(&self) -> &'static str {
        "tls_version"
    }
}

/// SNI regex rule. An absent SNI matches unless `require_sni` is set.
pub struct SniRule {
    patterns: Vec<Regex>,
    require_sni: bool,
    tag: &'static str,
}

impl SniRule {
    pub fn new(patterns: &[String], require_sni: bool, mode: &str) -> Result<Self> {
        let tag = match mode {
            "allow" => "sni_allow",
            "deny" => "sni_deny",
            _ => anyhow::bail!("invalid sni rule mode: {}", mode),
        };

        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| anyhow::anyhow!("invalid regex pattern {:?}: {}", p, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns: compiled,
            require_sni,
            tag,
        })
    }
}

impl Rule for SniRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let sni = ctx
            .tls
            .as_ref()
            .and_then(|t| t.sni.as_deref())
            .unwrap_or("");

        if sni.is_empty() {
            return if self.require_sni {
                RuleResult::miss("SNI required but not present")
            } else {
                RuleResult::hit("SNI not required", self.tag)
            };
        }

        if self.patterns.iter().any(|p| p.is_match(sni)) {
            RuleResult::hit(format!("SNI matched: {}", sni), self.tag)
        } else {
            RuleResult::miss(format!("SNI not matched: {}", sni))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::TlsSnapshot;

    fn ctx_with_tls(version: u16, sni: Option<&str>) -> Context {
        Context {
            tls: Some(TlsSnapshot {
                version,
                sni: sni.map(str::to_string),
            }),
            ..Context::default()
        }
    }

    #[test]
    fn test_tls_version_in_range() {
        let rule = TlsVersionRule::new("1.2", "1.3").unwrap();

        assert!(rule.evaluate(&ctx_with_tls(0x0303, None)).matched); // 1.2
        assert!(rule.evaluate(&ctx_with_tls(0x0304, None)).matched); // 1.3
        assert!(!rule.evaluate(&ctx_with_tls(0x0302, None)).matched); // 1.1
        assert!(!rule.evaluate(&Context::default()).matched); // no TLS
    }

    #[test]
    fn test_tls_version_empty_bounds() {
        let rule = TlsVersionRule::new("", "").unwrap();
        assert!(rule.evaluate(&ctx_with_tls(0x0303, None)).matched);
        // plain HTTP with no constraints also matches
        assert!(rule.evaluate(&Context::default()).matched);
    }

    #[test]
    fn test_tls_version_invalid() {
        assert!(TlsVersionRule::new("invalid", "1.3").is_err());
    }

    #[test]
    fn test_tls_version_type_tag() {
        let rule = TlsVersionRule::new("1.2", "1.3").unwrap();
        assert_eq!(rule.type_tag(), "tls_version");
    }

    #[test]
    fn test_sni_allow() {
        let rule = SniRule::new(
            &[r".*\.example\.com$".to_string(), r"^test\..*".to_string()],
            false,
            "allow",
        )
        .unwrap();

        let cases = [
            (Some("www.example.com"), true),
            (Some("test.domain.com"), true),
            (Some("other.domain.com"), false),
            (None, true), // SNI not required
        ];

        for (sni, matched) in cases {
            let result = rule.evaluate(&ctx_with_tls(0x0304, sni));
            assert_eq!(result.matched, matched, "SNI {:?}", sni);
        }
    }

    #[test]
    fn test_sni_required() {
        let rule =
            SniRule::new(&[r".*\.example\.com$".to_string()], true, "allow").unwrap();
        assert!(!rule.evaluate(&ctx_with_tls(0x0304, None)).matched);
        assert!(!rule.evaluate(&Context::default()).matched);
    }

    #[test]
    fn test_sni_type_tags() {
        let allow = SniRule::new(&[".*".to_string()], false, "allow").unwrap();
        assert_eq!(allow.type_tag(), "sni_allow");

        let deny = SniRule::new(&[".*".to_string()], false, "deny").unwrap();
        assert_eq!(deny.type_tag(), "sni_deny");
    }

    #[test]
    fn test_sni_invalid_mode_and_pattern() {
        assert!(SniRule::new(&[".*".to_string()], false, "invalid").is_err());
        assert!(SniRule::new(&["[invalid".to_string()], false, "allow").is_err());
    }
}
