use anyhow::Result;
use axum::http::header::USER_AGENT;
use regex::Regex;

use super::{Context, Rule, RuleResult};

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| anyhow::anyhow!("invalid regex pattern {:?}: {}", p, e))
        })
        .collect()
}

/// User-Agent regex rule
pub struct UaRule {
    patterns: Vec<Regex>,
    tag: &'static str,
}

impl UaRule {
    pub fn new(patterns: &[String], mode: &str) -> Result<Self> {
        let tag = match mode {
            "whitelist" => "ua_whitelist",
            "blacklist" => "ua_blacklist",
            _ => anyhow::bail!("invalid ua rule mode: {}", mode),
        };

        Ok(Self {
            patterns: compile_patterns(patterns)?,
            tag,
        })
    }
}

impl Rule for UaRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let ua = match ctx.headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
            Some(ua) => ua,
            None => return RuleResult::miss("no User-Agent header"),
        };

        if self.patterns.iter().any(|p| p.is_match(ua)) {
            RuleResult::hit(format!("User-Agent matched: {}", ua), self.tag)
        } else {
            RuleResult::miss(format!("User-Agent not matched: {}", ua))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

/// URL path regex rule
pub struct PathRule {
    patterns: Vec<Regex>,
    tag: &'static str,
}

impl PathRule {
    pub fn new(patterns: &[String], mode: &str) -> Result<Self> {
        let tag = match mode {
            "allow" => "path_allow",
            "deny" => "path_deny",
            _ => anyhow::bail!("invalid path rule mode: {}", mode),
        };

        Ok(Self {
            patterns: compile_patterns(patterns)?,
            tag,
        })
    }
}

impl Rule for PathRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        if self.patterns.iter().any(|p| p.is_match(&ctx.path)) {
            RuleResult::hit(format!("path matched: {}", ctx.path), self.tag)
        } else {
            RuleResult::miss(format!("path not matched: {}", ctx.path))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

/// Case-sensitive HTTP method membership rule
pub struct MethodRule {
    methods: Vec<String>,
    tag: &'static str,
}

impl MethodRule {
    pub fn new(methods: &[String], mode: &str) -> Result<Self> {
        let tag = match mode {
            "allow" => "method_allow",
            "deny" => "method_deny",
            _ => anyhow::bail!("invalid method rule mode: {}", mode),
        };

        Ok(Self {
            methods: methods.to_vec(),
            tag,
        })
    }
}

impl Rule for MethodRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        if self.methods.iter().any(|m| *m == ctx.method) {
            RuleResult::hit(format!("method {} in configured set", ctx.method), self.tag)
        } else {
            RuleResult::miss(format!("method {} not in configured set", ctx.method))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

/// Named-header regex rule; header names compare case-insensitively
pub struct HeaderRule {
    name: String,
    patterns: Vec<Regex>,
    require_header: bool,
    tag: &'static str,
}

impl HeaderRule {
    pub fn new(
        name: &str,
        patterns: &[String],
        require_header: bool,
        mode: &str,
    ) -> Result<Self> {
        let tag = match mode {
            "allow" => "header_allow",
            "deny" => "header_deny",
            _ => anyhow::bail!("invalid header rule mode: {}", mode),
        };

        if name.is_empty() {
            anyhow::bail!("header rule requires a header name");
        }

        Ok(Self {
            name: name.to_string(),
            patterns: compile_patterns(patterns)?,
            require_header,
            tag,
        })
    }
}

impl Rule for HeaderRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let value = match ctx.headers.get(self.name.as_str()).and_then(|v| v.to_str().ok()) {
            Some(v) => v,
            None => {
                let reason = if self.require_header {
                    format!("required header {} absent", self.name)
                } else {
                    format!("header {} absent", self.name)
                };
                return RuleResult::miss(reason);
            }
        };

        if self.patterns.iter().any(|p| p.is_match(value)) {
            RuleResult::hit(format!("header {} matched", self.name), self.tag)
        } else {
            RuleResult::miss(format!("header {} not matched", self.name))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ctx_with_ua(ua: &str) -> Context {
        let mut ctx = Context::default();
        ctx.headers
            .insert(USER_AGENT, HeaderValue::from_str(ua).unwrap());
        ctx
    }

    #[test]
    fn test_ua_whitelist() {
        let rule = UaRule::new(
            &[".*Chrome.*".to_string(), ".*Firefox.*".to_string()],
            "whitelist",
        )
        .unwrap();

        let cases = [
            ("Mozilla/5.0 Chrome/91.0", true),
            ("Mozilla/5.0 Firefox/89.0", true),
            ("curl/7.68.0", false),
            ("python-requests/2.25.1", false),
        ];

        for (ua, matched) in cases {
            assert_eq!(rule.evaluate(&ctx_with_ua(ua)).matched, matched, "UA {}", ua);
        }
    }

    #[test]
    fn test_ua_blacklist() {
        let rule =
            UaRule::new(&[".*curl.*".to_string(), ".*python.*".to_string()], "blacklist").unwrap();
        assert!(rule.evaluate(&ctx_with_ua("curl/7.68.0")).matched);
        assert_eq!(rule.type_tag(), "ua_blacklist");
    }

    #[test]
    fn test_ua_missing_header() {
        let rule = UaRule::new(&[".*".to_string()], "whitelist").unwrap();
        assert!(!rule.evaluate(&Context::default()).matched);
    }

    #[test]
    fn test_ua_invalid_pattern() {
        assert!(UaRule::new(&["[invalid".to_string()], "whitelist").is_err());
    }

    #[test]
    fn test_ua_invalid_mode() {
        assert!(UaRule::new(&[".*".to_string()], "invalid").is_err());
    }

    #[test]
    fn test_path_rule() {
        let rule = PathRule::new(&["^/admin".to_string()], "deny").unwrap();
        assert_eq!(rule.type_tag(), "path_deny");

        let mut ctx = Context::default();
        ctx.path = "/admin/users".to_string();
        assert!(rule.evaluate(&ctx).matched);

        ctx.path = "/public".to_string();
        assert!(!rule.evaluate(&ctx).matched);
    }

    #[test]
    fn test_method_rule_case_sensitive() {
        let rule = MethodRule::new(&["GET".to_string(), "HEAD".to_string()], "allow").unwrap();

        let mut ctx = Context::default();
        ctx.method = "GET".to_string();
        assert!(rule.evaluate(&ctx).matched);

        ctx.method = "get".to_string();
        assert!(!rule.evaluate(&ctx).matched);

        ctx.method = "POST".to_string();
        assert!(!rule.evaluate(&ctx).matched);
    }

    #[test]
    fn test_header_rule_match() {
        let rule =
            HeaderRule::new("X-Api-Key", &["^secret-.*".to_string()], false, "allow").unwrap();

        let mut ctx = Context::default();
        ctx.headers
            .insert("x-api-key", HeaderValue::from_static("secret-123"));
        assert!(rule.evaluate(&ctx).matched);

        ctx.headers
            .insert("x-api-key", HeaderValue::from_static("other"));
        assert!(!rule.evaluate(&ctx).matched);
    }

    #[test]
    fn test_header_rule_absent() {
        let required =
            HeaderRule::new("X-Api-Key", &[".*".to_string()], true, "allow").unwrap();
        let optional =
            HeaderRule::new("X-Api-Key", &[".*".to_string()], false, "allow").unwrap();

        let ctx = Context::default();
        assert!(!required.evaluate(&ctx).matched);
        assert!(!optional.evaluate(&ctx).matched);
    }

    #[test]
    fn test_header_rule_requires_name() {
        assert!(HeaderRule::new("", &[".*".to_string()], false, "allow").is_err());
    }
}
