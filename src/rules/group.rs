use super::{Context, Rule, RuleResult};

/// Boolean composition of rules. Exactly one arm is consulted, in the fixed
/// order: single, and, or, not.
#[derive(Default)]
pub struct Group {
    pub and: Vec<Box<dyn Rule>>,
    pub or: Vec<Box<dyn Rule>>,
    pub not: Option<Box<dyn Rule>>,
    pub single: Option<Box<dyn Rule>>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty() && self.not.is_none() && self.single.is_none()
    }

    pub fn evaluate(&self, ctx: &Context) -> RuleResult {
        if let Some(rule) = &self.single {
            return rule.evaluate(ctx);
        }

        if !self.and.is_empty() {
            let mut last = RuleResult::miss("empty and-group");
            for rule in &self.and {
                last = rule.evaluate(ctx);
                if !last.matched {
                    return last;
                }
            }
            return last;
        }

        if !self.or.is_empty() {
            let mut last = RuleResult::miss("empty or-group");
            for rule in &self.or {
                last = rule.evaluate(ctx);
                if last.matched {
                    return last;
                }
            }
            return RuleResult {
                matched: false,
                reason: format!("no or-rules matched (last: {})", last.reason),
                labels: last.labels,
            };
        }

        if let Some(rule) = &self.not {
            let inner = rule.evaluate(ctx);
            return RuleResult {
                matched: !inner.matched,
                reason: format!("negated: {}", inner.reason),
                labels: inner.labels,
            };
        }

        RuleResult::miss("no rules in group")
    }
}
