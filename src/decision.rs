use crate::rules::{Context, Group};

/// The outcome a handler executes for a request. `Drop` and `Tarpit` are
/// never produced by the engine today but stay in the sum so the log and
/// metrics taxonomy remains stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Action {
    AllowForward,
    DenyDecoy,
    Drop,
    Tarpit,
    Redirect,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AllowForward => "allow_forward",
            Action::DenyDecoy => "deny_decoy",
            Action::Drop => "drop",
            Action::Tarpit => "tarpit",
            Action::Redirect => "redirect",
        }
    }
}

/// Result of evaluating a request against a profile's rule groups
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub labels: Vec<String>,
    pub redirect_url: Option<String>,
}

/// Deny-precedence evaluation over optional allow and deny groups
pub struct Engine {
    allow: Option<Group>,
    deny: Option<Group>,
}

impl Engine {
    pub fn new(allow: Option<Group>, deny: Option<Group>) -> Self {
        Self { allow, deny }
    }

    pub fn evaluate(&self, ctx: &Context) -> Decision {
        // Deny takes precedence
        if let Some(deny) = &self.deny {
            let result = deny.evaluate(ctx);
            if result.matched {
                return Decision {
                    action: Action::DenyDecoy,
                    reason: result.reason,
                    labels: result.labels,
                    redirect_url: None,
                };
            }
        }

        // Allow gate: when allow rules exist, a request must match them
        if let Some(allow) = &self.allow {
            let result = allow.evaluate(ctx);
            if result.matched {
                return Decision {
                    action: Action::AllowForward,
                    reason: result.reason,
                    labels: result.labels,
                    redirect_url: None,
                };
            }
            return Decision {
                action: Action::DenyDecoy,
                reason: "no allow rules matched".to_string(),
                labels: vec!["default-deny".to_string()],
                redirect_url: None,
            };
        }

        // No rules configured: permissive
        Decision {
            action: Action::AllowForward,
            reason: "no rules configured".to_string(),
            labels: vec!["no-rules".to_string()],
            redirect_url: None,
        }
    }
}
