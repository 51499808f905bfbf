pub mod builder;
pub mod group;
pub mod http;
pub mod network;
pub mod rate_limit;
pub mod time;
pub mod tls;

use axum::http::HeaderMap;

pub use builder::build_group;
pub use group::Group;

/// TLS facts captured at accept time and carried through the request
#[derive(Debug, Clone)]
pub struct TlsSnapshot {
    pub version: u16,
    pub sni: Option<String>,
}

/// Read-mostly request facts passed to rules and decoys. Built once per
/// request by the gateway handler.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Attributed client address; may be an unparseable string when taken
    /// from forwarding headers
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub tls: Option<TlsSnapshot>,
    pub request_id: String,
}

/// Result of evaluating a single rule
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub matched: bool,
    pub reason: String,
    pub labels: Vec<String>,
}

impl RuleResult {
    pub fn hit(reason: impl Into<String>, label: &str) -> Self {
        Self {
            matched: true,
            reason: reason.into(),
            labels: vec![label.to_string()],
        }
    }

    pub fn miss(reason: impl Into<String>) -> Self {
        Self {
            matched: false,
            reason: reason.into(),
            labels: Vec::new(),
        }
    }
}

/// A single predicate over a request context. Stateless rules are immutable
/// after construction; stateful ones guard their own interior state.
pub trait Rule: Send + Sync {
    fn evaluate(&self, ctx: &Context) -> RuleResult;
    fn type_tag(&self) -> &'static str;
}
