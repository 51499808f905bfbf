use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub log: LogConfig,
    /// Path to a MaxMind database used by geo/ASN rules
    #[serde(default)]
    pub geoip_db_path: Option<String>,
    /// Bind address for the admin API (e.g. "127.0.0.1:9090")
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub admin_api: AdminApiConfig,
    /// CIDRs (or single IPs) whose forwarding headers are honored
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Maximum request body size in bytes (default 10MB)
    #[serde(default)]
    pub max_request_body: Option<u64>,
    /// Graceful shutdown budget in seconds (default 30)
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdminApiConfig {
    /// Bearer token required on all endpoints except /health
    #[serde(default)]
    pub token: Option<String>,
    /// CIDRs allowed to reach the admin API; empty means any
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileConfig {
    pub id: String,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub decoy: DecoyConfig,
    /// Parsed for compatibility; delay shaping beyond the tarpit is unused
    #[serde(default)]
    pub shaping: Option<ShapingConfig>,
    /// Upper bound on failover attempts per request (default 1)
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub addr: String,
    pub protocol: String,
    #[serde(default)]
    pub tls: Option<TlsFilesConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsFilesConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default, with = "opt_duration_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub health_check_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub allow: Option<RuleGroupConfig>,
    #[serde(default)]
    pub deny: Option<RuleGroupConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleGroupConfig {
    #[serde(default)]
    pub and: Vec<RuleConfig>,
    #[serde(default)]
    pub or: Vec<RuleConfig>,
    #[serde(default)]
    pub not: Option<Box<RuleConfig>>,
    #[serde(default)]
    pub rule: Option<Box<RuleConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub rule_type: String,

    // IP rules
    #[serde(default)]
    pub cidrs: Vec<String>,

    // Regex-based rules (user agent)
    #[serde(default)]
    pub patterns: Vec<String>,

    // Time rules
    #[serde(default)]
    pub time_windows: Vec<TimeWindowConfig>,

    // HTTP rules
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,

    // GeoIP rules
    #[serde(default)]
    pub countries: Vec<String>,

    // ASN rules
    #[serde(default)]
    pub asns: Vec<u32>,

    // TLS rules
    #[serde(default)]
    pub tls_min_version: String,
    #[serde(default)]
    pub tls_max_version: String,
    #[serde(default)]
    pub sni_patterns: Vec<String>,
    #[serde(default)]
    pub require_sni: bool,

    // Rate limiting
    #[serde(default)]
    pub max_requests: u32,
    #[serde(default, with = "opt_duration_serde")]
    pub window: Option<Duration>,

    // Header rule specifics
    #[serde(default)]
    pub header_name: String,
    #[serde(default)]
    pub require_header: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeWindowConfig {
    #[serde(default)]
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecoyConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_file: Option<String>,
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ShapingConfig {
    #[serde(default, with = "opt_duration_serde")]
    pub delay_min: Option<Duration>,
    #[serde(default, with = "opt_duration_serde")]
    pub delay_max: Option<Duration>,
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;

        Self::parse(&content).with_context(|| format!("config file: {}", path))
    }

    /// Parse configuration from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.global.validate()?;

        if self.profiles.is_empty() {
            anyhow::bail!("at least one profile is required");
        }

        let mut profile_ids = HashSet::new();
        for (i, p) in self.profiles.iter().enumerate() {
            p.validate()
                .with_context(|| format!("profile[{}]", i))?;
            if !profile_ids.insert(p.id.clone()) {
                anyhow::bail!("duplicate profile ID: {}", p.id);
            }
        }

        Ok(())
    }
}

impl GlobalConfig {
    fn validate(&self) -> Result<()> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.to_lowercase().as_str()) {
            anyhow::bail!("invalid log level: {}", self.log.level);
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.log.format.to_lowercase().as_str()) {
            anyhow::bail!("invalid log format: {}", self.log.format);
        }

        for cidr in &self.trusted_proxies {
            parse_cidr_or_ip(cidr)
                .with_context(|| format!("invalid trusted proxy CIDR or IP: {}", cidr))?;
        }

        for cidr in &self.admin_api.allowed_ips {
            parse_cidr_or_ip(cidr)
                .with_context(|| format!("invalid admin allowed IP: {}", cidr))?;
        }

        Ok(())
    }
}

impl ProfileConfig {
    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("profile ID is required");
        }

        if self.listeners.is_empty() {
            anyhow::bail!("at least one listener is required");
        }

        for (i, l) in self.listeners.iter().enumerate() {
            l.validate().with_context(|| format!("listener[{}]", i))?;
        }

        if self.backends.is_empty() {
            anyhow::bail!("at least one backend is required");
        }

        for (i, b) in self.backends.iter().enumerate() {
            b.validate().with_context(|| format!("backend[{}]", i))?;
        }

        self.decoy.validate().context("decoy")?;

        Ok(())
    }
}

impl ListenerConfig {
    fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            anyhow::bail!("listener address is required");
        }

        self.addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listener address {:?}", self.addr))?;

        let protocol = self.protocol.to_lowercase();
        if !["http", "https", "tcp"].contains(&protocol.as_str()) {
            anyhow::bail!("invalid protocol: {}", self.protocol);
        }

        if protocol == "https" {
            match &self.tls {
                Some(tls) if !tls.cert_file.is_empty() && !tls.key_file.is_empty() => {}
                _ => anyhow::bail!("TLS cert_file and key_file required for HTTPS"),
            }
        }

        Ok(())
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("backend name is required");
        }

        if self.url.is_empty() {
            anyhow::bail!("backend URL is required");
        }

        let url = reqwest::Url::parse(&self.url)
            .with_context(|| format!("invalid backend URL {:?}", self.url))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("backend URL must use http or https scheme: {}", self.url);
        }

        if url.host_str().is_none() {
            anyhow::bail!("backend URL must include host: {}", self.url);
        }

        Ok(())
    }
}

impl DecoyConfig {
    fn validate(&self) -> Result<()> {
        if self.mode.is_empty() {
            return Ok(()); // decoy is optional
        }

        let mode = self.mode.to_lowercase();
        if !["static", "redirect"].contains(&mode.as_str()) {
            anyhow::bail!("invalid decoy mode: {}", self.mode);
        }

        if mode == "redirect" && self.redirect_to.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("redirect_to is required for redirect mode");
        }

        Ok(())
    }
}

/// Parse a CIDR, accepting single addresses as /32 or /128
pub fn parse_cidr_or_ip(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: IpAddr = s
        .parse()
        .with_context(|| format!("not a CIDR or IP address: {:?}", s))?;
    Ok(IpNet::from(ip))
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&format!("{}s", d.as_secs())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) if !s.is_empty() => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "s"),
        };
        let num: u64 = num
            .parse()
            .map_err(|_| format!("invalid duration: {:?}", s))?;
        match unit {
            "ms" => Ok(Duration::from_millis(num)),
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            _ => Err(format!("invalid duration unit: {:?}", s)),
        }
    }
}
