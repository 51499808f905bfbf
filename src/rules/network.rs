use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use ipnet::IpNet;

use crate::config::parse_cidr_or_ip;
use crate::geoip::GeoDb;

use super::{Context, Rule, RuleResult};

/// CIDR containment rule over the attributed client IP
pub struct IpRule {
    nets: Vec<IpNet>,
    tag: &'static str,
}

impl IpRule {
    pub fn new(cidrs: &[String], mode: &str) -> Result<Self> {
        let tag = match mode {
            "allow" => "ip_allow",
            "deny" => "ip_deny",
            _ => anyhow::bail!("invalid ip rule mode: {}", mode),
        };

        let mut nets = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            nets.push(parse_cidr_or_ip(cidr)?);
        }

        Ok(Self { nets, tag })
    }
}

impl Rule for IpRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let ip: IpAddr = match ctx.client_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return RuleResult::miss(format!("unparseable client IP: {}", ctx.client_ip))
            }
        };

        if self.nets.iter().any(|net| net.contains(&ip)) {
            RuleResult::hit(format!("IP {} in configured ranges", ip), self.tag)
        } else {
            RuleResult::miss(format!("IP {} not in configured ranges", ip))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

/// Country-code rule resolved through the GeoIP adapter
pub struct GeoRule {
    countries: Vec<String>,
    db: Option<Arc<GeoDb>>,
    tag: &'static str,
}

impl GeoRule {
    pub fn new(countries: &[String], mode: &str, db: Option<Arc<GeoDb>>) -> Result<Self> {
        let tag = match mode {
            "allow" => "geo_allow",
            "deny" => "geo_deny",
            _ => anyhow::bail!("invalid geo rule mode: {}", mode),
        };

        Ok(Self {
            countries: countries.iter().map(|c| c.to_uppercase()).collect(),
            db,
            tag,
        })
    }
}

impl Rule for GeoRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let db = match &self.db {
            Some(db) => db,
            None => return RuleResult::miss("GeoIP database not loaded"),
        };

        let ip: IpAddr = match ctx.client_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return RuleResult::miss(format!("unparseable client IP: {}", ctx.client_ip))
            }
        };

        let code = match db.country(ip) {
            Some(code) => code.to_uppercase(),
            None => return RuleResult::miss(format!("no country for IP {}", ip)),
        };

        if self.countries.contains(&code) {
            RuleResult::hit(format!("country {} in configured set", code), self.tag)
        } else {
            RuleResult::miss(format!("country {} not in configured set", code))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}

/// AS-number rule resolved through the GeoIP adapter
pub struct AsnRule {
    asns: Vec<u32>,
    db: Option<Arc<GeoDb>>,
    tag: &'static str,
}

impl AsnRule {
    pub fn new(asns: &[u32], mode: &str, db: Option<Arc<GeoDb>>) -> Result<Self> {
        let tag = match mode {
            "allow" => "asn_allow",
            "deny" => "asn_deny",
            _ => anyhow::bail!("invalid asn rule mode: {}", mode),
        };

        Ok(Self {
            asns: asns.to_vec(),
            db,
            tag,
        })
    }
}

impl Rule for AsnRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let db = match &self.db {
            Some(db) => db,
            None => return RuleResult::miss("GeoIP database not loaded"),
        };

        let ip: IpAddr = match ctx.client_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return RuleResult::miss(format!("unparseable client IP: {}", ctx.client_ip))
            }
        };

        let asn = match db.asn(ip) {
            Some(asn) => asn,
            None => return RuleResult::miss(format!("no ASN for IP {}", ip)),
        };

        if self.asns.contains(&asn) {
            RuleResult::hit(format!("AS{} in configured set", asn), self.tag)
        } else {
            RuleResult::miss(format!("AS{} not in configured set", asn))
        }
    }

    fn type_tag(&self) -> &'static str {
        self.tag
    }
}
