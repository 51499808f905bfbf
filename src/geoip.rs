use anyhow::{Context, Result};
use maxminddb::{MaxMindDBError, Reader};
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, error};

#[derive(Deserialize, Debug)]
struct CountryRecord {
    country: Option<Country>,
}

#[derive(Deserialize, Debug)]
struct Country {
    iso_code: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AsnRecord {
    autonomous_system_number: Option<u32>,
}

/// MaxMind database adapter resolving client addresses to country codes and
/// AS numbers. Opened once at process start and shared behind an Arc.
pub struct GeoDb {
    reader: Reader<Vec<u8>>,
}

impl GeoDb {
    pub fn open(path: &str) -> Result<Self> {
        let reader = Reader::open_readfile(path)
            .with_context(|| format!("failed to open GeoIP database: {}", path))?;
        debug!("loaded GeoIP database from {}", path);
        Ok(Self { reader })
    }

    /// ISO country code for an address, if known
    pub fn country(&self, ip: IpAddr) -> Option<String> {
        match self.reader.lookup::<CountryRecord>(ip) {
            Ok(record) => record.country.and_then(|c| c.iso_code),
            Err(MaxMindDBError::AddressNotFoundError(_)) => {
                debug!("IP {} not found in GeoIP database", ip);
                None
            }
            Err(e) => {
                error!("GeoIP lookup failed for {}: {}", ip, e);
                None
            }
        }
    }

    /// Autonomous system number for an address, if known
    pub fn asn(&self, ip: IpAddr) -> Option<u32> {
        match self.reader.lookup::<AsnRecord>(ip) {
            Ok(record) => record.autonomous_system_number,
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => {
                error!("ASN lookup failed for {}: {}", ip, e);
                None
            }
        }
    }
}
