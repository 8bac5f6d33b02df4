use crate::record::{OutputRecord, ServiceOutput};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("failed to read geo database: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse geo database: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid network prefix '{0}'")]
    InvalidPrefix(String),
}

/// Location attached to output records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoDataRecord {
    pub ip: String,
    pub country_name: String,
    pub latitude: f32,
    pub longitude: f32,
    /// `[longitude, latitude]`
    pub location: [f32; 2],
    pub timezone: String,
}

impl GeoDataRecord {
    pub fn new(ip: &str, location: &GeoLocation) -> Self {
        Self {
            ip: ip.to_string(),
            country_name: location.country_name.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            location: [location.longitude, location.latitude],
            timezone: location.timezone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub country_name: String,
    pub latitude: f32,
    pub longitude: f32,
    #[serde(default)]
    pub timezone: String,
}

/// Narrow lookup interface over a GeoIP database
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation>;
}

#[derive(Debug, Default)]
pub struct NullGeoLookup;

impl GeoLookup for NullGeoLookup {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoLocation> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Network {
    addr: IpAddr,
    prefix_len: u8,
}

impl Network {
    fn parse(s: &str) -> Result<Self, GeoError> {
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| GeoError::InvalidPrefix(s.to_string()))?;
        let max_len = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match len {
            Some(len) => len
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|l| *l <= max_len)
                .ok_or_else(|| GeoError::InvalidPrefix(s.to_string()))?,
            None => max_len,
        };
        Ok(Self { addr, prefix_len })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix_len as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - self.prefix_len as u32)
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticGeoRow {
    prefix: String,
    #[serde(flatten)]
    location: GeoLocation,
}

/// In-memory table of network prefixes, the longest matching prefix wins
#[derive(Debug, Default)]
pub struct StaticGeoLookup {
    entries: Vec<(Network, GeoLocation)>,
}

impl StaticGeoLookup {
    pub fn from_json(json: &str) -> Result<Self, GeoError> {
        let rows: Vec<StaticGeoRow> = serde_json::from_str(json)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((Network::parse(&row.prefix)?, row.location));
        }
        // longest prefix first so the first hit is the most specific one
        entries.sort_by(|a, b| b.0.prefix_len.cmp(&a.0.prefix_len));
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let json = std::fs::read_to_string(path)?;
        let lookup = Self::from_json(&json)?;
        info!(path = %path.display(), networks = lookup.entries.len(), "Loaded geo database");
        Ok(lookup)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLookup for StaticGeoLookup {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, loc)| loc.clone())
    }
}

/// Attach location data to a record based on its client address
pub fn apply_location(rec: &mut OutputRecord, geo: &dyn GeoLookup) {
    let ip_str = rec.ip_address().to_string();
    let Ok(ip) = ip_str.parse::<IpAddr>() else {
        debug!(ip = %ip_str, "Skipping geo lookup for unparseable address");
        return;
    };
    if let Some(location) = geo.lookup(ip) {
        rec.set_geo_location(GeoDataRecord::new(&ip_str, &location));
    }
}
