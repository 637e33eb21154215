use crate::fields::Fields;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::Arc;
use std::time::SystemTime;

/// A geolocation result as returned by the upstream. Every attribute is
/// optional so that [`Response::trim`] can blank out anything outside a
/// fields mask without conflating "absent" with "empty string". Serialization
/// omits absent attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
    #[serde(rename = "continentCode", skip_serializing_if = "Option::is_none")]
    pub continent_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(rename = "countryCode", skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(rename = "regionName", skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub r#as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl Response {
    pub fn error(status: &str, message: &str) -> Response {
        Response {
            status: Some(status.to_string()),
            message: Some(message.to_string()),
            ..Response::default()
        }
    }

    /// Clears every attribute whose bit is not in `fields`.
    pub fn trim(mut self, fields: Fields) -> Response {
        if !fields.contains(Fields::from_int(16384)) {
            self.status = None;
        }
        if !fields.contains(Fields::from_int(1048576)) {
            self.continent = None;
        }
        if !fields.contains(Fields::from_int(2097152)) {
            self.continent_code = None;
        }
        if !fields.contains(Fields::from_int(1)) {
            self.country = None;
        }
        if !fields.contains(Fields::from_int(2)) {
            self.country_code = None;
        }
        if !fields.contains(Fields::from_int(4)) {
            self.region = None;
        }
        if !fields.contains(Fields::from_int(8)) {
            self.region_name = None;
        }
        if !fields.contains(Fields::from_int(16)) {
            self.city = None;
        }
        if !fields.contains(Fields::from_int(524288)) {
            self.district = None;
        }
        if !fields.contains(Fields::from_int(32)) {
            self.zip = None;
        }
        if !fields.contains(Fields::from_int(64)) {
            self.lat = None;
        }
        if !fields.contains(Fields::from_int(128)) {
            self.lon = None;
        }
        if !fields.contains(Fields::from_int(262144)) {
            self.accuracy = None;
        }
        if !fields.contains(Fields::from_int(256)) {
            self.timezone = None;
        }
        if !fields.contains(Fields::from_int(33554432)) {
            self.offset = None;
        }
        if !fields.contains(Fields::from_int(8388608)) {
            self.currency = None;
        }
        if !fields.contains(Fields::from_int(512)) {
            self.isp = None;
        }
        if !fields.contains(Fields::from_int(1024)) {
            self.org = None;
        }
        if !fields.contains(Fields::from_int(2048)) {
            self.r#as = None;
        }
        if !fields.contains(Fields::from_int(4194304)) {
            self.asname = None;
        }
        if !fields.contains(Fields::REVERSE) {
            self.reverse = None;
        }
        if !fields.contains(Fields::from_int(65536)) {
            self.mobile = None;
        }
        if !fields.contains(Fields::from_int(131072)) {
            self.proxy = None;
        }
        if !fields.contains(Fields::from_int(16777216)) {
            self.hosting = None;
        }
        if !fields.contains(Fields::from_int(32768)) {
            self.message = None;
        }
        if !fields.contains(Fields::from_int(8192)) {
            self.query = None;
        }
        self
    }
}

/// The unit passed between the batcher, the upstream client and the cache.
///
/// `ip` and `lang` are fixed at creation and together form the cache key.
/// `fields` is the union of every mask ever requested for this key; it only
/// grows. `response` starts out as a populated upstream error so that waiters
/// always read a well-formed body even when the batch fails. `expires` is set
/// by the upstream client on success; `None` reads as expired.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub ip: String,
    pub lang: String,
    pub fields: Fields,
    pub expires: Option<SystemTime>,
    pub response: Response,
}

impl CacheEntry {
    pub fn new(ip: &str, lang: &str, fields: Fields) -> CacheEntry {
        CacheEntry {
            ip: ip.to_string(),
            lang: lang.to_string(),
            fields,
            expires: None,
            response: Response::error("fail", "error in upstream"),
        }
    }

    pub fn key(&self) -> String {
        cache_key(&self.ip, &self.lang)
    }

    /// Heap footprint in bytes, used by the cache for its byte budget.
    pub fn size(&self) -> usize {
        let r = &self.response;
        let strings = [
            &r.status,
            &r.continent,
            &r.continent_code,
            &r.country,
            &r.country_code,
            &r.region,
            &r.region_name,
            &r.city,
            &r.district,
            &r.zip,
            &r.timezone,
            &r.currency,
            &r.isp,
            &r.org,
            &r.r#as,
            &r.asname,
            &r.reverse,
            &r.message,
            &r.query,
        ];

        mem::size_of::<CacheEntry>()
            + self.ip.len()
            + self.lang.len()
            + strings
                .iter()
                .map(|s| s.as_deref().map_or(0, str::len))
                .sum::<usize>()
    }
}

/// Entries are shared between the batcher, the in-flight upstream call, the
/// cache and any number of waiters. Writes happen only inside the upstream
/// fetch; waiters read after the batch signal closes.
pub type SharedEntry = Arc<RwLock<CacheEntry>>;

pub fn shared_entry(entry: CacheEntry) -> SharedEntry {
    Arc::new(RwLock::new(entry))
}

pub fn cache_key(ip: &str, lang: &str) -> String {
    format!("{ip}{lang}")
}
