use serde::{Deserialize, Serialize};

/// Bit assignments for every response attribute. The numeric values are a
/// wire contract: clients pass them as `fields=<integer>` and the same
/// integers are forwarded to the upstream batch endpoint.
const FIELD_BITS: &[(&str, u64)] = &[
    ("country", 1),
    ("countryCode", 2),
    ("region", 4),
    ("regionName", 8),
    ("city", 16),
    ("zip", 32),
    ("lat", 64),
    ("lon", 128),
    ("timezone", 256),
    ("isp", 512),
    ("org", 1024),
    ("as", 2048),
    ("reverse", 4096),
    ("query", 8192),
    ("status", 16384),
    ("message", 32768),
    ("mobile", 65536),
    ("proxy", 131072),
    ("accuracy", 262144),
    ("district", 524288),
    ("continent", 1048576),
    ("continentCode", 2097152),
    ("asname", 4194304),
    ("currency", 8388608),
    ("hosting", 16777216),
    ("offset", 33554432),
];

/// Mask of requested response attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(u64);

impl Fields {
    /// status,country,countryCode,region,regionName,city,zip,lat,lon,
    /// timezone,isp,org,as,query,message
    pub const DEFAULT: Fields = Fields(61439);

    pub const REVERSE: Fields = Fields(4096);
    pub const STATUS: Fields = Fields(16384);

    pub fn from_int(v: u64) -> Self {
        Fields(v)
    }

    /// Parses a comma separated list of attribute names. Unknown names are
    /// ignored.
    pub fn from_csv(s: &str) -> Self {
        let mut mask = 0;
        for name in s.split(',') {
            if let Some((_, bit)) = FIELD_BITS.iter().find(|(n, _)| *n == name) {
                mask |= bit;
            }
        }
        Fields(mask)
    }

    /// The rule every user-supplied fields value goes through: an integer is
    /// taken as the raw bit pattern, anything else is parsed as CSV.
    pub fn parse(s: &str) -> Self {
        s.parse::<u64>().map(Fields).unwrap_or_else(|_| Self::from_csv(s))
    }

    pub fn contains(self, other: Fields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn merge(self, other: Fields) -> Fields {
        Fields(self.0 | other.0)
    }

    pub fn remove(self, other: Fields) -> Fields {
        Fields(self.0 & !other.0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}
