use std::{fmt::Display, str::FromStr};

use crate::error::ParseError;

/// A byte count decoded from a size literal such as `5MB` or `5MiB`.
///
/// Units follow the prefixes for decimal and binary multiples as defined by
/// the NIST in the international system of units
/// (<https://physics.nist.gov/cuu/Units/binary.html>): `B`, then `kB` through
/// `YB` as powers of 1000 and `KiB` through `YiB` as powers of 1024. Unit
/// matching is exact and case-sensitive (`MB` is valid, `mb` and `KB` are
/// not). Purely numeric literals are raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Decodes a size literal. Surrounding whitespace is trimmed and interior
    /// spaces are removed first, so `" 5 MB "` equals `"5MB"`.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let bad = |reason: &str| ParseError::BadSizeLiteral {
            value: input.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = input.trim().chars().filter(|c| *c != ' ').collect();
        if compact.is_empty() {
            return Err(bad("empty literal"));
        }

        let unit_start = compact
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(compact.len());
        let (digits, unit) = compact.split_at(unit_start);
        if digits.is_empty() {
            return Err(bad("quantity is not a number"));
        }

        // Digit-only prefix, so a parse failure can only mean overflow.
        let quantity = digits
            .parse::<u128>()
            .map_err(|_| bad("quantity is too large"))?;

        let total = if unit.is_empty() {
            quantity
        } else {
            let multiplier = unit_multiplier(unit)
                .ok_or_else(|| bad(&format!("unknown unit '{unit}'")))?;
            quantity
                .checked_mul(multiplier)
                .ok_or_else(|| bad("quantity is too large"))?
        };

        u64::try_from(total)
            .map(ByteSize)
            .map_err(|_| bad("exceeds the addressable range"))
    }
}

fn unit_multiplier(unit: &str) -> Option<u128> {
    let m = match unit {
        "B" => 1,
        "kB" => 1000u128.pow(1),
        "MB" => 1000u128.pow(2),
        "GB" => 1000u128.pow(3),
        "TB" => 1000u128.pow(4),
        "PB" => 1000u128.pow(5),
        "EB" => 1000u128.pow(6),
        "ZB" => 1000u128.pow(7),
        "YB" => 1000u128.pow(8),
        "KiB" => 1024u128.pow(1),
        "MiB" => 1024u128.pow(2),
        "GiB" => 1024u128.pow(3),
        "TiB" => 1024u128.pow(4),
        "PiB" => 1024u128.pow(5),
        "EiB" => 1024u128.pow(6),
        "ZiB" => 1024u128.pow(7),
        "YiB" => 1024u128.pow(8),
        _ => return None,
    };
    Some(m)
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        ByteSize(bytes)
    }
}

impl Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ByteSize::parse(s)
    }
}

impl<'de> serde::Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<ByteSize, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // A size may be provided as a string (e.g. "5MiB") or as a pure
        // number (e.g. 5242880). Serde forces a number when only digits are
        // provided, so deserialize as a generic value and check the type.
        let value = serde_yaml::Value::deserialize(deserializer)?;

        match value {
            serde_yaml::Value::String(s) => {
                ByteSize::parse(&s).map_err(serde::de::Error::custom)
            }
            serde_yaml::Value::Number(n) => {
                let n = n.as_u64().ok_or_else(|| {
                    serde::de::Error::custom("invalid size, expected unsigned integer")
                })?;
                Ok(ByteSize(n))
            }
            _ => Err(serde::de::Error::custom("invalid size literal")),
        }
    }
}

impl serde::Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}
