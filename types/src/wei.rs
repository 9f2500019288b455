//! Serde helpers that carry wei amounts as decimal strings.
//!
//! JSON numbers lose precision past 2^53 in most clients (and `serde_json::Value`
//! cannot hold more than a `u64`), so every [Wei] crossing the wire or a config
//! file is written as a string. Plain integers are still accepted on input.

use serde::{de::Error, Deserialize, Deserializer, Serializer};

/// An amount of the native currency in its smallest unit.
pub type Wei = u128;

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Text(String),
    Number(u64),
}

fn parse<E: Error>(raw: Raw) -> Result<Wei, E> {
    match raw {
        Raw::Text(text) => text
            .trim()
            .parse::<Wei>()
            .map_err(|_| E::custom(format!("invalid wei amount: {text}"))),
        Raw::Number(number) => Ok(number as Wei),
    }
}

pub fn serialize<S: Serializer>(value: &Wei, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Wei, D::Error> {
    parse(Raw::deserialize(deserializer)?)
}

/// Same encoding for `Option<Wei>`.
pub mod option {
    use super::{parse, Raw, Wei};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Wei>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Wei>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            Some(raw) => parse(raw).map(Some),
            None => Ok(None),
        }
    }
}

/// Signed deltas (ledger entries) use the same string encoding.
pub mod signed {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid signed amount: {text}")))
    }
}

/// Formats wei as a decimal ether string for display (`1500000000000000000` -> `1.5`).
pub fn format_ether(value: Wei) -> String {
    const ETHER: Wei = 1_000_000_000_000_000_000;
    let whole = value / ETHER;
    let fraction = value % ETHER;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{fraction:018}");
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}
