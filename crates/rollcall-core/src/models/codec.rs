//! Serde helpers for the remote boundary.
//!
//! Remote rows are loosely typed: timestamps arrive as RFC 3339 strings or
//! epoch milliseconds, booleans as `"yes"`/`"no"`, arrays as `null`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Epoch-millisecond timestamps, written as RFC 3339.
pub mod timestamp {
    use super::{DateTime, Deserialize, Deserializer, Serializer, TimeZone, Utc};

    pub fn serialize<S: Serializer>(millis: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        match Utc.timestamp_millis_opt(*millis).single() {
            Some(at) => serializer.serialize_str(&at.to_rfc3339()),
            None => serializer.serialize_i64(*millis),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawTimestamp {
            Millis(i64),
            Text(String),
            Missing(()),
        }

        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Millis(millis) => Ok(millis),
            RawTimestamp::Missing(()) => Ok(0),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .map(|at| at.with_timezone(&Utc).timestamp_millis())
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Wall clock in epoch milliseconds, the unit of every stored timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Trimmed text, with blank values collapsed to `None`.
pub fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// `null` becomes the type's default value.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Booleans written as `true`, `"yes"`, `"1"`, `1` and friends.
pub fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawBool {
        Bool(bool),
        Number(i64),
        Text(String),
        Missing(()),
    }

    match RawBool::deserialize(deserializer)? {
        RawBool::Bool(value) => Ok(value),
        RawBool::Number(value) => Ok(value != 0),
        RawBool::Missing(()) => Ok(false),
        RawBool::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "" | "0" | "false" | "no" | "off" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, found '{other}'"
            ))),
        },
    }
}
