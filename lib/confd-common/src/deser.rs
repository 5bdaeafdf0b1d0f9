//! Deserialization helpers, for use with `serde_with`.

use std::fmt;

use serde::{de::Error, Deserializer};
use serde_with::DeserializeAs;

/// Deserializes a flag the way shell environments tend to set them.
///
/// - native booleans are taken as-is
/// - any non-empty string is `true`, an empty string is `false`
/// - any non-zero number is `true`, zero is `false`
/// - an absent value (`null`/`~`) is `false`
pub struct LenientFlag;

impl<'de> DeserializeAs<'de, bool> for LenientFlag {
    fn deserialize_as<D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> serde::de::Visitor<'vde> for Visitor {
            type Value = bool;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a boolean, string, or number")
            }

            fn visit_bool<E: Error>(self, value: bool) -> Result<Self::Value, E> {
                Ok(value)
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(!value.is_empty())
            }

            fn visit_i64<E: Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(value != 0)
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(value != 0)
            }

            fn visit_f64<E: Error>(self, value: f64) -> Result<Self::Value, E> {
                Ok(value != 0.0)
            }

            fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
                Ok(false)
            }

            fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
                Ok(false)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Treats empty strings as absent for optional string fields.
pub struct EmptyStringAsNone;

impl<'de> DeserializeAs<'de, Option<String>> for EmptyStringAsNone {
    fn deserialize_as<D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> serde::de::Visitor<'vde> for Visitor {
            type Value = Option<String>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string")
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
                if value.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(value.to_string()))
                }
            }

            fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_with::serde_as;

    use super::*;

    #[serde_as]
    #[derive(Deserialize)]
    struct Flags {
        #[serde_as(as = "LenientFlag")]
        #[serde(default)]
        dont_reload_agent: bool,

        #[serde_as(as = "EmptyStringAsNone")]
        #[serde(default)]
        consul_token: Option<String>,
    }

    fn parse(yaml: &str) -> Flags {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn lenient_flag_values() {
        assert!(parse("dont_reload_agent: yes-please").dont_reload_agent);
        assert!(parse("dont_reload_agent: 'false'").dont_reload_agent);
        assert!(parse("dont_reload_agent: 1").dont_reload_agent);
        assert!(parse("dont_reload_agent: true").dont_reload_agent);
        assert!(!parse("dont_reload_agent: ''").dont_reload_agent);
        assert!(!parse("dont_reload_agent: 0").dont_reload_agent);
        assert!(!parse("dont_reload_agent: false").dont_reload_agent);
        assert!(!parse("dont_reload_agent: ~").dont_reload_agent);
        assert!(!parse("{}").dont_reload_agent);
    }

    #[test]
    fn empty_token_is_none() {
        assert_eq!(parse("consul_token: ''").consul_token, None);
        assert_eq!(parse("consul_token: abc").consul_token.as_deref(), Some("abc"));

        let from_json: Flags = serde_json::from_str(r#"{"consul_token": null}"#).unwrap();
        assert_eq!(from_json.consul_token, None);
    }
}
