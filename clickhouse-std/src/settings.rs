//! Query settings sent with every query packet.
//!
//! Settings are ordered key-value pairs. Adding a setting that already exists replaces its value
//! in place, so per-call settings can override connection-wide ones without reordering them.
//!
//! ```
//! use clickhouse_std::Settings;
//!
//! let mut settings = Settings::default();
//! settings.add_setting("max_threads", 8_i32);
//! settings.add_setting("default_format", "JSON");
//! settings.add_setting("max_threads", 4_i32);
//! assert_eq!(settings.encode_to_strings(), vec!["max_threads = 4", "default_format = JSON"]);
//! ```
use std::fmt;

use bytes::BytesMut;

use crate::FxIndexMap;
use crate::io::ClickHouseBytesWrite;
use crate::prelude::*;

const SETTING_FLAG_NONE: u64 = 0x00;

/// Supported value types for query settings.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(untagged))]
pub enum SettingValue {
    Int(i64),
    Bool(bool),
    Float(f64),
    String(String),
}

macro_rules! setting_value {
    ($ty:ident, $inner:ty) => {
        impl From<$inner> for SettingValue {
            fn from(value: $inner) -> Self { SettingValue::$ty(value) }
        }
    };
    ($ty:ident, $inner:ty, $override:ty) => {
        impl From<$override> for SettingValue {
            #[allow(clippy::cast_lossless)]
            #[allow(clippy::cast_possible_wrap)]
            fn from(value: $override) -> Self { SettingValue::$ty(value as $inner) }
        }
    };
    ($ty:ident, $inner:ty, $v:tt => { $override:expr }) => {
        impl From<$inner> for SettingValue {
            fn from($v: $inner) -> Self { SettingValue::$ty($override) }
        }
    };
}

setting_value!(Int, i64, u8);
setting_value!(Int, i64, u16);
setting_value!(Int, i64, u32);
setting_value!(Int, i64, u64);
setting_value!(Int, i64, i8);
setting_value!(Int, i64, i16);
setting_value!(Int, i64, i32);
setting_value!(Int, i64);
setting_value!(Bool, bool);
setting_value!(Float, f64, f32);
setting_value!(Float, f64);
setting_value!(String, &str, v => { v.to_string() });
setting_value!(String, String);

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(i) => write!(f, "{i}"),
            // The server parses booleans from 0/1
            SettingValue::Bool(b) => write!(f, "{}", u8::from(*b)),
            SettingValue::Float(fl) => write!(f, "{fl}"),
            SettingValue::String(s) => write!(f, "{s}"),
        }
    }
}

/// An ordered collection of query settings.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Settings(FxIndexMap<String, SettingValue>);

impl Settings {
    /// Adds a setting, replacing the value of an existing setting with the same name.
    pub fn add_setting<S>(&mut self, name: impl Into<String>, setting: S)
    where
        SettingValue: From<S>,
    {
        let _ = self.0.insert(name.into(), setting.into());
    }

    /// Return new settings with the given name and value added.
    #[must_use]
    pub fn with_setting<S>(mut self, name: impl Into<String>, setting: S) -> Self
    where
        SettingValue: From<S>,
    {
        self.add_setting(name, setting);
        self
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> { self.0.get(name) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Returns these settings overridden by `other`.
    #[must_use]
    pub fn merged(&self, other: &Settings) -> Settings {
        let mut merged = self.clone();
        for (name, value) in &other.0 {
            let _ = merged.0.insert(name.clone(), value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Converts settings to `(key, value)` string pairs.
    pub fn encode_to_key_value_strings(&self) -> Vec<(String, String)> {
        self.0.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
    }

    /// Converts settings to `key = value` strings.
    pub fn encode_to_strings(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k} = {v}")).collect()
    }

    /// Writes every setting in the query packet layout, excluding the terminating empty name.
    ///
    /// Before settings were serialized as strings only integer and boolean settings could be
    /// sent. Others are skipped for such servers.
    pub(crate) fn encode(&self, writer: &mut BytesMut, as_strings: bool) {
        for (name, value) in &self.0 {
            if as_strings {
                writer.put_string(name);
                writer.put_var_uint(SETTING_FLAG_NONE);
                writer.put_string(value.to_string());
                continue;
            }

            #[expect(clippy::cast_sign_loss)]
            let value = match value {
                SettingValue::Int(i) => *i as u64,
                SettingValue::Bool(b) => u64::from(*b),
                _ => {
                    warn!(setting = name.as_str(), "setting not supported by server revision, skipping");
                    continue;
                }
            };
            writer.put_string(name);
            writer.put_var_uint(value);
        }
    }
}

impl<K, S> FromIterator<(K, S)> for Settings
where
    K: Into<String>,
    SettingValue: From<S>,
{
    fn from_iter<T: IntoIterator<Item = (K, S)>>(iter: T) -> Self {
        let mut settings = Settings::default();
        for (k, v) in iter {
            settings.add_setting(k, v);
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ClickHouseBytesRead;

    #[test]
    fn test_replacement_keeps_order() {
        let settings: Settings = [("a", 1), ("b", 2), ("a", 3)].into_iter().collect();
        assert_eq!(settings.encode_to_key_value_strings(), vec![
            ("a".to_string(), "3".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
    }

    #[test]
    fn test_merged_overrides() {
        let base = Settings::default().with_setting("async_insert", 0).with_setting("x", "y");
        let call = Settings::default().with_setting("async_insert", true);
        let merged = base.merged(&call);
        assert_eq!(merged.get("async_insert"), Some(&SettingValue::Bool(true)));
        assert_eq!(merged.encode_to_strings(), vec!["async_insert = 1", "x = y"]);
    }

    #[test]
    fn test_encode_as_strings() {
        let settings = Settings::default().with_setting("max_threads", 8_u8);
        let mut buf = BytesMut::new();
        settings.encode(&mut buf, true);
        let mut reader = &buf[..];
        assert_eq!(reader.try_get_utf8_string().unwrap(), "max_threads");
        assert_eq!(reader.try_get_var_uint().unwrap(), SETTING_FLAG_NONE);
        assert_eq!(reader.try_get_utf8_string().unwrap(), "8");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_legacy_encoding_skips_strings() {
        let settings = Settings::default().with_setting("format", "JSON").with_setting("n", 2);
        let mut buf = BytesMut::new();
        settings.encode(&mut buf, false);
        let mut reader = &buf[..];
        assert_eq!(reader.try_get_utf8_string().unwrap(), "n");
        assert_eq!(reader.try_get_var_uint().unwrap(), 2);
        assert!(reader.is_empty());
    }
}
