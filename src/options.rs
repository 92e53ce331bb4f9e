// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Daemon option maps.
//!
//! aria2 spells its options in kebab-case and wants every value as a string.
//! Callers may hand us `snake_case` keys, JSON booleans, numbers or nulls;
//! [`normalize`] folds all of those into the daemon's dialect:
//!
//! - `_` in keys becomes `-`, leading dashes are dropped
//! - booleans (and the strings `True`/`False`) become `"true"`/`"false"`
//! - numbers become their decimal string
//! - `null` entries are dropped entirely
//!
//! The same normalized map feeds both job submission and the `aria2c`
//! command line ([`startup_args`]).

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde_json::Value;

/// Ordered option map in the daemon's key dialect.
pub type OptionMap = IndexMap<String, Value>;

/// Normalize a single option key.
pub fn normalize_key(key: &str) -> String {
    key.trim().trim_start_matches('-').replace('_', "-")
}

/// Normalize a single option value. Returns `None` for values that must not
/// be sent at all.
pub fn normalize_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(Value::String(b.to_string())),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::String(s) => {
            if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
                Some(Value::String(s.to_ascii_lowercase()))
            } else {
                Some(Value::String(s.clone()))
            }
        }
        // Repeatable options such as `header` travel as string arrays.
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(normalize_value).collect(),
        )),
        Value::Object(_) => Some(Value::String(value.to_string())),
    }
}

/// Normalize a whole mapping into the daemon's dialect.
pub fn normalize<I, K>(raw: I) -> OptionMap
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|(key, value)| {
            normalize_value(&value).map(|v| (normalize_key(key.as_ref()), v))
        })
        .collect()
}

/// Merge option layers; later layers override earlier ones key by key.
pub fn merge<'a, I>(layers: I) -> OptionMap
where
    I: IntoIterator<Item = &'a OptionMap>,
{
    let mut merged = OptionMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Translate options into `aria2c` command-line flags.
///
/// Multi-character keys become `--key=value`, single-character keys
/// `-k=value`. Array values repeat the flag once per element.
///
/// ```
/// use aria2ctl::options::{normalize, startup_args};
/// use serde_json::json;
///
/// let opts = normalize([("rpc_listen_port", json!(6800)), ("p", json!(true))]);
/// assert_eq!(startup_args(&opts), vec!["--rpc-listen-port=6800", "-p=true"]);
/// ```
pub fn startup_args(options: &OptionMap) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in options {
        let key = normalize_key(key);
        let Some(value) = normalize_value(value) else {
            continue;
        };
        for rendered in flag_values(&value) {
            if key.chars().count() == 1 {
                args.push(format!("-{}={}", key, rendered));
            } else {
                args.push(format!("--{}={}", key, rendered));
            }
        }
    }
    args
}

fn flag_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(flag_values).collect(),
        other => vec![other.to_string()],
    }
}

/// Parse a `KEY=VALUE` assignment from the command line.
pub fn parse_assignment(input: &str) -> Result<(String, Value)> {
    let Some((key, value)) = input.split_once('=') else {
        bail!("Expected KEY=VALUE, got '{}'", input);
    };
    let key = normalize_key(key);
    if key.is_empty() {
        bail!("Option name is empty in '{}'", input);
    }
    Ok((key, Value::String(value.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_keys_and_values() {
        let opts = normalize([
            ("max_connection_per_server", json!(4)),
            ("continue", json!(true)),
            ("check_integrity", json!("False")),
            ("all_proxy", Value::Null),
            ("header", json!(["A: 1", Value::Null, "B: 2"])),
        ]);

        assert_eq!(opts.get("max-connection-per-server"), Some(&json!("4")));
        assert_eq!(opts.get("continue"), Some(&json!("true")));
        assert_eq!(opts.get("check-integrity"), Some(&json!("false")));
        assert!(!opts.contains_key("all-proxy"));
        assert_eq!(opts.get("header"), Some(&json!(["A: 1", "B: 2"])));
    }

    #[test]
    fn test_startup_args_flag_forms() {
        let opts = normalize([
            ("rpc_listen_port", json!("6801")),
            ("p", json!(true)),
            ("x", json!(16)),
            ("header", json!(["A: 1", "B: 2"])),
        ]);

        assert_eq!(
            startup_args(&opts),
            vec![
                "--rpc-listen-port=6801",
                "-p=true",
                "-x=16",
                "--header=A: 1",
                "--header=B: 2",
            ]
        );
    }

    #[test]
    fn test_startup_args_idempotent_under_normalization() {
        let mut raw = OptionMap::new();
        raw.insert("rpc_listen_port".into(), json!(6800));
        raw.insert("enable_rpc".into(), json!(true));
        raw.insert("log".into(), Value::Null);

        let once = startup_args(&raw);
        let twice = startup_args(&normalize(raw.clone()));
        assert_eq!(once, twice);
        assert_eq!(once, vec!["--rpc-listen-port=6800", "--enable-rpc=true"]);
    }

    #[test]
    fn test_merge_precedence() {
        let defaults = normalize([("dir", json!("/tmp")), ("split", json!(4))]);
        let named = normalize([("dir", json!("/data"))]);
        let raw = normalize([("split", json!(8))]);

        let merged = merge([&defaults, &named, &raw]);
        assert_eq!(merged.get("dir"), Some(&json!("/data")));
        assert_eq!(merged.get("split"), Some(&json!("8")));
        // Key order follows first appearance.
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["dir", "split"]);
    }

    #[test]
    fn test_parse_assignment() {
        let (key, value) = parse_assignment("max_tries=3").unwrap();
        assert_eq!(key, "max-tries");
        assert_eq!(value, json!("3"));

        let (_, value) = parse_assignment("header=X-A: b=c").unwrap();
        assert_eq!(value, json!("X-A: b=c"));

        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }
}
