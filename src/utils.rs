// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small helpers shared across the crate.

use std::net::IpAddr;

/// Mask an RPC secret for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest
/// with "...", so a token never reaches the logs in full. Input no longer
/// than the prefix is masked entirely.
///
/// ```
/// use aria2ctl::utils::mask_secret;
///
/// assert_eq!(mask_secret("token:hunter2", 6), "token:...");
/// ```
pub fn mask_secret(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        return "...".to_string();
    }
    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Whether `host` names this machine.
///
/// Accepts `localhost`, the `127.1` shorthand and any loopback address
/// literal (bracketed IPv6 included).
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host == "127.1" {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
