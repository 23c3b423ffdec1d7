// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Input checks for addresses, names and shell-style name patterns.

use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

static DOMAIN: OnceLock<Regex> = OnceLock::new();
static HOSTNAME: OnceLock<Regex> = OnceLock::new();

pub fn is_valid_ipv4_address(address: &str) -> bool {
    address.parse::<Ipv4Addr>().is_ok()
}

/// Only the base address of `a.b.c.d/nn` is checked.
pub fn is_valid_ipv4_network(network: &str) -> bool {
    network
        .split('/')
        .next()
        .is_some_and(is_valid_ipv4_address)
}

pub fn is_valid_ipv6_address(address: &str) -> bool {
    address.parse::<Ipv6Addr>().is_ok()
}

pub fn is_valid_domain(entry: &str) -> bool {
    DOMAIN
        .get_or_init(|| {
            Regex::new(r"^([a-z0-9]+(-[a-z0-9]+)*\.)+[a-z]{2,}$").expect("static domain pattern")
        })
        .is_match(entry)
}

pub fn is_valid_hostname(entry: &str) -> bool {
    HOSTNAME
        .get_or_init(|| {
            Regex::new(r"^([a-z0-9](?:[a-z0-9-]*[a-z0-9]))$").expect("static hostname pattern")
        })
        .is_match(entry)
}

/// Case-insensitive shell-style match supporting `*`, `?` and `[...]`.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    Regex::new(&wildcard_to_regex(pattern))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?is)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' || inner == '^' {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if closed && !class.is_empty() && class != "^" {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(class.trim_start_matches('^')));
                    if closed {
                        out.push_str(&regex::escape("]"));
                    }
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validates_ipv4() {
        assert!(is_valid_ipv4_address("10.0.0.1"));
        assert!(!is_valid_ipv4_address("10.0.0"));
        assert!(!is_valid_ipv4_address("evil.example"));
        assert!(is_valid_ipv4_network("10.0.0.0/24"));
        assert!(!is_valid_ipv4_network("fe80::/64"));
        assert!(is_valid_ipv6_address("fe80::1"));
    }

    #[test]
    fn test_validates_names() {
        assert!(is_valid_domain("evil.example.com"));
        assert!(is_valid_domain("my-host.example.org"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("-bad.example"));
        assert!(is_valid_hostname("workstation-01"));
        assert!(!is_valid_hostname("workstation_01"));
        assert!(!is_valid_hostname("a"));
    }

    #[test]
    fn test_matches_shell_patterns_case_insensitively() {
        assert!(wildcard_match("*ssh*", "Anomalous Connection::SSH to Rare"));
        assert!(wildcard_match("device::?ew*", "Device::New User Agent"));
        assert!(wildcard_match("[ab]*", "beacon"));
        assert!(!wildcard_match("[!ab]*", "beacon"));
        assert!(!wildcard_match("compliance*", "Anomalous Connection"));
        assert!(wildcard_match("a.b", "a.b"));
        assert!(!wildcard_match("a.b", "axb"));
    }
}
