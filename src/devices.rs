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

use anyhow::{Result, bail};
use serde_json::Value;

use crate::client::ApiQuery;
use crate::validate::{is_valid_ipv4_address, is_valid_ipv6_address};

/// `seensince` value; seconds take precedence over days.
pub fn seen_since(days: u32, seconds: Option<u64>) -> String {
    match seconds {
        Some(seconds) => seconds.to_string(),
        None => format!("{days}days"),
    }
}

pub fn list_devices<A: ApiQuery + ?Sized>(api: &A, days: u32, seconds: Option<u64>) -> Result<Value> {
    api.get("/devices", &[("seensince", seen_since(days, seconds))])
}

pub fn device_info<A: ApiQuery + ?Sized>(api: &A, did: i64, full_device_details: bool) -> Result<Value> {
    api.get(
        "/deviceinfo",
        &[
            ("did", did.to_string()),
            ("fulldevicedetails", full_device_details.to_string()),
        ],
    )
}

pub fn device_by_ip<A: ApiQuery + ?Sized>(api: &A, ip: &str, days: u32) -> Result<Value> {
    if !is_valid_ipv4_address(ip) && !is_valid_ipv6_address(ip) {
        bail!("Invalid IP address: {ip}");
    }
    api.get(
        "/devices",
        &[("ip", ip.to_string()), ("seensince", seen_since(days, None))],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use serde_json::json;

    #[test]
    fn test_seconds_supersede_days() {
        assert_eq!(seen_since(3, None), "3days");
        assert_eq!(seen_since(3, Some(600)), "600");
    }

    #[test]
    fn test_queries_devices() {
        let api = FakeApi::new()
            .on("/devices", json!([{"did": 1}]))
            .on("/deviceinfo", json!({"did": 1}));

        list_devices(&api, 1, None).unwrap();
        device_info(&api, 42, true).unwrap();
        device_by_ip(&api, "10.0.0.1", 7).unwrap();

        let calls = api.calls.borrow();
        assert_eq!(calls[0], "/devices?seensince=1days");
        assert_eq!(calls[1], "/deviceinfo?did=42&fulldevicedetails=true");
        assert_eq!(calls[2], "/devices?ip=10.0.0.1&seensince=7days");
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        let api = FakeApi::new().on("/devices", json!([]));
        assert!(device_by_ip(&api, "10.0.0", 1).is_err());
        assert!(device_by_ip(&api, "fe80::1", 1).is_ok());
        assert_eq!(api.calls.borrow().len(), 1);
    }
}
