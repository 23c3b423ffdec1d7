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

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;

use crate::client::ApiQuery;
use crate::validate::{is_valid_domain, is_valid_ipv4_address};

#[derive(Debug, Error)]
#[error("Not a valid domain, hostname or ip address: {0}")]
pub struct InvalidEntry(pub String);

pub fn list_entries<A: ApiQuery + ?Sized>(api: &A, full_details: bool) -> Result<Value> {
    if full_details {
        api.get("/intelfeed", &[("fulldetails", "true".to_string())])
    } else {
        api.get("/intelfeed", &[])
    }
}

fn validate(entry: &str) -> Result<String, InvalidEntry> {
    let entry = entry.trim().to_lowercase();
    if is_valid_ipv4_address(&entry) || is_valid_domain(&entry) {
        Ok(entry)
    } else {
        Err(InvalidEntry(entry))
    }
}

/// The entry is sent both as form body and query so the signature covers it.
pub fn add_entry<A: ApiQuery + ?Sized>(api: &A, entry: &str) -> Result<Value> {
    let entry = validate(entry)?;
    let form = [("addentry", entry)];
    api.post("/intelfeed", &form, &form)
}

pub fn remove_entry<A: ApiQuery + ?Sized>(api: &A, entry: &str) -> Result<Value> {
    let entry = validate(entry)?;
    let form = [("removeentry", entry)];
    api.post("/intelfeed", &form, &form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use serde_json::json;

    #[test]
    fn test_validates_before_posting() {
        let api = FakeApi::new().on("/intelfeed", json!({"added": 1}));
        let err = add_entry(&api, "not valid").unwrap_err();
        assert!(err.to_string().starts_with("Not a valid domain"));
        assert!(api.posts.borrow().is_empty());

        add_entry(&api, "Evil.Example.com").unwrap();
        remove_entry(&api, "10.0.0.1").unwrap();
        let posts = api.posts.borrow();
        assert_eq!(posts[0].1, vec![("addentry".to_string(), "evil.example.com".to_string())]);
        assert_eq!(posts[1].1, vec![("removeentry".to_string(), "10.0.0.1".to_string())]);
        assert_eq!(api.calls.borrow()[0], "/intelfeed?addentry=evil.example.com");
    }

    #[test]
    fn test_lists_entries() {
        let api = FakeApi::new().on("/intelfeed", json!(["evil.example.com"]));
        assert_eq!(list_entries(&api, false).unwrap(), json!(["evil.example.com"]));
        list_entries(&api, true).unwrap();
        assert_eq!(api.calls.borrow()[1], "/intelfeed?fulldetails=true");
    }
}
