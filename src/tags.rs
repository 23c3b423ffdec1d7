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

use crate::client::{ApiQuery, expect_array};
use crate::validate::wildcard_match;

pub fn list_tags<A: ApiQuery + ?Sized>(api: &A, tag: Option<&str>) -> Result<Value> {
    match tag {
        Some(tag) => api.get("/tags", &[("tag", tag.to_string())]),
        None => api.get("/tags", &[]),
    }
}

pub fn add_device_tag<A: ApiQuery + ?Sized>(api: &A, did: i64, tag: &str) -> Result<Value> {
    let form = [("did", did.to_string()), ("tag", tag.to_string())];
    api.post("/tags/entities", &form, &form)
}

pub fn delete_device_tag<A: ApiQuery + ?Sized>(api: &A, did: i64, tag: &str) -> Result<Value> {
    api.delete(
        "/tags/entities",
        &[("did", did.to_string()), ("tag", tag.to_string())],
    )
}

/// Tags whose name matches a shell-style pattern, ignoring case.
pub fn search_tags<A: ApiQuery + ?Sized>(api: &A, name_query: &str) -> Result<Vec<Value>> {
    let tags = expect_array(api.get("/tags", &[])?, "/tags")?;
    Ok(tags
        .into_iter()
        .filter(|tag| {
            tag.get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| wildcard_match(name_query, name))
        })
        .collect())
}

pub fn devices_tagged_with<A: ApiQuery + ?Sized>(api: &A, tag: &str) -> Result<Value> {
    api.get(
        "/tags/entities",
        &[("tag", tag.to_string()), ("fulldevicedetails", "false".to_string())],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use serde_json::json;

    fn api() -> FakeApi {
        FakeApi::new()
            .on(
                "/tags",
                json!([{"tid": 1, "name": "Admin"}, {"tid": 2, "name": "Guest Wifi"}, {"tid": 3}]),
            )
            .on("/tags/entities", json!({"result": "ok"}))
    }

    #[test]
    fn test_searches_tag_names() {
        let found = search_tags(&api(), "*WIFI").unwrap();
        assert_eq!(found, vec![json!({"tid": 2, "name": "Guest Wifi"})]);
        assert!(search_tags(&api(), "none*").unwrap().is_empty());
    }

    #[test]
    fn test_adds_and_deletes_device_tags() {
        let api = api();
        add_device_tag(&api, 12, "Admin").unwrap();
        delete_device_tag(&api, 12, "Admin").unwrap();
        devices_tagged_with(&api, "Admin").unwrap();
        list_tags(&api, Some("Admin")).unwrap();

        let posts = api.posts.borrow();
        assert_eq!(posts[0].0, "/tags/entities");
        assert_eq!(
            posts[0].1,
            vec![("did".to_string(), "12".to_string()), ("tag".to_string(), "Admin".to_string())]
        );
        let calls = api.calls.borrow();
        assert_eq!(calls[1], "/tags/entities?did=12&tag=Admin");
        assert_eq!(calls[2], "/tags/entities?tag=Admin&fulldevicedetails=false");
        assert_eq!(calls[3], "/tags?tag=Admin");
    }
}
