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

//! In-memory `ApiQuery` for unit tests.

use crate::client::ApiQuery;
use anyhow::{Result, bail};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Default)]
pub struct FakeApi {
    responses: HashMap<String, Value>,
    pub calls: RefCell<Vec<String>>,
    pub posts: RefCell<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `endpoint` regardless of the query string.
    pub fn on(mut self, endpoint: &str, response: Value) -> Self {
        self.responses.insert(endpoint.to_string(), response);
        self
    }

    /// Answers only the exact `endpoint?k=v&...` combination.
    pub fn on_query(mut self, endpoint: &str, query: &[(&str, &str)], response: Value) -> Self {
        let owned: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.to_string())).collect();
        self.responses.insert(key(endpoint, &owned), response);
        self
    }

    fn answer(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        let full = key(endpoint, query);
        self.calls.borrow_mut().push(full.clone());
        match self
            .responses
            .get(&full)
            .or_else(|| self.responses.get(endpoint))
        {
            Some(value) => Ok(value.clone()),
            None => bail!("no canned response for {full}"),
        }
    }
}

fn key(endpoint: &str, query: &[(&str, String)]) -> String {
    if query.is_empty() {
        return endpoint.to_string();
    }
    let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{endpoint}?{}", pairs.join("&"))
}

impl ApiQuery for FakeApi {
    fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        self.answer(endpoint, query)
    }

    fn post(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
        query: &[(&str, String)],
    ) -> Result<Value> {
        self.posts.borrow_mut().push((
            endpoint.to_string(),
            form.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        ));
        self.answer(endpoint, query)
    }

    fn delete(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        self.answer(endpoint, query)
    }
}
