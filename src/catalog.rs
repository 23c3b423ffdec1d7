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

use crate::client::ApiQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catalog {
    Components,
    FilterTypes,
    Metrics,
}

impl Catalog {
    pub fn endpoint(self) -> &'static str {
        match self {
            Catalog::Components => "/components",
            Catalog::FilterTypes => "/filtertypes",
            Catalog::Metrics => "/metrics",
        }
    }
}

pub fn list<A: ApiQuery + ?Sized>(api: &A, catalog: Catalog) -> Result<Value> {
    api.get(catalog.endpoint(), &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use serde_json::json;

    #[test]
    fn test_fetches_each_catalog() {
        let api = FakeApi::new()
            .on("/components", json!([{"cid": 1}]))
            .on("/filtertypes", json!([{"filtertype": "Age"}]))
            .on("/metrics", json!([{"metric": "connections"}]));
        assert_eq!(list(&api, Catalog::Components).unwrap(), json!([{"cid": 1}]));
        list(&api, Catalog::FilterTypes).unwrap();
        list(&api, Catalog::Metrics).unwrap();
        assert_eq!(*api.calls.borrow(), ["/components", "/filtertypes", "/metrics"]);
    }
}
