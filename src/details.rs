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

//! Event details from `/details`.

use anyhow::{Result, bail};
use serde_json::Value;

use crate::client::ApiQuery;
use crate::timeutils::DateRange;
use crate::validate::{is_valid_domain, is_valid_hostname};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailsTarget {
    Device(i64),
    Host(String),
    Message(String),
    Breach(i64),
    Connection(String),
}

#[derive(Debug, Clone)]
pub struct DetailsQuery {
    pub target: DetailsTarget,
    pub event_type: String,
    pub count: u32,
    pub range: Option<DateRange>,
}

impl DetailsTarget {
    fn param(&self) -> Result<(&'static str, String)> {
        Ok(match self {
            DetailsTarget::Device(did) => ("did", did.to_string()),
            DetailsTarget::Host(host) => {
                let host = host.to_lowercase();
                if !is_valid_domain(&host) && !is_valid_hostname(&host) {
                    bail!("\"{host}\" is not a valid hostname");
                }
                ("externalhostname", host)
            }
            DetailsTarget::Message(msg) => ("msg", msg.clone()),
            DetailsTarget::Breach(pbid) => ("pbid", pbid.to_string()),
            DetailsTarget::Connection(uid) => ("uid", uid.clone()),
        })
    }
}

pub fn details<A: ApiQuery + ?Sized>(api: &A, query: &DetailsQuery) -> Result<Value> {
    let mut params = vec![
        query.target.param()?,
        ("eventtype", query.event_type.clone()),
        ("count", query.count.to_string()),
    ];
    if let Some(range) = &query.range {
        params.extend(range.query());
    }
    api.get("/details", &params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use crate::timeutils::determine_date_range;
    use chrono::NaiveDate;
    use serde_json::json;

    fn query(target: DetailsTarget) -> DetailsQuery {
        DetailsQuery {
            target,
            event_type: "connection".into(),
            count: 10,
            range: None,
        }
    }

    #[test]
    fn test_builds_target_parameters() {
        let api = FakeApi::new().on("/details", json!([]));
        details(&api, &query(DetailsTarget::Device(5))).unwrap();
        details(&api, &query(DetailsTarget::Host("WWW.Example.com".into()))).unwrap();

        let mut ranged = query(DetailsTarget::Breach(1001));
        ranged.range = Some(determine_date_range(
            0,
            None,
            None,
            NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
        )
        .unwrap());
        details(&api, &ranged).unwrap();

        let calls = api.calls.borrow();
        assert_eq!(calls[0], "/details?did=5&eventtype=connection&count=10");
        assert_eq!(calls[1], "/details?externalhostname=www.example.com&eventtype=connection&count=10");
        assert_eq!(
            calls[2],
            "/details?pbid=1001&eventtype=connection&count=10&starttime=0&endtime=86399000"
        );
    }

    #[test]
    fn test_rejects_invalid_hostnames() {
        let api = FakeApi::new().on("/details", json!([]));
        let err = details(&api, &query(DetailsTarget::Host("not a host!".into()))).unwrap_err();
        assert!(err.to_string().contains("is not a valid hostname"));
        assert!(api.calls.borrow().is_empty());
    }
}
