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

//! Subnet views built from `/subnets` and the per-instance status data.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::client::{ApiQuery, expect_array};
use crate::system::fetch_instances;
use crate::timeutils::utc_now_timestamp;
use crate::validate::is_valid_ipv4_network;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceStatus {
    #[serde(default)]
    error: Value,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    subnet_data: Vec<SubnetStatus>,
    #[serde(default)]
    recent_unidirectional_connections: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubnetStatus {
    #[serde(default)]
    sid: Option<i64>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    devices: Option<i64>,
    #[serde(default)]
    client_devices: Option<i64>,
    #[serde(default, rename = "mostRecentDHCP")]
    most_recent_dhcp: Option<String>,
    #[serde(default)]
    dhcp_quality: Option<f64>,
    #[serde(default)]
    recent_unidirectional_traffic_percent: Option<f64>,
}

impl InstanceStatus {
    fn failed(&self) -> bool {
        self.error == Value::Bool(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounts {
    pub clients: i64,
    pub servers: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DhcpStats {
    pub system: String,
    pub timestamp: String,
    pub subnets_not_registered: u64,
    pub subnets_seen: u64,
    pub subnets_with_dhcp_disabled: u64,
    pub subnets_without_clients: u64,
    pub subnets_failing_dhcp: u64,
    pub subnets_tracking_dhcp: u64,
    pub total_dhcp_quality: i64,
    pub average_dhcp_quality: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnidirectionalStats {
    pub master_recorded: Value,
    pub total_seen_subnets: usize,
    #[serde(rename = "0_to_10%")]
    pub up_to_10: u64,
    #[serde(rename = "10_to_40%")]
    pub up_to_40: u64,
    #[serde(rename = "40_to_70%")]
    pub up_to_70: u64,
    #[serde(rename = "70_to_100%")]
    pub up_to_100: u64,
}

fn parse_instances<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<(String, InstanceStatus)>> {
    fetch_instances(api)?
        .into_iter()
        .map(|(name, values)| {
            let status = serde_json::from_value(values)
                .with_context(|| format!("parsing status of instance {name}"))?;
            Ok((name, status))
        })
        .collect()
}

fn subnet_networks<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<Value>> {
    expect_array(api.get("/subnets", &[])?, "/subnets")
}

/// Distinct IPv4 networks, sorted. Entries with host bits set are skipped.
pub fn list_subnets<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<String>> {
    let networks: BTreeSet<Ipv4Net> = subnet_networks(api)?
        .iter()
        .filter_map(|subnet| subnet.get("network").and_then(Value::as_str))
        .filter_map(|network| network.parse::<Ipv4Net>().ok())
        .filter(|network| network.trunc() == *network)
        .collect();
    Ok(networks.iter().map(Ipv4Net::to_string).collect())
}

/// CIDR-merged IPv4 networks.
pub fn aggregates<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<String>> {
    let networks: Vec<Ipv4Net> = subnet_networks(api)?
        .iter()
        .filter_map(|subnet| subnet.get("network").and_then(Value::as_str))
        .filter(|network| is_valid_ipv4_network(network))
        .filter_map(|network| network.parse::<Ipv4Net>().ok())
        .collect();
    debug!(networks = networks.len(), "aggregating subnets");
    Ok(Ipv4Net::aggregate(&networks)
        .iter()
        .map(Ipv4Net::to_string)
        .collect())
}

/// IPv4 networks seen by each instance.
pub fn subnets_per_instance<A: ApiQuery + ?Sized>(api: &A) -> Result<Map<String, Value>> {
    Ok(parse_instances(api)?
        .into_iter()
        .map(|(name, status)| {
            let networks: Vec<Value> = status
                .subnet_data
                .iter()
                .filter_map(|subnet| subnet.network.as_deref())
                .filter(|network| is_valid_ipv4_network(network))
                .map(Value::from)
                .collect();
            (name, Value::Array(networks))
        })
        .collect())
}

/// Server and client device counts summed over all subnets.
pub fn device_counts<A: ApiQuery + ?Sized>(api: &A) -> Result<DeviceCounts> {
    let mut counts = DeviceCounts::default();
    for (_, status) in parse_instances(api)? {
        if status.failed() {
            continue;
        }
        for subnet in &status.subnet_data {
            if let Some(devices) = subnet.devices {
                counts.servers += devices;
                counts.total += devices;
            }
            if let Some(clients) = subnet.client_devices {
                counts.clients += clients;
                counts.total += clients;
            }
        }
    }
    Ok(counts)
}

pub fn dhcp_stats<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<DhcpStats>> {
    dhcp_stats_at(api, &utc_now_timestamp())
}

fn dhcp_stats_at<A: ApiQuery + ?Sized>(api: &A, timestamp: &str) -> Result<Vec<DhcpStats>> {
    let instances = parse_instances(api)?;
    let dhcp_by_sid: HashMap<i64, bool> = subnet_networks(api)?
        .iter()
        .filter_map(|subnet| {
            let sid = subnet.get("sid")?.as_i64()?;
            let dhcp = subnet.get("dhcp").and_then(Value::as_bool).unwrap_or(false);
            Some((sid, dhcp))
        })
        .collect();

    let mut stats = Vec::new();
    for (name, status) in instances {
        if status.failed() {
            continue;
        }
        let mut record = DhcpStats {
            system: status.hostname.clone().unwrap_or(name),
            timestamp: timestamp.to_string(),
            subnets_seen: status.subnet_data.len() as u64,
            ..Default::default()
        };

        for subnet in &status.subnet_data {
            let Some(dhcp) = subnet.sid.and_then(|sid| dhcp_by_sid.get(&sid)) else {
                record.subnets_not_registered += 1;
                continue;
            };
            if !dhcp {
                record.subnets_with_dhcp_disabled += 1;
                continue;
            }
            if subnet.most_recent_dhcp.as_deref() == Some("Never")
                && subnet.client_devices == Some(0)
            {
                record.subnets_without_clients += 1;
                continue;
            }
            match subnet.dhcp_quality {
                Some(quality) => {
                    record.subnets_tracking_dhcp += 1;
                    record.total_dhcp_quality += quality as i64;
                }
                None => record.subnets_failing_dhcp += 1,
            }
        }

        record.average_dhcp_quality =
            average_quality(record.total_dhcp_quality, record.subnets_tracking_dhcp);
        stats.push(record);
    }
    Ok(stats)
}

/// Mean quality, halves rounded to even. Zero when nothing is tracked.
fn average_quality(total: i64, tracked: u64) -> i64 {
    if tracked == 0 {
        return 0;
    }
    (total as f64 / tracked as f64).round_ties_even() as i64
}

/// Subnets bucketed by their recent unidirectional traffic percentage.
pub fn unidirectional<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<(String, UnidirectionalStats)>> {
    let mut traffic = Vec::new();
    for (name, status) in parse_instances(api)? {
        if status.failed() {
            continue;
        }
        let mut stats = UnidirectionalStats {
            master_recorded: status.recent_unidirectional_connections.clone(),
            total_seen_subnets: status.subnet_data.len(),
            ..Default::default()
        };
        for percent in status
            .subnet_data
            .iter()
            .filter_map(|subnet| subnet.recent_unidirectional_traffic_percent)
        {
            match percent.trunc() as i64 {
                1..=9 => stats.up_to_10 += 1,
                10..=39 => stats.up_to_40 += 1,
                40..=69 => stats.up_to_70 += 1,
                p if p >= 70 => stats.up_to_100 += 1,
                _ => {}
            }
        }
        traffic.push((name, stats));
    }
    Ok(traffic)
}
