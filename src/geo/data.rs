//! Geo-Lookup Engine data structures and longest-prefix lookup (spec §4.6).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoRow {
    pub network: String,
    pub asn: String,
    pub organization: String,
    pub country: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrecomputedNetwork {
    network_int: u128,
    prefix_len: u8,
    is_ipv4: bool,
    row: GeoRow,
}

impl PrecomputedNetwork {
    fn contains(&self, ip_int: u128, is_ipv4: bool) -> bool {
        if self.is_ipv4 != is_ipv4 {
            return false;
        }
        let width: u32 = if self.is_ipv4 { 32 } else { 128 };
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u128::MAX << (width - self.prefix_len as u32)
        };
        (ip_int & mask) == (self.network_int & mask)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeoDataset {
    ipv4_networks: Vec<PrecomputedNetwork>,
    ipv6_networks: Vec<PrecomputedNetwork>,
    ipv4_octet_ranges: HashMap<u8, (usize, usize)>,
    ipv6_block_ranges: HashMap<u16, (usize, usize)>,
    asn_index: HashMap<String, Vec<String>>,
    pub schema_version: String,
}

pub const SCHEMA_VERSION: &str = "1";

pub struct LookupResult {
    pub row: GeoRow,
    pub prefix_len: u8,
}

impl GeoDataset {
    pub fn from_csv(path: &Path) -> anyhow::Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();
        let mut asn_index: HashMap<String, Vec<String>> = HashMap::new();

        for record in reader.deserialize::<GeoRow>() {
            let row = match record {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!("skipping malformed geo CSV row: {e}");
                    continue;
                }
            };
            let Some((network_int, prefix_len, is_ipv4)) = parse_network(&row.network) else {
                tracing::warn!(network = %row.network, "skipping unparsable network");
                continue;
            };
            asn_index.entry(row.asn.clone()).or_default().push(row.network.clone());
            let entry = PrecomputedNetwork {
                network_int,
                prefix_len,
                is_ipv4,
                row,
            };
            if is_ipv4 {
                ipv4.push(entry);
            } else {
                ipv6.push(entry);
            }
        }

        ipv4.sort_by_key(|n| (n.network_int as u32 >> 24, n.network_int, std::cmp::Reverse(n.prefix_len)));
        ipv6.sort_by_key(|n| (n.network_int >> 112, n.network_int, std::cmp::Reverse(n.prefix_len)));

        let ipv4_octet_ranges = partition_ranges(&ipv4, |n| (n.network_int as u32 >> 24) as u8);
        let ipv6_block_ranges = partition_ranges(&ipv6, |n| (n.network_int >> 112) as u16);

        Ok(Self {
            ipv4_networks: ipv4,
            ipv6_networks: ipv6,
            ipv4_octet_ranges,
            ipv6_block_ranges,
            asn_index,
            schema_version: SCHEMA_VERSION.to_string(),
        })
    }

    pub fn row_count(&self) -> usize {
        self.ipv4_networks.len() + self.ipv6_networks.len()
    }

    pub fn asn_count(&self) -> usize {
        self.asn_index.len()
    }

    pub fn asn_networks(&self, asn: &str) -> Vec<String> {
        self.asn_index.get(asn).cloned().unwrap_or_default()
    }

    /// Longest-prefix match (spec §4.6 step 3): binary-search the
    /// partition for the rightmost `network_int <= ip_int`, then walk
    /// backwards keeping the containing entry with the greatest
    /// `prefix_len`.
    pub fn lookup(&self, ip: IpAddr) -> Option<LookupResult> {
        let (ip_int, is_ipv4) = ip_to_int(ip);
        let (slice, range) = if is_ipv4 {
            let octet = (ip_int as u32 >> 24) as u8;
            match self.ipv4_octet_ranges.get(&octet) {
                Some(&(start, end)) => (&self.ipv4_networks[start..end], start),
                None => return None,
            }
        } else {
            let block = (ip_int >> 112) as u16;
            match self.ipv6_block_ranges.get(&block) {
                Some(&(start, end)) => (&self.ipv6_networks[start..end], start),
                None => return None,
            }
        };
        let _ = range;

        let idx = slice.partition_point(|n| n.network_int <= ip_int);
        let mut best: Option<&PrecomputedNetwork> = None;
        for entry in slice[..idx].iter().rev() {
            if entry.contains(ip_int, is_ipv4) {
                if best.map(|b| entry.prefix_len > b.prefix_len).unwrap_or(true) {
                    best = Some(entry);
                }
            }
        }
        best.map(|entry| LookupResult {
            row: entry.row.clone(),
            prefix_len: entry.prefix_len,
        })
    }
}

fn partition_ranges<K: Eq + std::hash::Hash + Copy>(
    entries: &[PrecomputedNetwork],
    key_of: impl Fn(&PrecomputedNetwork) -> K,
) -> HashMap<K, (usize, usize)> {
    let mut ranges = HashMap::new();
    let mut current: Option<K> = None;
    let mut start = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let key = key_of(entry);
        match current {
            None => {
                current = Some(key);
                start = i;
            }
            Some(c) if c == key => {}
            Some(c) => {
                ranges.insert(c, (start, i));
                current = Some(key);
                start = i;
            }
        }
    }
    if let Some(c) = current {
        ranges.insert(c, (start, entries.len()));
    }
    ranges
}

fn parse_network(s: &str) -> Option<(u128, u8, bool)> {
    let net: ipnetwork::IpNetwork = s.trim().parse().ok()?;
    match net {
        ipnetwork::IpNetwork::V4(v4) => Some((u32::from(v4.network()) as u128, v4.prefix(), true)),
        ipnetwork::IpNetwork::V6(v6) => Some((u128::from(v6.network()), v6.prefix(), false)),
    }
}

fn ip_to_int(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, true),
        IpAddr::V6(v6) => (u128::from(v6), false),
    }
}

#[allow(dead_code)]
fn int_to_ipv4(i: u32) -> Ipv4Addr {
    Ipv4Addr::from(i)
}
#[allow(dead_code)]
fn int_to_ipv6(i: u128) -> Ipv6Addr {
    Ipv6Addr::from(i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dataset_with_rows(rows: &[(&str, &str, &str, &str)]) -> GeoDataset {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network,asn,organization,country").unwrap();
        for (network, asn, org, country) in rows {
            writeln!(file, "{network},{asn},{org},{country}").unwrap();
        }
        GeoDataset::from_csv(file.path()).unwrap()
    }

    #[test]
    fn longest_prefix_wins_over_broader_network() {
        let dataset = dataset_with_rows(&[
            ("10.0.0.0/8", "AS1", "Org1", "US"),
            ("10.1.0.0/16", "AS2", "Org2", "CA"),
        ]);
        let hit = dataset.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit.row.organization, "Org2");
        assert_eq!(hit.row.country, "CA");

        let hit2 = dataset.lookup("10.2.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit2.row.organization, "Org1");

        assert!(dataset.lookup("192.0.2.1".parse().unwrap()).is_none());
    }

    #[test]
    fn asn_reverse_index() {
        let dataset = dataset_with_rows(&[("10.0.0.0/8", "AS1", "Org1", "US")]);
        assert_eq!(dataset.asn_networks("AS1"), vec!["10.0.0.0/8".to_string()]);
    }
}
