use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::Txid;
use serde_json::Value;

use crate::error::{Context, Error, OptionExt, Result};

#[macro_use]
mod macros;

pub mod banner;
pub mod bitcoincore_ext;
pub mod xpub;

lazy_static! {
    pub static ref EC: Secp256k1<secp256k1::VerifyOnly> = Secp256k1::verification_only();
}

const HISTOGRAM_BIN_CAP: f64 = 100_000.0; // vbytes

/// Make the fee histogram out of a map of `getrawmempool true` entries.
///
/// Bins are filled sweeping the fee rates in descending order; every bin
/// grows 10% over the previous one and oversized bins carry their excess
/// forward, so small mempools produce few (or zero) bins.
pub fn make_fee_histogram(mempool_entries: HashMap<Txid, Value>) -> Vec<(u64, u64)> {
    let mut fee_hist: HashMap<u64, u64> = HashMap::new();
    for entry in mempool_entries.values() {
        let size = entry["vsize"].as_u64().or_else(|| entry["size"].as_u64());
        let fee = entry["fee"]
            .as_f64()
            .or_else(|| entry["fees"]["base"].as_f64());
        let (size, fee) = match (size, fee) {
            (Some(size), Some(fee)) if size > 0 => (size, fee),
            _ => continue,
        };
        let fee_rate = (1e8 * fee / size as f64).floor() as u64;
        *fee_hist.entry(fee_rate).or_insert(0) += size;
    }

    let mut entries = fee_hist.into_iter().collect::<Vec<(u64, u64)>>();
    entries.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    let mut histogram = vec![];
    let mut bin_cap = HISTOGRAM_BIN_CAP;
    let mut carry = 0f64;
    let mut bin_size = 0u64;

    for (fee_rate, size) in entries {
        bin_size += size;
        if bin_size as f64 + carry > bin_cap {
            histogram.push((fee_rate, bin_size));
            carry += bin_size as f64 - bin_cap;
            bin_size = 0;
            bin_cap *= 1.1;
        }
    }
    histogram
}

/// A CIDR network used for the wallet connection allow-list.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Subnet {
    addr: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        // unwrap v4-mapped addresses handed out by dual-stack listeners
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4().map_or(*ip, IpAddr::V4),
            IpAddr::V4(_) => *ip,
        };
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Subnet> {
        let mut parts = s.splitn(2, '/');
        let addr: IpAddr = parts
            .next()
            .req()?
            .parse()
            .with_context(|| format!("invalid network address {}", s))?;
        let max_prefix = iif!(addr.is_ipv4(), 32, 128);
        let prefix_len = match parts.next() {
            Some(prefix) => prefix
                .parse()
                .with_context(|| format!("invalid network prefix {}", s))?,
            None => max_prefix,
        };
        ensure!(prefix_len <= max_prefix, "network prefix too long: {}", s);
        Ok(Subnet { addr, prefix_len })
    }
}

impl_string_serializer!(
    Subnet,
    subnet,
    format!("{}/{}", subnet.addr, subnet.prefix_len)
);
impl_debug_display!(Subnet);

fn prefix_mask_v4(prefix_len: u8) -> u32 {
    iif!(prefix_len == 0, 0, !0u32 << (32 - prefix_len as u32))
}

fn prefix_mask_v6(prefix_len: u8) -> u128 {
    iif!(prefix_len == 0, 0, !0u128 << (128 - prefix_len as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin_hashes::Hash;

    fn mempool_tx(n: u8, fee_btc: f64, vsize: u64) -> (Txid, Value) {
        let txid = Txid::hash(&[n]);
        (txid, json!({ "vsize": vsize, "fee": fee_btc }))
    }

    #[test]
    fn test_histogram_small_mempool_has_no_bins() {
        // both txs together stay under the first bin cap
        let entries = vec![mempool_tx(1, 0.0001, 250), mempool_tx(2, 0.00005, 200)]
            .into_iter()
            .collect();
        assert_eq!(make_fee_histogram(entries), vec![]);
    }

    #[test]
    fn test_histogram_bins_are_monotone() {
        let entries = (0u8..60)
            .map(|n| mempool_tx(n, 0.0001 * (n as f64 + 1.0), 20_000))
            .collect();
        let histogram = make_fee_histogram(entries);
        assert!(!histogram.is_empty());
        for pair in histogram.windows(2) {
            assert!(pair[0].0 > pair[1].0);
        }
    }

    #[test]
    fn test_histogram_rate_is_floored_sat_per_vbyte() {
        // a single huge tx so the first bin overflows immediately
        let entries = vec![(Txid::hash(&[9]), json!({ "size": 150_000, "fee": 0.0075 }))]
            .into_iter()
            .collect();
        // 0.0075 BTC over 150000 vb = 5 sat/vb
        assert_eq!(make_fee_histogram(entries), vec![(5, 150_000)]);
    }

    #[test]
    fn test_subnet_matching() {
        let lan: Subnet = "192.168.1.0/24".parse().unwrap();
        assert!(lan.contains(&"192.168.1.42".parse().unwrap()));
        assert!(!lan.contains(&"192.168.2.42".parse().unwrap()));
        assert!(!lan.contains(&"::1".parse().unwrap()));

        let localhost: Subnet = "127.0.0.1".parse().unwrap();
        assert!(localhost.contains(&"127.0.0.1".parse().unwrap()));
        assert!(!localhost.contains(&"127.0.0.2".parse().unwrap()));

        let any: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(&"8.8.8.8".parse().unwrap()));
        // v4-mapped peers still match v4 networks
        assert!(any.contains(&"::ffff:8.8.8.8".parse().unwrap()));

        let any6: Subnet = "::/0".parse().unwrap();
        assert!(any6.contains(&"2001:db8::1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("not-a-network".parse::<Subnet>().is_err());
    }
}
