use std::time::Duration as StdDuration;

use chrono::Duration;

use bitcoincore_rpc::{Client as RpcClient, RpcApi};

use crate::util::bitcoincore_ext::RpcApiExt;
use crate::Result;

pub const DONATION_ADDR: &str = "bc1q5d8l0w33h65e2l5x7ty6wgnvkvlqcz0wfaslpz";

/// The plain-text banner shown by Electrum's server info dialog.
pub fn get_welcome_banner(
    rpc: &RpcClient,
    num_wallets: usize,
    num_addresses: usize,
) -> Result<String> {
    let net_info = rpc.get_network_info()?;
    let chain_info = rpc.get_blockchain_info()?;
    let uptime = dur_from_secs(rpc.node_uptime()?);
    let net_totals = RpcApiExt::get_net_totals(rpc)?;

    Ok(format!(
        r#"Welcome to Electrum Personal Server {version}

Monitoring {num_wallets} deterministic wallets, in total {num_addresses} addresses.

Connected bitcoin node: {useragent}
Peers: {peers}
Uptime: {uptime}
Blocksonly: {blocksonly}
Pruning: {pruning}
Download: {recv_bytes}
Upload: {sent_bytes}

https://github.com/chris-belcher/electrum-personal-server

Donate to help make Electrum Personal Server even better:
{donation_addr}

"#,
        version = crate::EPS_VERSION,
        num_wallets = num_wallets,
        num_addresses = num_addresses,
        useragent = net_info.subversion,
        peers = net_info.connections,
        uptime = format_dur(&uptime),
        blocksonly = !net_info.local_relay,
        pruning = chain_info.pruned,
        recv_bytes = format_bytes(net_totals.total_bytes_recv),
        sent_bytes = format_bytes(net_totals.total_bytes_sent),
        donation_addr = DONATION_ADDR,
    ))
}

fn dur_from_secs(seconds: u64) -> Duration {
    Duration::from_std(StdDuration::from_secs(seconds)).unwrap_or_else(|_| Duration::max_value())
}

fn format_dur(dur: &Duration) -> String {
    let days = dur.num_days();
    let hours = dur.num_hours() % 24;
    let minutes = dur.num_minutes() % 60;
    let seconds = dur.num_seconds() % 60;
    if days > 0 {
        format!("{} days, {}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Human-readable byte count, binary units.
pub fn format_bytes(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in &["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"] {
        if num.abs() < 1024.0 {
            return format!("{:.1}{}B", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1}ZiB", num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.0B");
        assert_eq!(format_bytes(512), "512.0B");
        assert_eq!(format_bytes(1024), "1.0KiB");
        assert_eq!(format_bytes(1536), "1.5KiB");
        assert_eq!(format_bytes(1024 * 1024 * 3), "3.0MiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0GiB");
    }

    #[test]
    fn test_format_dur() {
        assert_eq!(format_dur(&Duration::seconds(59)), "0:00:59");
        assert_eq!(format_dur(&Duration::seconds(3661)), "1:01:01");
        assert_eq!(
            format_dur(&Duration::seconds(2 * 86400 + 3600 + 60 + 1)),
            "2 days, 1:01:01"
        );
    }
}
