use std::{net, path, time};

use log::Level;
use structopt::StructOpt;

use bitcoin::{Address, Network};
use bitcoincore_rpc::Auth as RpcAuth;

use crate::error::{OptionExt, Result};
use crate::util::xpub::MasterPubKey;
use crate::util::Subnet;

#[derive(StructOpt, Debug)]
pub struct Config {
    #[structopt(
        short = "n",
        long,
        help = "One of 'bitcoin', 'testnet' or 'regtest'",
        default_value = "bitcoin",
        env,
        hide_env_values(true),
        display_order(1)
    )]
    pub network: Network,

    // cannot be set using an env var, it does not play nicely with from_occurrences
    #[structopt(
        short = "v",
        long,
        help = "Increase verbosity level (up to 4 times)",
        parse(from_occurrences),
        display_order(98)
    )]
    pub verbose: usize,

    #[structopt(
        short = "t",
        long,
        help = "Show timestamps in log messages",
        display_order(99)
    )]
    pub timestamp: bool,

    #[structopt(
        short = "m",
        long = "mpk",
        help = "Master public keys to serve (xpub/ypub/zpub, or a legacy electrum key; use <key>:<type> to override the script type)",
        env = "MASTER_PUBLIC_KEYS",
        hide_env_values(true),
        use_delimiter(true),
        display_order(20)
    )]
    pub master_public_keys: Vec<MasterPubKey>,

    #[structopt(
        short = "a",
        long = "address",
        help = "Individual watch-only addresses to serve",
        env = "WATCH_ONLY_ADDRESSES",
        hide_env_values(true),
        use_delimiter(true),
        display_order(21)
    )]
    pub watch_only_addresses: Vec<Address>,

    #[structopt(
        short = "w",
        long,
        help = "Specify the bitcoind wallet to use (optional)",
        env,
        hide_env_values(true),
        display_order(30)
    )]
    pub bitcoind_wallet: Option<String>,

    #[structopt(
        short = "d",
        long,
        help = "Path to bitcoind directory (used for cookie file) [default: ~/.bitcoin]",
        env,
        hide_env_values(true),
        display_order(31)
    )]
    pub bitcoind_dir: Option<path::PathBuf>,

    #[structopt(
        short = "u",
        long,
        help = "URL for the bitcoind RPC server [default: http://localhost:<network-rpc-port>]",
        env,
        hide_env_values(true),
        display_order(32)
    )]
    pub bitcoind_url: Option<String>,

    #[structopt(
        short = "c",
        long,
        help = "Credentials for accessing the bitcoind RPC server (as <username>:<password>, instead of reading the cookie file)",
        env,
        hide_env_values(true),
        display_order(33)
    )]
    pub bitcoind_cred: Option<String>,

    #[structopt(
        short = "C",
        long,
        help = "Cookie file for accessing the bitcoind RPC server [default: <bitcoind-dir>/.cookie]",
        env,
        hide_env_values(true),
        display_order(34)
    )]
    pub bitcoind_cookie: Option<path::PathBuf>,

    #[structopt(
        short = "g",
        long,
        help = "Gap limit for importing hd addresses",
        default_value = "20",
        env,
        hide_env_values(true),
        display_order(51)
    )]
    pub gap_limit: u32,

    #[structopt(
        short = "G",
        long,
        help = "Number of addresses per chain to import on the first run",
        default_value = "100",
        env,
        hide_env_values(true),
        display_order(52)
    )]
    pub initial_import_count: u32,

    #[structopt(
        short = "e",
        long,
        help = "Address to bind the electrum rpc server [default: '127.0.0.1:50002' for mainnet, '127.0.0.1:60002' for testnet or '127.0.0.1:60402' for regtest]",
        env,
        hide_env_values(true),
        display_order(40)
    )]
    pub electrum_rpc_addr: Option<net::SocketAddr>,

    #[structopt(
        long,
        help = "Networks allowed to connect, as CIDR entries ('*' allows everything) [default: loopback only]",
        env,
        hide_env_values(true),
        use_delimiter(true),
        display_order(41)
    )]
    pub ip_whitelist: Vec<String>,

    #[structopt(
        long,
        help = "PEM certificate (chain) presented to connecting wallets",
        env,
        hide_env_values(true),
        display_order(42)
    )]
    pub tls_cert: Option<path::PathBuf>,

    #[structopt(
        long,
        help = "PKCS#8 PEM key matching --tls-cert",
        env,
        hide_env_values(true),
        display_order(43)
    )]
    pub tls_key: Option<path::PathBuf>,

    #[structopt(
        short = "i",
        long,
        help = "Interval for the wallet poll while no client is connected (in seconds)",
        default_value = "30",
        parse(try_from_str = parse_duration),
        env, hide_env_values(true),
        display_order(90)
    )]
    pub poll_interval_listening: time::Duration,

    #[structopt(
        short = "I",
        long,
        help = "Interval for tip checks and the wallet poll while a client is connected (in seconds)",
        default_value = "5",
        parse(try_from_str = parse_duration),
        env, hide_env_values(true),
        display_order(91)
    )]
    pub poll_interval_connected: time::Duration,

    #[structopt(
        long,
        help = "Rescan the node's wallet from a block height or a DD/MM/YYYY date, then exit",
        env,
        hide_env_values(true),
        display_order(92)
    )]
    pub rescan: Option<String>,
}

impl Config {
    pub fn dotenv() {
        dirs::home_dir().map(|home| dotenv::from_path(home.join("eps.env")).ok());
    }

    pub fn bitcoind_url(&self) -> String {
        format!(
            "{}/{}",
            self.bitcoind_url.as_ref().map_or_else(
                || {
                    format!(
                        "http://localhost:{}",
                        match self.network {
                            Network::Bitcoin => 8332,
                            Network::Testnet => 18332,
                            Network::Regtest => 18443,
                            Network::Signet => 38332,
                        }
                    )
                },
                |url| url.trim_end_matches('/').into()
            ),
            match self.bitcoind_wallet {
                Some(ref wallet) => format!("wallet/{}", wallet),
                None => "".into(),
            }
        )
    }

    pub fn bitcoind_auth(&self) -> Result<RpcAuth> {
        Ok(self.bitcoind_cred
            .as_ref()
            .and_then(|cred| {
                let mut parts = cred.splitn(2, ':');
                Some(RpcAuth::UserPass(parts.next()?.into(), parts.next()?.into()))
            })
            .or_else(|| {
                let cookie = self.bitcoind_cookie.clone().or_else(|| get_cookie(self))?;
                Some(RpcAuth::CookieFile(cookie))
            })
            .or_err("no available authentication for bitcoind rpc, please specify credentials or a cookie file")?)
    }

    pub fn electrum_rpc_addr(&self) -> net::SocketAddr {
        self.electrum_rpc_addr.unwrap_or_else(|| {
            net::SocketAddr::new(
                "127.0.0.1".parse().unwrap(),
                match self.network {
                    Network::Bitcoin => 50002,
                    Network::Testnet | Network::Signet => 60002,
                    Network::Regtest => 60402,
                },
            )
        })
    }

    pub fn ip_whitelist(&self) -> Result<Vec<Subnet>> {
        if self.ip_whitelist.is_empty() {
            return Ok(vec!["127.0.0.1".parse()?, "::1".parse()?]);
        }
        let mut subnets = vec![];
        for entry in &self.ip_whitelist {
            if entry == "*" {
                // matches everything
                subnets.push("0.0.0.0/0".parse()?);
                subnets.push("::/0".parse()?);
            } else {
                subnets.push(entry.parse()?);
            }
        }
        Ok(subnets)
    }

    pub fn setup_logger(&self) {
        if self.timestamp {
            pretty_env_logger::formatted_timed_builder()
        } else {
            pretty_env_logger::formatted_builder()
        }
        .filter_module(
            "eps",
            match self.verbose {
                0 => Level::Info,
                1 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .filter_module(
            "bitcoincore_rpc",
            match self.verbose {
                0 | 1 => Level::Warn,
                2 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .filter_level(
            match self.verbose {
                0 | 1 => Level::Warn,
                2 | 3 => Level::Info,
                4 => Level::Debug,
                _ => Level::Trace,
            }
            .to_level_filter(),
        )
        .init();
    }
}

fn parse_duration(s: &str) -> Result<time::Duration> {
    Ok(time::Duration::from_secs(s.parse()?))
}

fn get_cookie(config: &Config) -> Option<path::PathBuf> {
    let mut dir = config
        .bitcoind_dir
        .clone()
        .or_else(|| Some(dirs::home_dir()?.join(".bitcoin")))?;
    match config.network {
        Network::Bitcoin => (),
        Network::Testnet => dir.push("testnet3"),
        Network::Regtest => dir.push("regtest"),
        Network::Signet => dir.push("signet"),
    }
    let cookie = dir.join(".cookie");
    if cookie.exists() {
        Some(cookie)
    } else {
        warn!("cookie file not found in {:?}", cookie);
        None
    }
}
