#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitcoin_hashes;

pub const EPS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[macro_use]
pub mod util;

pub mod electrum;
pub mod error;
pub mod hd;
pub mod headers;
pub mod merkle;
pub mod monitor;
pub mod types;

#[cfg(feature = "cli")]
pub mod app;
#[cfg(feature = "cli")]
pub mod config;

pub use electrum::ElectrumServer;
pub use error::{Error, Result};
pub use hd::{HDWallet, HDWatcher};
pub use headers::HeaderTracker;
pub use monitor::TransactionMonitor;

#[cfg(feature = "cli")]
pub use config::Config;
