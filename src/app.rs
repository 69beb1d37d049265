use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitcoin::{Address, BlockHash, Script};
use bitcoincore_rpc::{Client as RpcClient, RpcApi};

use crate::config::Config;
use crate::electrum::{ElectrumServer, ServerOptions};
use crate::error::{Context, OptionExt, Result};
use crate::hd::{self, HDWallet, HDWatcher, KeyOrigin, ADDRESSES_LABEL};
use crate::headers::{search_height_for_date, HeaderTracker};
use crate::monitor::TransactionMonitor;
use crate::util::bitcoincore_ext::RpcApiExt;

const NODE_RETRY_INTERVAL: Duration = Duration::from_secs(5);
// addresses shown per chain at startup, and probed to detect missing imports
const TEST_ADDR_COUNT: u32 = 3;

/// Wire everything together and run until the shutdown flag is raised.
pub fn run(config: Config, shutdown: Arc<AtomicBool>) -> Result<()> {
    let rpc = Arc::new(
        RpcClient::new(&config.bitcoind_url(), config.bitcoind_auth()?)
            .context("failed setting up the bitcoind rpc client")?,
    );

    if let Some(rescan_target) = &config.rescan {
        return rescan(&rpc, rescan_target);
    }

    let tip = match wait_for_node(&rpc, &shutdown)? {
        Some(tip) => tip,
        None => return Ok(()), // interrupted while waiting
    };

    // a node built with --disable-wallet cannot serve us
    rpc.list_unspent(Some(0), Some(0), None, None, None)
        .context("wallet RPC calls unavailable, was the node built with the disable wallet flag?")?;

    ensure!(
        !config.master_public_keys.is_empty() || !config.watch_only_addresses.is_empty(),
        "no master public keys or watch-only addresses configured, nothing to serve"
    );

    let imported: HashSet<String> = rpc
        .get_addresses_by_label(ADDRESSES_LABEL)?
        .into_iter()
        .map(|(address, _)| address)
        .collect();
    debug!("{} addresses already imported", imported.len());

    let mut wallets = HDWallet::from_mpks(
        &config.master_public_keys,
        config.network,
        config.gap_limit,
        config.initial_import_count,
    )?;

    // log the first addresses of every chain so users can sanity-check their
    // keys, and probe them to detect wallets that were never imported
    let mut import_reqs = vec![];
    for wallet in &mut wallets {
        let first_entries = wallet.get_scriptpubkeys(0, TEST_ADDR_COUNT)?;
        let first_addrs: Vec<String> = first_entries
            .iter()
            .map(|(_, address, _)| address.to_string())
            .collect();
        info!("{} => {}", wallet.fingerprint(), first_addrs.join(" "));

        if !first_addrs.iter().all(|addr| imported.contains(addr)) {
            import_reqs.extend(wallet.get_scriptpubkeys(0, config.initial_import_count)?);
        }
    }

    let watch_only: Vec<(Script, Address, KeyOrigin)> = config
        .watch_only_addresses
        .iter()
        .map(|address| {
            (
                address.script_pubkey(),
                address.clone(),
                KeyOrigin::Standalone,
            )
        })
        .collect();
    import_reqs.extend(
        watch_only
            .iter()
            .filter(|(_, address, _)| !imported.contains(&address.to_string()))
            .cloned(),
    );

    if !import_reqs.is_empty() {
        info!(
            "importing {} addresses into the bitcoin node",
            import_reqs.len()
        );
        hd::import_addresses(&rpc, &import_reqs)?;
        info!(
            "Done. If recovering a wallet which already has existing transactions, \
             run again with --rescan. If you're confident that the wallets are new \
             and empty there's no need to rescan, just restart this server."
        );
        return Ok(());
    }

    // find which index each already-imported chain is up to
    let mut spks_to_monitor = watch_only;
    for wallet in &mut wallets {
        spks_to_monitor.extend(wallet.get_scriptpubkeys(0, config.initial_import_count)?);
        wallet.note_imported(config.initial_import_count - 1);

        // advance past addresses imported by previous runs' gap extensions
        loop {
            let entry = wallet.next_entry()?;
            if !imported.contains(&entry.1.to_string()) {
                wallet.rewind_one();
                break;
            }
            if let KeyOrigin::Derived(_, index) = entry.2 {
                wallet.note_imported(index);
            }
            spks_to_monitor.push(entry);
        }
    }

    let num_wallets = config.master_public_keys.len();
    let mut monitor = TransactionMonitor::new(Arc::clone(&rpc), HDWatcher::new(wallets));
    monitor.build_address_history(spks_to_monitor)?;

    let mut headers = HeaderTracker::new(Arc::clone(&rpc));
    headers.prime(tip);

    let options = ServerOptions {
        bind_addr: config.electrum_rpc_addr(),
        ip_whitelist: config.ip_whitelist()?,
        poll_interval_listening: config.poll_interval_listening,
        poll_interval_connected: config.poll_interval_connected,
        certfile: config
            .tls_cert
            .clone()
            .or_err("--tls-cert is required to serve wallets")?,
        keyfile: config
            .tls_key
            .clone()
            .or_err("--tls-key is required to serve wallets")?,
    };

    ElectrumServer::new(rpc, monitor, headers, num_wallets, options)?.run(shutdown)
}

/// Wait for the node to answer `getbestblockhash`, retrying forever and
/// logging the failure once. Returns None if interrupted.
fn wait_for_node(rpc: &RpcClient, shutdown: &AtomicBool) -> Result<Option<BlockHash>> {
    let mut printed_error_msg = false;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match rpc.get_best_block_hash() {
            Ok(tip) => return Ok(Some(tip)),
            Err(e) => {
                if !printed_error_msg {
                    error!(
                        "error with bitcoin json-rpc: {} (retrying every {}s)",
                        e,
                        NODE_RETRY_INTERVAL.as_secs()
                    );
                    printed_error_msg = true;
                }
                thread::sleep(NODE_RETRY_INTERVAL);
            }
        }
    }
}

/// The offline rescan helper: resolve a height or a DD/MM/YYYY date and hand
/// it to `rescanblockchain`.
fn rescan(rpc: &RpcClient, target: &str) -> Result<()> {
    let height = match target.parse::<u32>() {
        Ok(height) => height,
        Err(_) => {
            let found = search_height_for_date(rpc, target)?;
            // go back two weeks for safety
            found.saturating_sub(2016)
        }
    };
    info!(
        "rescanning from height {}, for a progress indicator see the bitcoin node's debug.log",
        height
    );
    rpc.rescan_blockchain_from(height as u64)?;
    info!("rescan done");
    Ok(())
}
