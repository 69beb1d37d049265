use std::collections::HashMap;

use serde_json::Value;

use bitcoin::util::bip32::Fingerprint;
use bitcoin::{Address, Network, Script};
use bitcoincore_rpc::{Client as RpcClient, RpcApi};

use crate::error::{Context, Result};
use crate::types::ScriptType;
use crate::util::xpub::MasterPubKey;

/// The wallet label all imported addresses are filed under.
pub const ADDRESSES_LABEL: &str = "electrum-watchonly-addresses";

#[derive(Debug)]
pub struct HDWatcher {
    wallets: HashMap<Fingerprint, HDWallet>,
}

impl HDWatcher {
    pub fn new(wallets: Vec<HDWallet>) -> Self {
        HDWatcher {
            wallets: wallets
                .into_iter()
                .map(|wallet| (wallet.fingerprint, wallet))
                .collect(),
        }
    }

    pub fn wallets(&self) -> &HashMap<Fingerprint, HDWallet> {
        &self.wallets
    }

    /// Mark a derived address as imported and used
    pub fn mark_funded(&mut self, origin: &KeyOrigin) {
        if let KeyOrigin::Derived(fingerprint, index) = origin {
            if let Some(wallet) = self.wallets.get_mut(fingerprint) {
                if wallet.max_imported_index.map_or(true, |max| *index > max) {
                    wallet.max_imported_index = Some(*index);
                }

                if wallet.max_used_index.map_or(true, |max| *index > max) {
                    wallet.max_used_index = Some(*index);
                }
            }
        }
    }

    /// Derive and import everything between the last imported index and the
    /// current gap-limit boundary. Returns the newly tracked scripts so the
    /// caller can add them to its monitored set.
    pub fn watch(&mut self, rpc: &RpcClient) -> Result<Vec<(Script, Address, KeyOrigin)>> {
        let mut import_reqs = vec![];
        let mut pending_updates = vec![];

        for (_, wallet) in self.wallets.iter_mut() {
            let watch_index = wallet.watch_index();
            if watch_index > wallet.max_imported_index.unwrap_or(0) {
                let start_index = wallet
                    .max_imported_index
                    .map_or(0, |max_imported| max_imported + 1);

                debug!(
                    "importing range {}-{} of {} change={}",
                    start_index, watch_index, wallet.master, wallet.change,
                );

                import_reqs.append(&mut wallet.make_imports(start_index, watch_index)?);
                pending_updates.push((wallet, watch_index));
            } else if !wallet.done_initial_import {
                debug!(
                    "done initial import for {} change={} (up to index {:?})",
                    wallet.master,
                    wallet.change,
                    wallet.max_imported_index.unwrap_or(0)
                );
                wallet.done_initial_import = true;
            }
        }

        if !import_reqs.is_empty() {
            info!("registering {} derived addresses with the node", import_reqs.len());
            import_addresses(rpc, &import_reqs)?;
        }

        for (wallet, watched_index) in pending_updates {
            debug!(
                "imported {} change={} up to index {}",
                wallet.master, wallet.change, watched_index
            );
            wallet.max_imported_index = Some(watched_index);
        }

        Ok(import_reqs)
    }
}

/// A single derivation chain (external or change) of a master public key,
/// with the cursors needed for gap-limit handling.
#[derive(Debug)]
pub struct HDWallet {
    master: MasterPubKey,
    change: u32,
    fingerprint: Fingerprint,
    network: Network,
    script_type: ScriptType,
    gap_limit: u32,
    initial_import_count: u32,

    done_initial_import: bool,
    max_used_index: Option<u32>,
    max_imported_index: Option<u32>,
    next_cursor: u32,
}

impl HDWallet {
    pub fn new(
        master: MasterPubKey,
        change: u32,
        network: Network,
        gap_limit: u32,
        initial_import_count: u32,
    ) -> Result<Self> {
        let fingerprint = master.chain_fingerprint(change)?;
        let script_type = master.script_type;
        Ok(Self {
            master,
            change,
            fingerprint,
            network,
            script_type,
            gap_limit,
            // the first import must cover at least one full gap window
            initial_import_count: initial_import_count.max(gap_limit),
            done_initial_import: false,
            max_used_index: None,
            max_imported_index: None,
            next_cursor: 0,
        })
    }

    /// One wallet per chain: external (receive) and internal (change).
    pub fn from_mpk(
        mpk: MasterPubKey,
        network: Network,
        gap_limit: u32,
        initial_import_count: u32,
    ) -> Result<Vec<Self>> {
        ensure!(
            mpk.matches_network(network),
            "master public key {} does not match the {} network",
            mpk,
            network
        );
        Ok(vec![
            Self::new(mpk.clone(), 0, network, gap_limit, initial_import_count)?,
            Self::new(mpk, 1, network, gap_limit, initial_import_count)?,
        ])
    }

    pub fn from_mpks(
        mpks: &[MasterPubKey],
        network: Network,
        gap_limit: u32,
        initial_import_count: u32,
    ) -> Result<Vec<Self>> {
        let mut wallets = vec![];
        for mpk in mpks {
            wallets.append(
                &mut Self::from_mpk(mpk.clone(), network, gap_limit, initial_import_count)
                    .with_context(|| format!("invalid master public key {}", mpk))?,
            );
        }
        Ok(wallets)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn derive_address(&self, index: u32) -> Result<Address> {
        let key = self.master.derive_pubkey(self.change, index)?;
        Ok(match self.script_type {
            ScriptType::P2pkh => Address::p2pkh(&key, self.network),
            ScriptType::P2wpkh => Address::p2wpkh(&key, self.network)?,
            ScriptType::P2shP2wpkh => Address::p2shwpkh(&key, self.network)?,
        })
    }

    /// Bulk range query over the chain, advancing the next-unseen cursor
    /// past the queried range.
    pub fn get_scriptpubkeys(
        &mut self,
        from_index: u32,
        count: u32,
    ) -> Result<Vec<(Script, Address, KeyOrigin)>> {
        let entries = (from_index..from_index + count)
            .map(|index| self.entry_at(index))
            .collect();
        self.next_cursor = self.next_cursor.max(from_index + count);
        entries
    }

    /// The next not-yet-handed-out script, advancing the cursor.
    pub fn next_entry(&mut self) -> Result<(Script, Address, KeyOrigin)> {
        let entry = self.entry_at(self.next_cursor)?;
        self.next_cursor += 1;
        Ok(entry)
    }

    /// Take back the script handed out by the last `next_entry` call.
    pub fn rewind_one(&mut self) {
        self.next_cursor = self.next_cursor.saturating_sub(1);
    }

    /// Record that the address at `index` was found already imported on the node.
    pub fn note_imported(&mut self, index: u32) {
        if self.max_imported_index.map_or(true, |max| index > max) {
            self.max_imported_index = Some(index);
        }
    }

    // Highest index the chain has to keep imported for its gap window to
    // stay open.
    fn watch_index(&self) -> u32 {
        let gap_limit = iif!(
            self.done_initial_import,
            self.gap_limit,
            self.initial_import_count
        );

        self.max_used_index
            .map_or(gap_limit - 1, |max| max + gap_limit)
    }

    fn make_imports(
        &self,
        start_index: u32,
        end_index: u32,
    ) -> Result<Vec<(Script, Address, KeyOrigin)>> {
        (start_index..=end_index)
            .map(|index| self.entry_at(index))
            .collect()
    }

    fn entry_at(&self, index: u32) -> Result<(Script, Address, KeyOrigin)> {
        let address = self.derive_address(index)?;
        let origin = KeyOrigin::Derived(self.fingerprint, index);
        Ok((address.script_pubkey(), address, origin))
    }
}

/// Batch-import addresses into the node under the fixed label, without
/// triggering a rescan.
pub fn import_addresses(
    rpc: &RpcClient,
    import_reqs: &[(Script, Address, KeyOrigin)],
) -> Result<Vec<Value>> {
    Ok(rpc.call(
        "importmulti",
        &[json!(import_reqs
            .iter()
            .map(|(_, address, origin)| {
                trace!("importing {} as {:?}", address, origin);

                json!({
                  "scriptPubKey": { "address": address },
                  "timestamp": "now",
                  "label": ADDRESSES_LABEL,
                  "watchonly": true,
                })
            })
            .collect::<Vec<Value>>())],
    )?)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    Derived(Fingerprint, u32),
    Standalone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const XPUB: &str = "xpub661MyMwAqRbcFLqTBCNzuoj4FYE1xRxmCjrSWC6LUjKHo46Du4NacKgxdrJPWhzLjkPsXqnjAUwn1raMSWfxWZKysPoBNQMZMs8b5JM8egC";

    fn test_wallet(gap_limit: u32, initial_import_count: u32) -> HDWallet {
        let mpk = MasterPubKey::from_str(XPUB).unwrap();
        HDWallet::new(mpk, 0, Network::Bitcoin, gap_limit, initial_import_count).unwrap()
    }

    #[test]
    fn test_two_chains_per_key() {
        let mpk = MasterPubKey::from_str(XPUB).unwrap();
        let wallets = HDWallet::from_mpk(mpk, Network::Bitcoin, 20, 100).unwrap();
        assert_eq!(wallets.len(), 2);
        assert_ne!(wallets[0].fingerprint(), wallets[1].fingerprint());

        let external = wallets[0].derive_address(0).unwrap();
        let change = wallets[1].derive_address(0).unwrap();
        assert_ne!(external, change);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let wallet = test_wallet(20, 100);
        assert_eq!(
            wallet.derive_address(7).unwrap(),
            wallet.derive_address(7).unwrap()
        );
        assert_ne!(
            wallet.derive_address(7).unwrap(),
            wallet.derive_address(8).unwrap()
        );
    }

    #[test]
    fn test_bulk_range_query() {
        let mut wallet = test_wallet(20, 100);
        let entries = wallet.get_scriptpubkeys(5, 3).unwrap();
        assert_eq!(entries.len(), 3);
        for (i, (script, address, origin)) in entries.iter().enumerate() {
            assert_eq!(*script, address.script_pubkey());
            assert_eq!(
                *origin,
                KeyOrigin::Derived(wallet.fingerprint(), 5 + i as u32)
            );
        }
        // the cursor moved past the queried range
        let (_, _, origin) = wallet.next_entry().unwrap();
        assert_eq!(origin, KeyOrigin::Derived(wallet.fingerprint(), 8));
    }

    #[test]
    fn test_cursor_next_and_rewind() {
        let mut wallet = test_wallet(20, 100);
        let (first, _, origin0) = wallet.next_entry().unwrap();
        let (_, _, origin1) = wallet.next_entry().unwrap();
        assert_eq!(origin0, KeyOrigin::Derived(wallet.fingerprint(), 0));
        assert_eq!(origin1, KeyOrigin::Derived(wallet.fingerprint(), 1));

        wallet.rewind_one();
        wallet.rewind_one();
        let (again, _, origin) = wallet.next_entry().unwrap();
        assert_eq!(origin, KeyOrigin::Derived(wallet.fingerprint(), 0));
        assert_eq!(first, again);
    }

    #[test]
    fn test_watch_index_follows_usage() {
        let mut wallet = test_wallet(5, 10);
        // before the initial import completes the wider initial count applies
        assert_eq!(wallet.watch_index(), 9);
        wallet.done_initial_import = true;
        assert_eq!(wallet.watch_index(), 4);

        wallet.max_used_index = Some(12);
        assert_eq!(wallet.watch_index(), 17);
    }

    #[test]
    fn test_mark_funded_advances_the_gap_window() {
        let wallet = test_wallet(5, 10);
        let fingerprint = wallet.fingerprint();
        let mut watcher = HDWatcher::new(vec![wallet]);

        watcher.mark_funded(&KeyOrigin::Derived(fingerprint, 3));
        let wallet = &watcher.wallets()[&fingerprint];
        assert_eq!(wallet.max_used_index, Some(3));
        assert_eq!(wallet.max_imported_index, Some(3));

        // standalone watch-only addresses never move wallet cursors
        watcher.mark_funded(&KeyOrigin::Standalone);
        assert_eq!(watcher.wallets()[&fingerprint].max_used_index, Some(3));
    }
}
