use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bitcoin::{Address, OutPoint, Script, SignedAmount, Txid};
use bitcoincore_rpc::json::ListTransactionResult;
use bitcoincore_rpc::{Client as RpcClient, RpcApi};
use serde_json::Value;

use crate::electrum::{electrum_height, get_status_hash};
use crate::error::{Context, Result};
use crate::hd::{HDWatcher, KeyOrigin};
use crate::types::{BlockId, ScriptHash, StatusHash, TxStatus};
use crate::util::bitcoincore_ext::RpcApiExt;

/// Maintains the per-script history of every monitored script-pubkey by
/// polling the node's wallet, and hands out the set of scripts whose Electrum
/// status hash changed since the previous poll.
pub struct TransactionMonitor {
    rpc: Arc<RpcClient>,
    watcher: HDWatcher,
    index: AddressIndex,
    tip: Option<BlockId>,
}

#[derive(Debug, Default)]
struct AddressIndex {
    scripthashes: HashMap<ScriptHash, ScriptEntry>,
    transactions: HashMap<Txid, TxEntry>,
}

#[derive(Debug)]
struct ScriptEntry {
    script: Script,
    address: Address,
    origin: KeyOrigin,
    history: BTreeSet<HistoryEntry>,
    // the hash last handed to the polling step, for change suppression
    status_hash: Option<StatusHash>,
    subscribed: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub status: TxStatus,
}

impl HistoryEntry {
    fn new(txid: Txid, status: TxStatus) -> Self {
        HistoryEntry { txid, status }
    }
}

impl Ord for HistoryEntry {
    fn cmp(&self, other: &HistoryEntry) -> Ordering {
        self.status
            .cmp(&other.status)
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for HistoryEntry {
    fn partial_cmp(&self, other: &HistoryEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct TxEntry {
    status: TxStatus,
    fee: Option<u64>,
}

impl TransactionMonitor {
    pub fn new(rpc: Arc<RpcClient>, watcher: HDWatcher) -> Self {
        TransactionMonitor {
            rpc,
            watcher,
            index: AddressIndex::default(),
            tip: None,
        }
    }

    /// Register the startup script set and run the initial sync.
    pub fn build_address_history(
        &mut self,
        scripts: impl IntoIterator<Item = (Script, Address, KeyOrigin)>,
    ) -> Result<()> {
        for (script, address, origin) in scripts {
            self.index.track_script(script, address, origin);
        }
        info!(
            "building history for {} addresses",
            self.index.scripthashes.len()
        );
        let touched = self.sync_round()?;
        self.apply_status_changes(touched);
        info!("initial sync done, up to {:?}", self.tip);
        Ok(())
    }

    /// The polling step invoked from both heartbeats. Returns exactly the
    /// scripts whose status hash differs from the previous call's snapshot.
    pub fn check_for_updated_txes(&mut self) -> Result<Vec<ScriptHash>> {
        let touched = self.sync_round()?;
        Ok(self.apply_status_changes(touched))
    }

    pub fn subscribe_address(&mut self, scripthash: &ScriptHash) -> bool {
        match self.index.scripthashes.get_mut(scripthash) {
            Some(entry) => {
                entry.subscribed = true;
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_all_addresses(&mut self) {
        for entry in self.index.scripthashes.values_mut() {
            entry.subscribed = false;
        }
    }

    pub fn is_subscribed(&self, scripthash: &ScriptHash) -> bool {
        self.index
            .scripthashes
            .get(scripthash)
            .map_or(false, |entry| entry.subscribed)
    }

    pub fn status_hash(&self, scripthash: &ScriptHash) -> Option<StatusHash> {
        self.index.status_hash_of(scripthash)
    }

    /// The full history list in wire form, or None for unknown scripts.
    pub fn get_electrum_history(&self, scripthash: &ScriptHash) -> Option<Vec<Value>> {
        let entry = self.index.scripthashes.get(scripthash)?;
        Some(
            entry
                .history
                .iter()
                .map(|hist| {
                    let mut item =
                        json!({ "height": electrum_height(hist.status), "tx_hash": hist.txid });
                    if hist.status.is_unconfirmed() {
                        let fee = self
                            .index
                            .transactions
                            .get(&hist.txid)
                            .and_then(|tx| tx.fee);
                        item["fee"] = json!(fee.unwrap_or(0));
                    }
                    item
                })
                .collect(),
        )
    }

    pub fn num_addresses(&self) -> usize {
        self.index.scripthashes.len()
    }

    fn sync_round(&mut self) -> Result<HashSet<ScriptHash>> {
        let mut touched = HashSet::new();

        // A reorg invalidates heights derived from the old tip; detect it and
        // resync the history from scratch (the node's wallet keeps it all).
        if let Some(BlockId(tip_height, tip_hash)) = self.tip {
            if self.rpc.get_block_hash(tip_height as u64)? != tip_hash {
                warn!(
                    "reorg detected, block height {} is no longer {}. syncing from scratch...",
                    tip_height, tip_hash
                );
                self.tip = None;
            }
        }

        let start_height = self.tip.map_or(0, |BlockId(tip_height, _)| tip_height + 1);
        let (ltxs, synced_tip) = load_transactions_since(&self.rpc, start_height)?;

        // listtransactions reports one row per wallet-relevant detail
        let mut seen = HashSet::new();
        for ltx in ltxs {
            if seen.insert(ltx.info.txid) {
                self.process_tx(ltx.info.txid, ltx.info.confirmations, synced_tip.0, &mut touched)
                    .map_err(|err| warn!("failed processing {}: {:?}", ltx.info.txid, err))
                    .ok();
            }
        }

        self.check_mempool(&mut touched)?;
        self.extend_wallets()?;

        self.tip = Some(synced_tip);
        Ok(touched)
    }

    fn process_tx(
        &mut self,
        txid: Txid,
        confirmations: i32,
        tip_height: u32,
        touched: &mut HashSet<ScriptHash>,
    ) -> Result<()> {
        if confirmations < 0 {
            self.index.purge_tx(&txid, touched);
            return Ok(());
        }

        let gtx = self.rpc.get_transaction(&txid, Some(true))?;
        let tx = gtx.transaction().context("invalid transaction hex")?;

        let mut funded = vec![];
        for txo in &tx.output {
            let scripthash = ScriptHash::from_script(&txo.script_pubkey);
            if self.index.scripthashes.contains_key(&scripthash) {
                funded.push(scripthash);
            }
        }

        let mut spent = vec![];
        for txin in &tx.input {
            if txin.previous_output.is_null() {
                continue; // coinbase
            }
            if let Some(script) = self.prev_script(&txin.previous_output)? {
                let scripthash = ScriptHash::from_script(&script);
                if self.index.scripthashes.contains_key(&scripthash) {
                    spent.push(scripthash);
                }
            }
        }

        if funded.is_empty() && spent.is_empty() {
            return Ok(());
        }

        let unconfirmed = confirmations == 0;
        let unconfirmed_parents = unconfirmed
            && self
                .rpc
                .get_mempool_entry_opt(&txid)?
                .map_or(false, |entry| !entry.depends.is_empty());
        let status = TxStatus::new(confirmations, tip_height, unconfirmed_parents);
        let fee = iif!(unconfirmed, parse_fee(gtx.fee), None);

        debug!(
            "processing tx {} with status {:?} funding {} and spending {} monitored scripts",
            txid,
            status,
            funded.len(),
            spent.len()
        );

        self.index.index_tx_entry(&txid, TxEntry { status, fee }, touched);
        for scripthash in funded.iter().chain(spent.iter()) {
            self.index
                .index_history_entry(scripthash, HistoryEntry::new(txid, status));
            touched.insert(*scripthash);
        }

        // funding a derived script advances its chain's gap window
        for scripthash in &funded {
            if let Some(entry) = self.index.scripthashes.get(scripthash) {
                let origin = entry.origin.clone();
                self.watcher.mark_funded(&origin);
            }
        }

        Ok(())
    }

    // Resolve a previous output's script through the node's wallet; inputs
    // that are not wallet transactions come back as None.
    fn prev_script(&self, outpoint: &OutPoint) -> Result<Option<Script>> {
        match self.rpc.get_transaction(&outpoint.txid, Some(true)) {
            Ok(gtx) => {
                let prev_tx = gtx.transaction().context("invalid transaction hex")?;
                Ok(prev_tx
                    .output
                    .get(outpoint.vout as usize)
                    .map(|txo| txo.script_pubkey.clone()))
            }
            Err(_) => Ok(None),
        }
    }

    // Re-check every tracked mempool transaction: drop the ones that were
    // evicted without confirming, and follow -1 -> 0 transitions when their
    // parents confirm.
    fn check_mempool(&mut self, touched: &mut HashSet<ScriptHash>) -> Result<()> {
        let mempool_txids: Vec<(Txid, bool)> = self
            .index
            .transactions
            .iter()
            .filter_map(|(txid, entry)| match entry.status {
                TxStatus::Mempool {
                    unconfirmed_parents,
                } => Some((*txid, unconfirmed_parents)),
                _ => None,
            })
            .collect();

        for (txid, had_unconfirmed_parents) in mempool_txids {
            match self.rpc.get_mempool_entry_opt(&txid)? {
                Some(entry) => {
                    let unconfirmed_parents = !entry.depends.is_empty();
                    if unconfirmed_parents != had_unconfirmed_parents {
                        self.index.update_tx_status(
                            &txid,
                            TxStatus::Mempool {
                                unconfirmed_parents,
                            },
                            touched,
                        );
                    }
                }
                None => {
                    // gone from the mempool: either confirmed (the
                    // listtransactions pass picks that up) or dropped
                    let confirmations = self
                        .rpc
                        .get_transaction(&txid, Some(true))
                        .map(|gtx| gtx.info.confirmations)
                        .unwrap_or(-1);
                    if confirmations <= 0 {
                        info!("tx {} dropped out of the mempool", txid);
                        self.index.purge_tx(&txid, touched);
                    }
                }
            }
        }
        Ok(())
    }

    fn extend_wallets(&mut self) -> Result<()> {
        for (script, address, origin) in self.watcher.watch(&self.rpc)? {
            self.index.track_script(script, address, origin);
        }
        Ok(())
    }

    fn apply_status_changes(&mut self, touched: HashSet<ScriptHash>) -> Vec<ScriptHash> {
        let mut changed = vec![];
        for scripthash in touched {
            let current = self.index.status_hash_of(&scripthash);
            if let Some(entry) = self.index.scripthashes.get_mut(&scripthash) {
                if entry.status_hash != current {
                    entry.status_hash = current;
                    changed.push(scripthash);
                }
            }
        }
        changed
    }
}

impl AddressIndex {
    fn track_script(&mut self, script: Script, address: Address, origin: KeyOrigin) {
        debug!("tracking {} {:?}", address, origin);

        let scripthash = ScriptHash::from_script(&script);
        self.scripthashes
            .entry(scripthash)
            .or_insert_with(|| ScriptEntry {
                script,
                address,
                origin,
                history: BTreeSet::new(),
                status_hash: None,
                subscribed: false,
            });
    }

    fn index_tx_entry(&mut self, txid: &Txid, txentry: TxEntry, touched: &mut HashSet<ScriptHash>) {
        assert!(
            txentry.status.is_viable(),
            "conflicted txs are purged, never indexed"
        );

        let new_status = txentry.status;
        let mut changed_from = None;

        self.transactions
            .entry(*txid)
            .and_modify(|curr_entry| {
                if curr_entry.fee.is_none() {
                    curr_entry.fee = txentry.fee;
                }
                if curr_entry.status != new_status {
                    changed_from = Some(curr_entry.status);
                    curr_entry.status = new_status;
                    if new_status.is_confirmed() {
                        curr_entry.fee = None;
                    }
                }
            })
            .or_insert_with(|| {
                info!("indexing new tx {}", txid);
                txentry
            });

        if let Some(old_status) = changed_from {
            self.tx_status_changed(txid, old_status, new_status, touched)
        }
    }

    fn index_history_entry(&mut self, scripthash: &ScriptHash, txhist: HistoryEntry) {
        if let Some(entry) = self.scripthashes.get_mut(scripthash) {
            if entry.history.insert(txhist) {
                info!("new history entry for {}", scripthash);
            }
        }
    }

    fn update_tx_status(
        &mut self,
        txid: &Txid,
        new_status: TxStatus,
        touched: &mut HashSet<ScriptHash>,
    ) {
        let old_status = match self.transactions.get_mut(txid) {
            Some(entry) if entry.status != new_status => {
                let old = entry.status;
                entry.status = new_status;
                if new_status.is_confirmed() {
                    entry.fee = None;
                }
                old
            }
            _ => return,
        };
        self.tx_status_changed(txid, old_status, new_status, touched);
    }

    // Re-file the tx under its new status in every history that holds it.
    fn tx_status_changed(
        &mut self,
        txid: &Txid,
        old_status: TxStatus,
        new_status: TxStatus,
        touched: &mut HashSet<ScriptHash>,
    ) {
        info!(
            "transition tx {} status: {:?} -> {:?}",
            txid, old_status, new_status
        );

        let old_txhist = HistoryEntry::new(*txid, old_status);
        let new_txhist = HistoryEntry::new(*txid, new_status);

        for (scripthash, ScriptEntry { history, .. }) in &mut self.scripthashes {
            if history.remove(&old_txhist) {
                history.insert(new_txhist.clone());
                touched.insert(*scripthash);
            }
        }
    }

    fn purge_tx(&mut self, txid: &Txid, touched: &mut HashSet<ScriptHash>) {
        let old_entry = match self.transactions.remove(txid) {
            Some(entry) => entry,
            None => return,
        };
        info!("purge tx {}", txid);

        let old_txhist = HistoryEntry::new(*txid, old_entry.status);
        for (scripthash, ScriptEntry { history, .. }) in &mut self.scripthashes {
            if history.remove(&old_txhist) {
                touched.insert(*scripthash);
            }
        }
    }

    fn status_hash_of(&self, scripthash: &ScriptHash) -> Option<StatusHash> {
        let entry = self.scripthashes.get(scripthash)?;
        get_status_hash(
            entry
                .history
                .iter()
                .map(|hist| (hist.txid, electrum_height(hist.status))),
        )
    }
}

// wallet fees arrive as negative BTC amounts
fn parse_fee(fee: Option<SignedAmount>) -> Option<u64> {
    fee.map(|fee| fee.abs().as_sat() as u64)
}

const FIRST_PAGE_SIZE: usize = 25;

/// Fetch every mempool transaction plus everything confirmed at or after
/// `start_height`, along with the tip the confirmation counts are relative
/// to. Confirmed heights are derived from confirmation counts, so a whole
/// pass is only valid against a single tip; any movement detected mid-walk
/// throws the pass away and starts a fresh one.
fn load_transactions_since(
    rpc: &RpcClient,
    start_height: u32,
) -> Result<(Vec<ListTransactionResult>, BlockId)> {
    loop {
        let tip = chain_tip(rpc)?;
        match walk_wallet_pages(rpc, start_height, tip)? {
            Some(collected) => return Ok((collected, tip)),
            None => warn!("the wallet moved while reading transactions, starting over..."),
        }
    }
}

fn chain_tip(rpc: &RpcClient) -> Result<BlockId> {
    let height = rpc.get_block_count()? as u32;
    Ok(BlockId(height, rpc.get_block_hash(height as u64)?))
}

// A single pass over `listtransactions`, read newest-to-oldest in pages that
// double in size. Two consistency checks guard the pass, and a failure of
// either returns None so the caller can redo it:
//  * the chain tip must still be `tip` after every page fetch;
//  * consecutive pages overlap by one row, and the overlapping row must be
//    the same one the previous page ended on (the wallet gained or lost a
//    transaction in between otherwise).
fn walk_wallet_pages(
    rpc: &RpcClient,
    start_height: u32,
    tip: BlockId,
) -> Result<Option<Vec<ListTransactionResult>>> {
    let BlockId(tip_height, tip_hash) = tip;
    ensure!(start_height <= tip_height + 1, "start height is past the tip");
    // a tx confirmed exactly at start_height has this many confirmations
    let cutoff_confirmations = (tip_height + 1 - start_height) as i32;

    debug!(
        "reading wallet transactions since height {} (tip {})",
        start_height, tip_height
    );

    let mut collected = vec![];
    let mut oldest_fetched: Option<(Txid, u32)> = None;
    let mut page_size = FIRST_PAGE_SIZE;
    let mut skip = 0;

    loop {
        trace!("reading a page of {} transactions, {} deep", page_size, skip);
        let mut page = rpc.list_transactions(None, Some(page_size), Some(skip), Some(true))?;
        let full_page = page.len() == page_size;

        if rpc.get_best_block_hash()? != tip_hash {
            return Ok(None);
        }

        if let Some(expected) = oldest_fetched {
            // rows within a page run oldest to newest, so the overlap row is
            // the newest (last) one of this deeper page
            if page.pop().map(|row| page_overlap_key(&row)) != Some(expected) {
                return Ok(None);
            }
        }

        oldest_fetched = match page.first() {
            Some(row) => Some(page_overlap_key(row)),
            None => return Ok(Some(collected)),
        };

        page.retain(|ltx| ltx.info.confirmations <= cutoff_confirmations);
        let past_the_cutoff = page.is_empty();
        collected.append(&mut page);

        if !full_page || past_the_cutoff {
            return Ok(Some(collected));
        }
        // overlap the next page by one row
        skip += page_size - 1;
        page_size *= 2;
    }
}

// listtransactions reports one row per wallet detail, so a txid alone does
// not identify a row
fn page_overlap_key(ltx: &ListTransactionResult) -> (Txid, u32) {
    (ltx.info.txid, ltx.detail.vout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin_hashes::Hash;
    use std::str::FromStr;

    fn test_address(n: u8) -> (Script, Address, KeyOrigin) {
        let addresses = [
            "1BitcoinEaterAddressDontSendf59kuE",
            "1CounterpartyXXXXXXXXXXXXXXXUWLpVr",
            "1111111111111111111114oLvT2",
        ];
        let address = Address::from_str(addresses[n as usize % 3]).unwrap();
        (address.script_pubkey(), address, KeyOrigin::Standalone)
    }

    fn scripthash_of(n: u8) -> ScriptHash {
        ScriptHash::from_script(&test_address(n).0)
    }

    fn txid(n: u8) -> Txid {
        Txid::hash(&[n])
    }

    fn tracked_index(addresses: &[u8]) -> AddressIndex {
        let mut index = AddressIndex::default();
        for &n in addresses {
            let (script, address, origin) = test_address(n);
            index.track_script(script, address, origin);
        }
        index
    }

    fn mempool_status() -> TxStatus {
        TxStatus::Mempool {
            unconfirmed_parents: false,
        }
    }

    #[test]
    fn test_history_is_ordered_for_electrum() {
        let mut index = tracked_index(&[0]);
        let scripthash = scripthash_of(0);

        let mut touched = HashSet::new();
        for (n, status) in &[
            (1u8, mempool_status()),
            (2, TxStatus::Confirmed(600)),
            (3, TxStatus::Confirmed(90)),
        ] {
            index.index_tx_entry(&txid(*n), TxEntry { status: *status, fee: None }, &mut touched);
            index.index_history_entry(&scripthash, HistoryEntry::new(txid(*n), *status));
        }

        let entry = &index.scripthashes[&scripthash];
        let ordered: Vec<Txid> = entry.history.iter().map(|hist| hist.txid).collect();
        assert_eq!(ordered, vec![txid(3), txid(2), txid(1)]);
    }

    #[test]
    fn test_confirmation_updates_history_and_drops_fee() {
        let mut index = tracked_index(&[0, 1]);
        let scripthash = scripthash_of(0);
        let other = scripthash_of(1);

        let mut touched = HashSet::new();
        index.index_tx_entry(
            &txid(1),
            TxEntry {
                status: mempool_status(),
                fee: Some(1500),
            },
            &mut touched,
        );
        index.index_history_entry(&scripthash, HistoryEntry::new(txid(1), mempool_status()));

        touched.clear();
        index.update_tx_status(&txid(1), TxStatus::Confirmed(700_000), &mut touched);

        assert_eq!(touched.iter().collect::<Vec<_>>(), vec![&scripthash]);
        assert!(!touched.contains(&other));
        let entry = &index.scripthashes[&scripthash];
        let hist: Vec<_> = entry.history.iter().collect();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].status, TxStatus::Confirmed(700_000));
        assert_eq!(index.transactions[&txid(1)].fee, None);
    }

    #[test]
    fn test_purge_keeps_monitored_scripts() {
        let mut index = tracked_index(&[0]);
        let scripthash = scripthash_of(0);

        let mut touched = HashSet::new();
        index.index_tx_entry(
            &txid(1),
            TxEntry {
                status: mempool_status(),
                fee: Some(100),
            },
            &mut touched,
        );
        index.index_history_entry(&scripthash, HistoryEntry::new(txid(1), mempool_status()));

        touched.clear();
        index.purge_tx(&txid(1), &mut touched);

        assert!(touched.contains(&scripthash));
        assert!(index.transactions.is_empty());
        let entry = &index.scripthashes[&scripthash];
        assert!(entry.history.is_empty());
        // the script stays monitored even with an empty history
        assert_eq!(index.scripthashes.len(), 1);
    }

    #[test]
    fn test_status_change_detection() {
        let rpc = Arc::new(
            RpcClient::new(
                "http://localhost:0".into(),
                bitcoincore_rpc::Auth::None,
            )
            .unwrap(),
        );
        let mut monitor = TransactionMonitor::new(rpc, HDWatcher::new(vec![]));
        let (script, address, origin) = test_address(0);
        monitor.index.track_script(script, address, origin);
        let scripthash = scripthash_of(0);

        // an untouched empty script reports no change
        let changed = monitor.apply_status_changes([scripthash].iter().copied().collect());
        assert_eq!(changed, vec![]);

        // a new history entry changes the status hash exactly once
        let mut touched = HashSet::new();
        monitor.index.index_tx_entry(
            &txid(1),
            TxEntry {
                status: mempool_status(),
                fee: None,
            },
            &mut touched,
        );
        monitor
            .index
            .index_history_entry(&scripthash, HistoryEntry::new(txid(1), mempool_status()));

        let changed = monitor.apply_status_changes([scripthash].iter().copied().collect());
        assert_eq!(changed, vec![scripthash]);
        let changed = monitor.apply_status_changes([scripthash].iter().copied().collect());
        assert_eq!(changed, vec![]);

        assert!(monitor.status_hash(&scripthash).is_some());
        let history = monitor.get_electrum_history(&scripthash).unwrap();
        assert_eq!(history[0]["height"], 0);
        assert_eq!(history[0]["fee"], 0);
        assert!(monitor.get_electrum_history(&scripthash_of(1)).is_none());
    }

    #[test]
    fn test_subscription_flags() {
        let rpc = Arc::new(
            RpcClient::new(
                "http://localhost:0".into(),
                bitcoincore_rpc::Auth::None,
            )
            .unwrap(),
        );
        let mut monitor = TransactionMonitor::new(rpc, HDWatcher::new(vec![]));
        let (script, address, origin) = test_address(0);
        monitor.index.track_script(script, address, origin);
        let scripthash = scripthash_of(0);

        assert!(!monitor.is_subscribed(&scripthash));
        assert!(monitor.subscribe_address(&scripthash));
        assert!(monitor.is_subscribed(&scripthash));
        assert!(!monitor.subscribe_address(&scripthash_of(1)));

        monitor.unsubscribe_all_addresses();
        assert!(!monitor.is_subscribed(&scripthash));
    }
}
