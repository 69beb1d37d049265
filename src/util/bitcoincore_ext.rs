use std::collections::HashMap;

use bitcoin::{BlockHash, Txid};
use bitcoincore_rpc::{self as rpc, Client, Result as RpcResult, RpcApi};
use serde_json::Value;

// RPC methods the node offers but rust-bitcoincore-rpc does not expose,
// routed through the raw call() escape hatch

pub const RPC_MISC_ERROR: i32 = -1;
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const RPC_WALLET_INVALID_LABEL_NAME: i32 = -11;
pub const RPC_IN_WARMUP: i32 = -28;
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;

pub trait RpcApiExt: RpcApi {
    fn node_uptime(&self) -> RpcResult<u64> {
        self.call("uptime", &[])
    }

    fn get_net_totals(&self) -> RpcResult<GetNetTotalsResult> {
        self.call("getnettotals", &[])
    }

    fn list_labels(&self) -> RpcResult<Vec<String>> {
        self.call("listlabels", &[])
    }

    fn get_addresses_by_label(&self, label: &str) -> RpcResult<HashMap<String, AddressEntry>> {
        match self.call("getaddressesbylabel", &[json!(label)]) {
            Ok(addresses) => Ok(addresses),
            // a label the wallet has never seen is an error on the node's
            // side, but just an empty set on ours
            Err(rpc::Error::JsonRpc(rpc::jsonrpc::Error::Rpc(e)))
                if e.code == RPC_WALLET_INVALID_LABEL_NAME =>
            {
                Ok(HashMap::new())
            }
            Err(e) => Err(e),
        }
    }

    fn get_tx_out_proof_hex(&self, txid: &Txid, block_hash: &BlockHash) -> RpcResult<String> {
        self.call("gettxoutproof", &[json!([txid]), json!(block_hash)])
    }

    fn get_raw_mempool_entries(&self) -> RpcResult<HashMap<Txid, Value>> {
        self.call("getrawmempool", &[true.into()])
    }

    /// Like `getmempoolentry`, with txs missing from the mempool mapped to
    /// Ok(None) instead of an error.
    fn get_mempool_entry_opt(&self, txid: &Txid) -> RpcResult<Option<MempoolEntry>> {
        match self.call("getmempoolentry", &[json!(txid)]) {
            Ok(entry) => Ok(Some(entry)),
            // the invalid-address code is what bitcoind picks for a tx that
            // is not in the mempool
            Err(rpc::Error::JsonRpc(rpc::jsonrpc::Error::Rpc(e)))
                if e.code == RPC_INVALID_ADDRESS_OR_KEY =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn rescan_blockchain_from(&self, start_height: u64) -> RpcResult<Value> {
        self.call("rescanblockchain", &[json!(start_height)])
    }
}

impl RpcApiExt for Client {}

#[derive(Debug, Deserialize)]
pub struct AddressEntry {
    pub purpose: String,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct GetNetTotalsResult {
    #[serde(rename = "totalbytesrecv")]
    pub total_bytes_recv: u64,
    #[serde(rename = "totalbytessent")]
    pub total_bytes_sent: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct MempoolEntry {
    #[serde(default)]
    pub depends: Vec<Txid>,
}
