use bitcoin::Txid;
use bitcoin_hashes::{Hash, HashEngine};
use serde_json::Value;

use crate::types::{StatusHash, TxStatus};

mod server;
pub use server::{ElectrumServer, ServerOptions};

/// The height field Electrum expects in histories and status hashes:
/// the block height for confirmed txs, 0 for mempool txs whose inputs are all
/// confirmed, -1 for mempool txs spending unconfirmed outputs.
pub fn electrum_height(status: TxStatus) -> i64 {
    match status {
        TxStatus::Confirmed(height) => height as i64,
        TxStatus::Mempool {
            unconfirmed_parents,
        } => iif!(unconfirmed_parents, -1, 0),
        TxStatus::Conflicted => {
            unreachable!("electrum_height() should not be called on conflicted txs")
        }
    }
}

/// Single SHA-256 over the concatenated `"txid:height:"` of every history
/// entry in canonical order. An empty history has no hash (encoded as `""`
/// on the wire, see `status_hash_json`).
pub fn get_status_hash(history: impl IntoIterator<Item = (Txid, i64)>) -> Option<StatusHash> {
    let mut engine = StatusHash::engine();
    let mut has_history = false;
    for (txid, height) in history {
        has_history = true;
        let part = format!("{}:{}:", txid, height);
        engine.input(part.as_bytes());
    }
    iif!(has_history, Some(StatusHash::from_engine(engine)), None)
}

pub fn status_hash_json(status_hash: Option<StatusHash>) -> Value {
    match status_hash {
        Some(hash) => json!(hash),
        None => json!(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin_hashes::hex::ToHex;

    fn txid(n: u8) -> Txid {
        Txid::hash(&[n])
    }

    #[test]
    fn test_electrum_height() {
        assert_eq!(electrum_height(TxStatus::Confirmed(630000)), 630000);
        assert_eq!(
            electrum_height(TxStatus::Mempool {
                unconfirmed_parents: false
            }),
            0
        );
        assert_eq!(
            electrum_height(TxStatus::Mempool {
                unconfirmed_parents: true
            }),
            -1
        );
    }

    #[test]
    fn test_empty_history_has_no_hash() {
        assert_eq!(get_status_hash(vec![]), None);
        assert_eq!(status_hash_json(None), json!(""));
    }

    #[test]
    fn test_status_hash_is_a_pure_function_of_the_history() {
        let history = vec![(txid(1), 100), (txid(2), 0)];
        let first = get_status_hash(history.clone()).unwrap();
        let second = get_status_hash(history).unwrap();
        assert_eq!(first, second);

        // sensitive to entry order, heights and txids
        assert_ne!(
            Some(first),
            get_status_hash(vec![(txid(2), 0), (txid(1), 100)])
        );
        assert_ne!(Some(first), get_status_hash(vec![(txid(1), 100)]));
        assert_ne!(
            Some(first),
            get_status_hash(vec![(txid(1), 101), (txid(2), 0)])
        );
    }

    #[test]
    fn test_status_hash_encoding_is_forward_hex() {
        let hash = get_status_hash(vec![(txid(7), -1)]).unwrap();
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(json!(hash), json!(hex));
    }
}
