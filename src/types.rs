use std::cmp::Ordering;

use bitcoin::{BlockHash, Script};
use bitcoin_hashes::{sha256, Hash};

hash_newtype!(
    ScriptHash,
    sha256::Hash,
    32,
    doc = "SHA-256 of a script-pubkey, reversed for display (the Electrum address handle).",
    true
);
hash_newtype!(
    StatusHash,
    sha256::Hash,
    32,
    doc = "Fingerprint of a script's history, used for subscription change detection.",
    false
);

impl ScriptHash {
    pub fn from_script(script: &Script) -> Self {
        ScriptHash::hash(script.as_bytes())
    }
}

/// A block height and the hash observed at that height.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct BlockId(pub u32, pub BlockHash);

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ScriptType {
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
}

#[derive(Clone, Eq, PartialEq, Debug, Copy, Hash)]
pub enum TxStatus {
    Conflicted, // aka double spent
    Mempool { unconfirmed_parents: bool },
    Confirmed(u32), // (height)
}

impl TxStatus {
    pub fn new(confirmations: i32, tip_height: u32, unconfirmed_parents: bool) -> Self {
        if confirmations > 0 {
            TxStatus::Confirmed(tip_height - (confirmations as u32) + 1)
        } else if confirmations == 0 {
            TxStatus::Mempool {
                unconfirmed_parents,
            }
        } else {
            // negative confirmations indicate the tx conflicts with the best chain
            TxStatus::Conflicted
        }
    }

    pub fn is_viable(&self) -> bool {
        match self {
            TxStatus::Confirmed(_) | TxStatus::Mempool { .. } => true,
            TxStatus::Conflicted => false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, TxStatus::Confirmed(_))
    }

    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, TxStatus::Mempool { .. })
    }
}

// History entries are kept sorted the way Electrum expects them reported:
// confirmed ascending by height, then mempool txs with confirmed parents,
// then mempool txs that spend unconfirmed outputs.
impl Ord for TxStatus {
    fn cmp(&self, other: &TxStatus) -> Ordering {
        match (self, other) {
            (TxStatus::Confirmed(height), TxStatus::Confirmed(other_height)) => {
                height.cmp(other_height)
            }
            (TxStatus::Confirmed(_), _) => Ordering::Less,
            (_, TxStatus::Confirmed(_)) => Ordering::Greater,
            (
                TxStatus::Mempool {
                    unconfirmed_parents: a,
                },
                TxStatus::Mempool {
                    unconfirmed_parents: b,
                },
            ) => a.cmp(b),
            (TxStatus::Mempool { .. }, TxStatus::Conflicted) => Ordering::Less,
            (TxStatus::Conflicted, TxStatus::Mempool { .. }) => Ordering::Greater,
            (TxStatus::Conflicted, TxStatus::Conflicted) => Ordering::Equal,
        }
    }
}

impl PartialOrd for TxStatus {
    fn partial_cmp(&self, other: &TxStatus) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_confirmations() {
        assert_eq!(TxStatus::new(3, 102, false), TxStatus::Confirmed(100));
        assert_eq!(
            TxStatus::new(0, 102, true),
            TxStatus::Mempool {
                unconfirmed_parents: true
            }
        );
        assert_eq!(TxStatus::new(-1, 102, false), TxStatus::Conflicted);
    }

    #[test]
    fn test_status_ordering() {
        let confirmed_early = TxStatus::Confirmed(5);
        let confirmed_late = TxStatus::Confirmed(50);
        let mempool = TxStatus::Mempool {
            unconfirmed_parents: false,
        };
        let mempool_chained = TxStatus::Mempool {
            unconfirmed_parents: true,
        };

        let mut statuses = vec![mempool_chained, confirmed_late, mempool, confirmed_early];
        statuses.sort();
        assert_eq!(
            statuses,
            vec![confirmed_early, confirmed_late, mempool, mempool_chained]
        );
    }
}
