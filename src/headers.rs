use std::sync::Arc;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{BlockHash, BlockHeader, TxMerkleNode};
use bitcoincore_rpc::json::GetBlockHeaderResult;
use bitcoincore_rpc::{Client as RpcClient, RpcApi};
use serde_json::Value;

use crate::error::{Context, Result};

/// Tracks the chain tip and produces block headers in the two encodings the
/// Electrum protocol knows: the canonical 80-byte frame and the structured
/// JSON object used by older protocol versions.
pub struct HeaderTracker {
    rpc: Arc<RpcClient>,
    best_block_hash: Option<BlockHash>,
}

impl HeaderTracker {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        HeaderTracker {
            rpc,
            best_block_hash: None,
        }
    }

    /// Record the tip without emitting a change, used once at startup.
    pub fn prime(&mut self, tip: BlockHash) {
        self.best_block_hash = Some(tip);
    }

    /// Compare the node's tip against the last observed one. Returns whether
    /// it moved along with the current tip header.
    pub fn check_for_new_tip(&mut self, raw: bool) -> Result<(bool, Value)> {
        let (new_best, header) = self.current_header(raw)?;
        let changed = self.best_block_hash != Some(new_best);
        self.best_block_hash = Some(new_best);
        Ok((changed, header))
    }

    pub fn current_header(&self, raw: bool) -> Result<(BlockHash, Value)> {
        let best = self.rpc.get_best_block_hash()?;
        Ok((best, self.header_json(&best, raw)?))
    }

    pub fn header_json(&self, hash: &BlockHash, raw: bool) -> Result<Value> {
        let fields = HeaderFields::from_info(&self.rpc.get_block_header_info(hash)?)?;
        Ok(iif!(raw, fields.raw_json(), fields.structured_json()))
    }

    pub fn header_json_at(&self, height: u32, raw: bool) -> Result<Value> {
        let hash = self.rpc.get_block_hash(height as u64)?;
        self.header_json(&hash, raw)
    }

    /// The 80-byte header hex at the given height.
    pub fn header_hex_at(&self, height: u32) -> Result<String> {
        let hash = self.rpc.get_block_hash(height as u64)?;
        let fields = HeaderFields::from_info(&self.rpc.get_block_header_info(&hash)?)?;
        Ok(fields.raw_hex())
    }

    /// Walk forward from `start` following `nextblockhash`, concatenating up
    /// to `count` raw headers. An unknown start height yields an empty result
    /// rather than an error; hitting the tip stops early.
    pub fn headers_hex(&self, start: u32, count: u32) -> Result<(String, usize)> {
        let mut next_hash = match self.rpc.get_block_hash(start as u64) {
            Ok(hash) => hash,
            Err(_) => return Ok((String::new(), 0)),
        };

        let mut hex = String::new();
        let mut produced = 0;
        for _ in 0..count {
            let info = self.rpc.get_block_header_info(&next_hash)?;
            hex.push_str(&HeaderFields::from_info(&info)?.raw_hex());
            produced += 1;
            match info.next_block_hash {
                Some(next) => next_hash = next,
                None => break,
            }
        }
        Ok((hex, produced))
    }

    /// Best known header height (including header-only tips).
    pub fn chain_height(&self) -> Result<u32> {
        Ok(self.rpc.get_blockchain_info()?.headers as u32)
    }
}

struct HeaderFields {
    height: usize,
    version: i32,
    prev_block_hash: Option<BlockHash>,
    merkle_root: TxMerkleNode,
    time: u32,
    bits: u32,
    nonce: u32,
}

impl HeaderFields {
    fn from_info(info: &GetBlockHeaderResult) -> Result<Self> {
        Ok(HeaderFields {
            height: info.height,
            version: info.version,
            prev_block_hash: info.previous_block_hash,
            merkle_root: info.merkle_root,
            time: info.time as u32,
            bits: u32::from_str_radix(&info.bits, 16)
                .with_context(|| format!("bad compact target {}", info.bits))?,
            nonce: info.nonce,
        })
    }

    fn to_block_header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            // the genesis block has no predecessor, encoded as 32 zero bytes
            prev_blockhash: self.prev_block_hash.unwrap_or_default(),
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    fn raw_hex(&self) -> String {
        serialize_hex(&self.to_block_header())
    }

    fn raw_json(&self) -> Value {
        json!({ "hex": self.raw_hex(), "height": self.height })
    }

    fn structured_json(&self) -> Value {
        let prev_block_hash = self
            .prev_block_hash
            .map_or_else(|| "00".repeat(32), |hash| hash.to_string());
        json!({
            "block_height": self.height,
            "prev_block_hash": prev_block_hash,
            "timestamp": self.time,
            "merkle_root": self.merkle_root,
            "version": self.version,
            "nonce": self.nonce,
            "bits": self.bits,
        })
    }
}

/// Find the height closest to a DD/MM/YYYY date by bisecting header
/// timestamps, used by the rescan helper.
pub fn search_height_for_date(rpc: &RpcClient, datestr: &str) -> Result<u32> {
    let target_time = chrono::NaiveDate::parse_from_str(datestr, "%d/%m/%Y")
        .with_context(|| format!("invalid date {}, expected DD/MM/YYYY", datestr))?
        .and_hms(0, 0, 0)
        .timestamp();

    let header_at = |height: u32| -> Result<GetBlockHeaderResult> {
        let hash = rpc.get_block_hash(height as u64)?;
        Ok(rpc.get_block_header_info(&hash)?)
    };

    let best = rpc.get_block_header_info(&rpc.get_best_block_hash()?)?;
    ensure!((best.time as i64) > target_time, "date is in the future");
    if (header_at(0)?.time as i64) > target_time {
        warn!("date is before the creation of bitcoin, rescanning from genesis");
        return Ok(0);
    }

    let mut first_height = 0u32;
    let mut last_height = best.height as u32;
    loop {
        let mid = (first_height + last_height) / 2;
        let mid_time = header_at(mid)?.time as i64;
        let time_diff = mid_time - target_time;
        if time_diff.abs() < 60 * 60 * 2 || last_height - first_height <= 1 {
            return Ok(mid);
        }
        if time_diff < 0 {
            first_height = mid;
        } else {
            last_height = mid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::consensus::encode::deserialize;
    use bitcoin::Network;
    use bitcoin_hashes::hex::FromHex;

    fn genesis_fields() -> HeaderFields {
        let genesis = genesis_block(Network::Bitcoin).header;
        HeaderFields {
            height: 0,
            version: genesis.version,
            prev_block_hash: None,
            merkle_root: genesis.merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        }
    }

    #[test]
    fn test_raw_header_is_80_bytes_and_canonical() {
        let hex = genesis_fields().raw_hex();
        assert_eq!(hex.len(), 160);
        assert_eq!(hex, serialize_hex(&genesis_block(Network::Bitcoin).header));
    }

    #[test]
    fn test_raw_header_roundtrip() {
        let fields = genesis_fields();
        let bytes = Vec::<u8>::from_hex(&fields.raw_hex()).unwrap();
        let decoded: BlockHeader = deserialize(&bytes).unwrap();
        assert_eq!(decoded, fields.to_block_header());
        assert_eq!(
            decoded.block_hash(),
            genesis_block(Network::Bitcoin).block_hash()
        );
    }

    #[test]
    fn test_structured_header_shape() {
        let genesis = genesis_block(Network::Bitcoin).header;
        let structured = genesis_fields().structured_json();
        assert_eq!(structured["block_height"], 0);
        assert_eq!(structured["prev_block_hash"], "00".repeat(32));
        assert_eq!(structured["timestamp"], genesis.time);
        assert_eq!(structured["version"], 1);
        assert_eq!(structured["bits"], 0x1d00ffff);
        assert_eq!(
            structured["merkle_root"],
            genesis.merkle_root.to_string().as_str()
        );
    }

    #[test]
    fn test_compact_target_parsing() {
        let mut info_bits = "1d00ffff";
        assert_eq!(u32::from_str_radix(info_bits, 16).unwrap(), 0x1d00ffff);
        info_bits = "17034219";
        assert_eq!(u32::from_str_radix(info_bits, 16).unwrap(), 0x17034219);
    }
}
