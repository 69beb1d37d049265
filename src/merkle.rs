use bitcoin::Txid;
use bitcoin_hashes::{sha256d, Hash};

use crate::error::{OptionExt, Result};

/// An Electrum-style SPV proof extracted from the node's `gettxoutproof` blob.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ElectrumMerkleProof {
    pub pos: usize,
    pub merkle: Vec<sha256d::Hash>,
    pub merkle_root: sha256d::Hash,
}

/// Rewrite a `gettxoutproof` blob (an 80-byte header followed by a serialized
/// partial merkle tree) into the leaf position and the leaf-to-root branch of
/// the single transaction the proof commits to.
pub fn convert_core_proof(raw: &[u8]) -> Result<ElectrumMerkleProof> {
    ensure!(raw.len() > 84, "proof too short");
    let header_root = sha256d::Hash::from_slice(&raw[36..68]).expect("32 bytes");

    let mut cursor = Cursor::new(&raw[80..]);
    let ntx = cursor.read_u32()? as usize;
    ensure!(ntx > 0, "empty block in proof");

    let hash_count = cursor.read_varint()? as usize;
    ensure!(hash_count <= ntx, "more hashes than transactions");
    let hashes = (0..hash_count)
        .map(|_| cursor.read_hash())
        .collect::<Result<Vec<_>>>()?;

    let flag_byte_count = cursor.read_varint()? as usize;
    let flag_bytes = cursor.read_bytes(flag_byte_count)?;

    let mut tree = PartialTree {
        ntx,
        hashes: &hashes,
        flag_bytes,
        next_hash: 0,
        next_bit: 0,
    };
    let (root, matched) = tree.traverse(tree_height(ntx), 0)?;
    let (pos, merkle) = matched.or_err("proof does not commit to any transaction")?;

    ensure!(
        root == header_root,
        "partial merkle tree root does not match the block header"
    );

    Ok(ElectrumMerkleProof {
        pos,
        merkle,
        merkle_root: root,
    })
}

/// Recombine a leaf with its branch, the verification side of the proof.
pub fn merkle_root_from_branch(
    txid: &Txid,
    pos: usize,
    branch: &[sha256d::Hash],
) -> sha256d::Hash {
    let mut hash = sha256d::Hash::from(*txid);
    for (level, sibling) in branch.iter().enumerate() {
        hash = iif!(
            (pos >> level) & 1 == 1,
            merklize(*sibling, hash),
            merklize(hash, *sibling)
        );
    }
    hash
}

fn merklize(left: sha256d::Hash, right: sha256d::Hash) -> sha256d::Hash {
    let data = [&left[..], &right[..]].concat();
    sha256d::Hash::hash(&data)
}

// number of tree levels above the leaves
fn tree_height(ntx: usize) -> u32 {
    let mut height = 0;
    while (1usize << height) < ntx {
        height += 1;
    }
    height
}

struct PartialTree<'a> {
    ntx: usize,
    hashes: &'a [sha256d::Hash],
    flag_bytes: &'a [u8],
    next_hash: usize,
    next_bit: usize,
}

type MatchedLeaf = Option<(usize, Vec<sha256d::Hash>)>;

impl<'a> PartialTree<'a> {
    // Reproduces the reference traversal order: pop one flag bit per node;
    // a cleared bit (or a leaf) consumes a hash for the whole subtree, a set
    // inner bit descends left then right. The branch for the matched leaf is
    // collected from the sibling hashes while unwinding.
    fn traverse(&mut self, height: u32, pos: usize) -> Result<(sha256d::Hash, MatchedLeaf)> {
        let flag = self.pop_bit()?;
        if height == 0 || !flag {
            let hash = self.pop_hash()?;
            let matched = iif!(height == 0 && flag, Some((pos, vec![])), None);
            return Ok((hash, matched));
        }

        let (left, left_match) = self.traverse(height - 1, pos * 2)?;
        let (right, right_match) = if pos * 2 + 1 < self.level_width(height - 1) {
            self.traverse(height - 1, pos * 2 + 1)?
        } else {
            // a level with an odd node count pairs the last node with itself
            (left, None)
        };

        let matched = match (left_match, right_match) {
            (Some((pos, mut branch)), None) => {
                branch.push(right);
                Some((pos, branch))
            }
            (None, Some((pos, mut branch))) => {
                branch.push(left);
                Some((pos, branch))
            }
            (None, None) => None,
            (Some(..), Some(..)) => bail!("proof commits to more than one transaction"),
        };

        Ok((merklize(left, right), matched))
    }

    fn level_width(&self, height: u32) -> usize {
        (self.ntx + (1 << height) - 1) >> height
    }

    fn pop_bit(&mut self) -> Result<bool> {
        let index = self.next_bit;
        ensure!(index / 8 < self.flag_bytes.len(), "flag bits exhausted");
        self.next_bit += 1;
        Ok((self.flag_bytes[index / 8] >> (index % 8)) & 1 == 1)
    }

    fn pop_hash(&mut self) -> Result<sha256d::Hash> {
        let hash = self.hashes.get(self.next_hash).or_err("hashes exhausted")?;
        self.next_hash += 1;
        Ok(*hash)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).or_err("proof length overflow")?;
        ensure!(end <= self.data.len(), "proof truncated");
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_varint(&mut self) -> Result<u64> {
        let first = self.read_bytes(1)?[0];
        Ok(match first {
            0xFF => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(self.read_bytes(8)?);
                u64::from_le_bytes(buf)
            }
            0xFE => u64::from(self.read_u32()?),
            0xFD => {
                let mut buf = [0u8; 2];
                buf.copy_from_slice(self.read_bytes(2)?);
                u64::from(u16::from_le_bytes(buf))
            }
            n => u64::from(n),
        })
    }

    fn read_hash(&mut self) -> Result<sha256d::Hash> {
        Ok(sha256d::Hash::from_slice(self.read_bytes(32)?).expect("32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An independent proof builder mirroring the serialization side of the
    // partial merkle tree, so the parser is tested against the build
    // direction rather than against itself.
    fn build_proof(txids: &[sha256d::Hash], match_index: usize) -> Vec<u8> {
        let ntx = txids.len();
        let height = tree_height(ntx);

        let mut bits = vec![];
        let mut hashes = vec![];
        build_subtree(txids, match_index, height, 0, &mut bits, &mut hashes);

        let mut blob = vec![0u8; 80];
        blob[36..68].copy_from_slice(&full_root(txids)[..]);
        blob.extend_from_slice(&(ntx as u32).to_le_bytes());
        assert!(hashes.len() < 0xFD && bits.len() < 8 * 0xFD);
        blob.push(hashes.len() as u8);
        for hash in &hashes {
            blob.extend_from_slice(&hash[..]);
        }
        let mut flag_bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                flag_bytes[i / 8] |= 1 << (i % 8);
            }
        }
        blob.push(flag_bytes.len() as u8);
        blob.extend_from_slice(&flag_bytes);
        blob
    }

    fn build_subtree(
        txids: &[sha256d::Hash],
        match_index: usize,
        height: u32,
        pos: usize,
        bits: &mut Vec<bool>,
        hashes: &mut Vec<sha256d::Hash>,
    ) {
        let first_leaf = pos << height;
        let last_leaf = ((pos + 1) << height).min(txids.len());
        let has_match = (first_leaf..last_leaf).contains(&match_index);
        bits.push(has_match);
        if height == 0 || !has_match {
            hashes.push(subtree_hash(txids, height, pos));
        } else {
            build_subtree(txids, match_index, height - 1, pos * 2, bits, hashes);
            let width = (txids.len() + (1 << (height - 1)) - 1) >> (height - 1);
            if pos * 2 + 1 < width {
                build_subtree(txids, match_index, height - 1, pos * 2 + 1, bits, hashes);
            }
        }
    }

    fn subtree_hash(txids: &[sha256d::Hash], height: u32, pos: usize) -> sha256d::Hash {
        if height == 0 {
            return txids[pos];
        }
        let left = subtree_hash(txids, height - 1, pos * 2);
        let width = (txids.len() + (1 << (height - 1)) - 1) >> (height - 1);
        let right = iif!(
            pos * 2 + 1 < width,
            subtree_hash(txids, height - 1, pos * 2 + 1),
            left
        );
        merklize(left, right)
    }

    fn full_root(txids: &[sha256d::Hash]) -> sha256d::Hash {
        let mut level = txids.to_vec();
        while level.len() > 1 {
            if level.len() % 2 != 0 {
                let last = *level.last().unwrap();
                level.push(last);
            }
            level = level
                .chunks(2)
                .map(|pair| merklize(pair[0], pair[1]))
                .collect();
        }
        level[0]
    }

    fn dummy_txids(ntx: usize) -> Vec<sha256d::Hash> {
        (0..ntx)
            .map(|n| sha256d::Hash::hash(&(n as u32).to_le_bytes()))
            .collect()
    }

    #[test]
    fn test_convert_single_tx_block() {
        let txids = dummy_txids(1);
        let proof = convert_core_proof(&build_proof(&txids, 0)).unwrap();
        assert_eq!(proof.pos, 0);
        assert_eq!(proof.merkle, vec![]);
        assert_eq!(proof.merkle_root, txids[0]);
    }

    #[test]
    fn test_convert_various_block_sizes() {
        for &ntx in &[2usize, 3, 5, 7, 8, 13, 33] {
            let txids = dummy_txids(ntx);
            let expected_root = full_root(&txids);
            for match_index in 0..ntx {
                let proof = convert_core_proof(&build_proof(&txids, match_index)).unwrap();
                assert_eq!(proof.pos, match_index, "ntx={}", ntx);
                assert_eq!(proof.merkle_root, expected_root, "ntx={}", ntx);
                assert_eq!(proof.merkle.len() as u32, tree_height(ntx));

                // the branch must recombine with the txid back to the root
                let txid = bitcoin::Txid::from(txids[match_index]);
                let implied = merkle_root_from_branch(&txid, proof.pos, &proof.merkle);
                assert_eq!(implied, expected_root, "ntx={}", ntx);
            }
        }
    }

    #[test]
    fn test_reject_malformed_proofs() {
        let txids = dummy_txids(5);
        let blob = build_proof(&txids, 3);

        // truncated
        assert!(convert_core_proof(&blob[..blob.len() - 1]).is_err());
        assert!(convert_core_proof(&blob[..60]).is_err());

        // header root tampered with
        let mut tampered = blob.clone();
        tampered[36] ^= 1;
        assert!(convert_core_proof(&tampered).is_err());

        // no transaction marked as matched
        let mut no_match = blob;
        let flags_at = no_match.len() - 1;
        no_match[flags_at] = 0;
        assert!(convert_core_proof(&no_match).is_err());
    }
}
