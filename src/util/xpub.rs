use std::str::FromStr;

use serde::de;

use bitcoin::hashes::{hash160, hex::FromHex, hex::ToHex, Hash};
use bitcoin::secp256k1;
use bitcoin::util::base58;
use bitcoin::util::bip32::{ChildNumber, ExtendedPubKey, Fingerprint};
use bitcoin::{Network, PublicKey};

use crate::error::{Context, Result};
use crate::types::ScriptType;
use crate::util::EC;

/// A master public key with an associated script type.
///
/// Covers SLIP 32 [xyz]pubs as well as the legacy 128-hex-character master
/// public keys exported by old Electrum seeds (always p2pkh, uncompressed).
#[derive(Clone)]
pub struct MasterPubKey {
    pub key: MasterKey,
    pub script_type: ScriptType,
}

#[derive(Clone)]
pub enum MasterKey {
    Xpub(ExtendedPubKey),
    Legacy(LegacyMpk),
}

#[derive(Clone)]
pub struct LegacyMpk {
    point: secp256k1::PublicKey,
    raw: Vec<u8>, // the 64-byte uncompressed point, without the 0x04 prefix
}

impl_string_serializer!(
    MasterPubKey,
    mpk,
    match &mpk.key {
        MasterKey::Xpub(xpub) => xpub.to_string(),
        MasterKey::Legacy(legacy) => legacy.raw.to_hex(),
    }
);
impl_debug_display!(MasterPubKey);

impl MasterPubKey {
    pub fn matches_network(&self, network: Network) -> bool {
        match &self.key {
            // testnet and regtest share the same bip32 version bytes,
            // and are therefore always identified as testnet.
            MasterKey::Xpub(xpub) => {
                xpub.network == network
                    || (xpub.network == Network::Testnet && network == Network::Regtest)
            }
            // legacy keys carry no network marker
            MasterKey::Legacy(..) => true,
        }
    }

    /// Derive the public key at m/<change>/<index>
    pub fn derive_pubkey(&self, change: u32, index: u32) -> Result<PublicKey> {
        match &self.key {
            MasterKey::Xpub(xpub) => {
                let child = xpub.derive_pub(
                    &*EC,
                    &[ChildNumber::from(change), ChildNumber::from(index)],
                )?;
                Ok(child.public_key)
            }
            MasterKey::Legacy(legacy) => legacy.derive_pubkey(change, index),
        }
    }

    /// A stable identifier for the (key, change) chain, used to associate
    /// derived scripts back to their wallet.
    pub fn chain_fingerprint(&self, change: u32) -> Result<Fingerprint> {
        match &self.key {
            MasterKey::Xpub(xpub) => Ok(xpub
                .derive_pub(&*EC, &[ChildNumber::from(change)])?
                .fingerprint()),
            MasterKey::Legacy(legacy) => {
                let mut data = legacy.raw.clone();
                data.push(change as u8);
                let id = hash160::Hash::hash(&data);
                Ok(Fingerprint::from(&id[0..4]))
            }
        }
    }
}

impl LegacyMpk {
    /// Old-style Electrum derivation: master + dsha256("index:change:" ++ mpk) * G
    fn derive_pubkey(&self, change: u32, index: u32) -> Result<PublicKey> {
        let mut tweak_input = format!("{}:{}:", index, change).into_bytes();
        tweak_input.extend_from_slice(&self.raw);
        let tweak = bitcoin::hashes::sha256d::Hash::hash(&tweak_input);

        let mut point = self.point;
        point
            .add_exp_assign(&*EC, &tweak[..])
            .context("legacy mpk derivation overflowed the curve order")?;

        Ok(PublicKey {
            compressed: false,
            key: point,
        })
    }
}

impl FromStr for MasterPubKey {
    type Err = crate::error::Error;

    fn from_str(inp: &str) -> Result<MasterPubKey> {
        let mut parts = inp.splitn(2, ':');
        let key_str = parts.next().unwrap();

        if key_str.len() == 128 && key_str.chars().all(|c| c.is_ascii_hexdigit()) {
            ensure!(
                parts.next().is_none(),
                "legacy master public keys are always p2pkh"
            );
            let raw = Vec::<u8>::from_hex(key_str)?;
            let mut point_bytes = vec![0x04u8];
            point_bytes.extend_from_slice(&raw);
            let point = secp256k1::PublicKey::from_slice(&point_bytes)
                .context("legacy master public key is not a valid curve point")?;
            return Ok(MasterPubKey {
                key: MasterKey::Legacy(LegacyMpk { point, raw }),
                script_type: ScriptType::P2pkh,
            });
        }

        let mut data = base58::from_check(key_str)?;
        if data.len() != 78 {
            bail!(base58::Error::InvalidLength(data.len()));
        }

        // rust-bitcoin's bip32 implementation does not support ypubs/zpubs.
        // instead, figure out the network and script type ourselves and feed
        // rust-bitcoin with a modified key that uses the version bytes it expects.
        let version = &data[0..4];
        let (network, mut script_type) = parse_xyz_version(version)?;
        data.splice(0..4, get_xpub_p2pkh_version(network).iter().cloned());

        let xpub = ExtendedPubKey::decode(&data)?;

        if let Some(explicit_type_str) = parts.next() {
            script_type = parse_script_type(explicit_type_str)?;
        }

        Ok(MasterPubKey {
            key: MasterKey::Xpub(xpub),
            script_type,
        })
    }
}

// Deserialize using the FromStr implementation
impl<'de> de::Deserialize<'de> for MasterPubKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

fn parse_xyz_version(version: &[u8]) -> Result<(Network, ScriptType)> {
    Ok(match version {
        [0x04u8, 0x88, 0xB2, 0x1E] => (Network::Bitcoin, ScriptType::P2pkh),
        [0x04u8, 0xB2, 0x47, 0x46] => (Network::Bitcoin, ScriptType::P2wpkh),
        [0x04u8, 0x9D, 0x7C, 0xB2] => (Network::Bitcoin, ScriptType::P2shP2wpkh),

        [0x04u8, 0x35, 0x87, 0xCF] => (Network::Testnet, ScriptType::P2pkh),
        [0x04u8, 0x5F, 0x1C, 0xF6] => (Network::Testnet, ScriptType::P2wpkh),
        [0x04u8, 0x4A, 0x52, 0x62] => (Network::Testnet, ScriptType::P2shP2wpkh),

        _ => bail!("unrecognized master public key version bytes {:?}", version),
    })
}

fn get_xpub_p2pkh_version(network: Network) -> [u8; 4] {
    match network {
        Network::Bitcoin => [0x04u8, 0x88, 0xB2, 0x1E],
        Network::Testnet | Network::Regtest | Network::Signet => [0x04u8, 0x35, 0x87, 0xCF],
    }
}

fn parse_script_type(s: &str) -> Result<ScriptType> {
    Ok(match s {
        "p2pkh" => ScriptType::P2pkh,
        "p2wpkh" => ScriptType::P2wpkh,
        "p2sh-p2wpkh" => ScriptType::P2shP2wpkh,
        _ => bail!("unknown script type {}", s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const XPUB: &str = "xpub661MyMwAqRbcFLqTBCNzuoj4FYE1xRxmCjrSWC6LUjKHo46Du4NacKgxdrJPWhzLjkPsXqnjAUwn1raMSWfxWZKysPoBNQMZMs8b5JM8egC";
    const YPUB: &str = "ypub6QqdH2c5z7966e2a1ZAd7tpZRWNTu3xG7rNfHazDrjhAr9uT9iY9EPM6f4FyWceG9PWgHKPHd9JKu9BvAD5yJo1ajjVbxKB3dbCETvZ3Jzw";
    const ZPUB: &str = "zpub6jftahH18ngZwwDgquxFKyv4bUWuqfwm2xtt4yt7Ek53uFigQNhhrT1EgGDZWXJBZ2dV2nyr5oesnRoUsuVz72hBc5C2YDzXuKFsrTu7JHp";
    // the generator point, a valid uncompressed key
    const LEGACY: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

    #[test]
    fn test_parse_slip32_script_types() {
        let test_cases = [
            (XPUB, ScriptType::P2pkh),
            (YPUB, ScriptType::P2shP2wpkh),
            (ZPUB, ScriptType::P2wpkh),
        ];
        for (key_str, expected_type) in &test_cases {
            let mpk = key_str.parse::<MasterPubKey>().unwrap();
            assert_eq!(mpk.script_type, *expected_type);
            assert!(mpk.matches_network(Network::Bitcoin));
            assert!(!mpk.matches_network(Network::Testnet));
        }
    }

    #[test]
    fn test_explicit_script_type_override() {
        let mpk = format!("{}:p2wpkh", XPUB).parse::<MasterPubKey>().unwrap();
        assert_eq!(mpk.script_type, ScriptType::P2wpkh);
    }

    #[test]
    fn test_parse_legacy_mpk() {
        let mpk = LEGACY.parse::<MasterPubKey>().unwrap();
        assert_eq!(mpk.script_type, ScriptType::P2pkh);
        assert!(mpk.matches_network(Network::Bitcoin));
        assert_eq!(mpk.to_string(), LEGACY);
    }

    #[test]
    fn test_legacy_derivation_is_deterministic() {
        let mpk = LEGACY.parse::<MasterPubKey>().unwrap();
        let first = mpk.derive_pubkey(0, 0).unwrap();
        assert!(!first.compressed);
        assert_eq!(first, mpk.derive_pubkey(0, 0).unwrap());
        assert_ne!(first, mpk.derive_pubkey(0, 1).unwrap());
        assert_ne!(first, mpk.derive_pubkey(1, 0).unwrap());
    }

    #[test]
    fn test_reject_invalid_keys() {
        assert!("".parse::<MasterPubKey>().is_err());
        assert!("xpub1234".parse::<MasterPubKey>().is_err());
        // valid hex length but not a curve point
        assert!("00".repeat(64).parse::<MasterPubKey>().is_err());
    }
}
