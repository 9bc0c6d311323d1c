use anyhow::{bail, Result};

pub const VERSION_MAINNET: u8 = 50;
pub const VERSION_TESTNET: u8 = 109;

/// A payout address, decoded down to its hash-160 payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Address {
    h160: [u8; 20],
}

impl Address {
    /// Decodes a Base58Check address and checks the network version byte.
    pub fn decode(address: &str, testnet: bool) -> Result<Self> {
        let expected = if testnet {
            VERSION_TESTNET
        } else {
            VERSION_MAINNET
        };
        let Ok(raw) = bs58::decode(address).with_check(None).into_vec() else {
            bail!("Invalid address {address}");
        };
        if raw.first() != Some(&expected) {
            bail!("Invalid address {address}");
        }
        let Ok(h160) = raw[1..].try_into() else {
            bail!("Invalid address {address}");
        };
        Ok(Self { h160 })
    }

    /// Miner usernames may carry a rig suffix: `ADDRESS.worker`.
    pub fn from_worker(username: &str, testnet: bool) -> Result<Self> {
        let address = username.split('.').next().unwrap_or(username);
        Self::decode(address, testnet)
    }

    pub fn h160(&self) -> &[u8; 20] {
        &self.h160
    }
}

/// OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(h160: &[u8]) -> Vec<u8> {
    let mut data = vec![0x76, 0xa9, 0x14];
    data.extend_from_slice(h160);
    data.extend_from_slice(&[0x88, 0xac]);
    data
}

/// Payout script for the community autonomous address taken from the
/// template. The version byte is stripped without a network check; the node
/// is trusted to hand out an address for its own chain.
pub fn community_script(address: &str) -> Result<Vec<u8>> {
    let Ok(raw) = bs58::decode(address).with_check(None).into_vec() else {
        bail!("Invalid address {address}");
    };
    let Some(h160) = raw.get(1..) else {
        bail!("Invalid address {address}");
    };
    Ok(p2pkh_script(h160))
}

#[cfg(test)]
mod test {
    use super::*;

    const MAINNET_ADDR: &str = "M9N7VavuhG3bRFxPVMLPTMEvUvKCEobVUh";
    const TESTNET_ADDR: &str = "ktJhazWuauPHfqBVw6zC4kJLcgWrCKa7bd";
    const FOREIGN_ADDR: &str = "12TxGA2WCEsnXaz4GNgTD5db1hS2g3xN6E";
    const H160: [u8; 20] = [
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d,
        0x1e, 0x1f, 0x20, 0x21, 0x22, 0x23,
    ];

    #[test]
    fn test_decode() {
        let addr = Address::decode(MAINNET_ADDR, false).unwrap();
        assert_eq!(addr.h160(), &H160);

        let addr = Address::decode(TESTNET_ADDR, true).unwrap();
        assert_eq!(addr.h160(), &H160);
    }

    #[test]
    fn test_decode_rejects_wrong_network() {
        // a bitcoin-versioned address carrying the same payload
        assert!(Address::decode(FOREIGN_ADDR, false).is_err());
        assert!(Address::decode(FOREIGN_ADDR, true).is_err());
        // networks do not cross
        assert!(Address::decode(MAINNET_ADDR, true).is_err());
        assert!(Address::decode(TESTNET_ADDR, false).is_err());
        // mangled checksum
        assert!(Address::decode("M9N7VavuhG3bRFxPVMLPTMEvUvKCEobVUi", false).is_err());
    }

    #[test]
    fn test_from_worker_strips_suffix() {
        let plain = Address::from_worker(MAINNET_ADDR, false).unwrap();
        let suffixed =
            Address::from_worker(&format!("{MAINNET_ADDR}.rig0"), false).unwrap();
        assert_eq!(plain, suffixed);
    }

    #[test]
    fn test_p2pkh_script() {
        let addr = Address::decode(MAINNET_ADDR, false).unwrap();
        let script = p2pkh_script(addr.h160());
        assert_eq!(script.len(), 25);
        assert_eq!(&script[..3], &[0x76, 0xa9, 0x14]);
        assert_eq!(&script[3..23], &H160);
        assert_eq!(&script[23..], &[0x88, 0xac]);
    }

    #[test]
    fn test_community_script() {
        let script = community_script("MDkueyGYGwYY27iu6REUJKCSDxQjhE3CGs").unwrap();
        assert_eq!(
            hex::encode(script),
            "76a914404142434445464748494a4b4c4d4e4f5051525388ac"
        );
    }
}
