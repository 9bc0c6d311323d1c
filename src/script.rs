use crate::op_data::OpData;

/// Arbitrary data pushed after the BIP34 height. The height push plus this
/// tag must stay well inside the coinbase script data limit.
pub const COINBASE_TAG: &str = "/mewc-stratum-proxy/";

/// Minimal little-endian encoding of the block height, per BIP34.
pub fn bip34_height_push(height: u32) -> Vec<u8> {
    let mut bytes_needed = 1;
    while u64::from(height) > (1u64 << (7 + 8 * (bytes_needed - 1))) - 1 {
        bytes_needed += 1;
    }
    u64::from(height).to_le_bytes()[..bytes_needed].to_vec()
}

pub fn coinbase_script(height: u32, tag: &str) -> Vec<u8> {
    let bip34_height = bip34_height_push(height);
    OpData::default()
        .op_push_slice(&bip34_height)
        .op_push_slice(tag.as_bytes())
        .into_vec()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bip34_height_push() {
        assert_eq!(bip34_height_push(1), vec![0x01]);
        assert_eq!(bip34_height_push(127), vec![0x7f]);
        assert_eq!(bip34_height_push(128), vec![0x80, 0x00]);
        assert_eq!(bip34_height_push(255), vec![0xff, 0x00]);
        assert_eq!(bip34_height_push(256), vec![0x00, 0x01]);
        assert_eq!(bip34_height_push(32767), vec![0xff, 0x7f]);
        assert_eq!(bip34_height_push(32768), vec![0x00, 0x80, 0x00]);
        assert_eq!(bip34_height_push(2491604), vec![0xd4, 0x04, 0x26]);
    }

    #[test]
    fn test_coinbase_script() {
        let script = coinbase_script(2491604, COINBASE_TAG);
        assert_eq!(
            hex::encode(&script),
            "03d40426142f6d6577632d7374726174756d2d70726f78792f"
        );
        // tag plus height push must leave room to spare under the 100-byte cap
        assert!(script.len() <= 100);
    }
}
