use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};

/// https://en.bitcoin.it/wiki/Protocol_documentation#Variable_length_integer
pub fn var_int(i: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    if i < 0xfd {
        out.push(i as u8);
    } else if i <= 0xffff {
        out.push(0xfd);
        let mut tmp = [0; 2];
        LittleEndian::write_u16(&mut tmp, i as u16);
        out.extend_from_slice(&tmp);
    } else if i <= 0xffff_ffff {
        out.push(0xfe);
        let mut tmp = [0; 4];
        LittleEndian::write_u32(&mut tmp, i as u32);
        out.extend_from_slice(&tmp);
    } else {
        out.push(0xff);
        let mut tmp = [0; 8];
        LittleEndian::write_u64(&mut tmp, i);
        out.extend_from_slice(&tmp);
    }
    out
}

/// Decodes a CompactSize from the front of `data`, returning the value and
/// how many bytes it occupied.
pub fn read_var_int(data: &[u8]) -> Result<(u64, usize)> {
    let Some(&first) = data.first() else {
        bail!("empty varint");
    };
    let (len, value) = match first {
        0xfd => (3, data.get(1..3).map(LittleEndian::read_u16).map(u64::from)),
        0xfe => (5, data.get(1..5).map(LittleEndian::read_u32).map(u64::from)),
        0xff => (9, data.get(1..9).map(LittleEndian::read_u64)),
        n => (1, Some(u64::from(n))),
    };
    match value {
        Some(v) => Ok((v, len)),
        None => bail!("truncated varint"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpData {
    inner: Vec<u8>,
}

impl OpData {
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.inner
    }

    pub fn var_push_num(mut self, i: u64) -> Self {
        self.inner.extend_from_slice(&var_int(i));
        self
    }

    pub fn push_u8(mut self, data: u8) -> Self {
        self.inner.push(data);
        self
    }

    pub fn push_u32(mut self, i: u32) -> Self {
        let mut data = [0; 4];
        LittleEndian::write_u32(&mut data, i);
        self.inner.extend_from_slice(&data);
        self
    }

    pub fn push_u64(mut self, i: u64) -> Self {
        let mut data = [0; 8];
        LittleEndian::write_u64(&mut data, i);
        self.inner.extend_from_slice(&data);
        self
    }

    pub fn push_slice(mut self, data: &[u8]) -> Self {
        self.inner.extend_from_slice(data);
        self
    }

    /// A PUSH opcode sized for `data`, then the raw bytes.
    pub fn op_push_slice(mut self, data: &[u8]) -> Self {
        match data.len() as u64 {
            n if n < 0x4c => {
                self.inner.push(n as u8);
            }
            n if n <= 0xff => {
                self.inner.push(0x4c);
                self.inner.push(n as u8);
            }
            n if n <= 0xffff => {
                self.inner.push(0x4d);
                let mut tmp = [0; 2];
                LittleEndian::write_u16(&mut tmp, n as u16);
                self.inner.extend_from_slice(&tmp);
            }
            n if n <= 0xffff_ffff => {
                self.inner.push(0x4e);
                let mut tmp = [0; 4];
                LittleEndian::write_u32(&mut tmp, n as u32);
                self.inner.extend_from_slice(&tmp);
            }
            _ => panic!("tried to put a 4bn+ sized object into a script!"),
        }
        self.inner.extend_from_slice(data);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_var_int() {
        assert_eq!(var_int(0), vec![0x00]);
        assert_eq!(var_int(252), vec![0xfc]);
        assert_eq!(var_int(253), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(var_int(0xffff), vec![0xfd, 0xff, 0xff]);
        assert_eq!(var_int(65536), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            var_int(1 << 32),
            vec![0xff, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_var_int_round_trip() {
        for i in [
            0u64,
            1,
            0xfc,
            0xfd,
            0xffff,
            0x10000,
            0xffff_ffff,
            0x1_0000_0000,
            u64::MAX,
        ] {
            let encoded = var_int(i);
            let (decoded, used) = read_var_int(&encoded).unwrap();
            assert_eq!(decoded, i);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn test_read_var_int_truncated() {
        assert!(read_var_int(&[]).is_err());
        assert!(read_var_int(&[0xfd, 0x01]).is_err());
        assert!(read_var_int(&[0xff, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_op_push_slice() {
        let short = OpData::default().op_push_slice(&[0xab; 3]);
        assert_eq!(short.as_slice(), &[0x03, 0xab, 0xab, 0xab]);

        let one_byte_len = OpData::default().op_push_slice(&[0; 0x4c]);
        assert_eq!(&one_byte_len.as_slice()[..2], &[0x4c, 0x4c]);
        assert_eq!(one_byte_len.as_slice().len(), 2 + 0x4c);

        let two_byte_len = OpData::default().op_push_slice(&[0; 0x100]);
        assert_eq!(&two_byte_len.as_slice()[..3], &[0x4d, 0x00, 0x01]);

        let four_byte_len = OpData::default().op_push_slice(&[0; 0x10000]);
        assert_eq!(
            &four_byte_len.as_slice()[..5],
            &[0x4e, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_builder() {
        let data = OpData::default()
            .push_u32(1)
            .push_u8(0xaa)
            .push_u64(2)
            .push_slice(&[0xbb, 0xcc])
            .var_push_num(253);
        assert_eq!(
            data.as_slice(),
            &[1, 0, 0, 0, 0xaa, 2, 0, 0, 0, 0, 0, 0, 0, 0xbb, 0xcc, 0xfd, 0xfd, 0x00]
        );
    }
}
