//! Variable-length integers as they appear on the wire: big-endian groups of 7 bits, each byte
//!  except the last one with its high bit set.
//!
//! ```ascii
//!   0x7f        -> 7f
//!   0x80        -> 81 00
//!   0x3fff      -> ff 7f
//!   0x4000      -> 81 80 00
//! ```
//!
//! 32-bit values take at most 5 bytes, 64-bit values at most 10 bytes. Readers reject longer
//!  sequences and values that overflow the target type.

use bytes::{Buf, BufMut};
use crate::error::RtmfpError;

pub const MAX_LEN_U32: usize = 5;
pub const MAX_LEN_U64: usize = 10;

pub fn size_7bit_u64(value: u64) -> usize {
    let significant_bits = 64 - value.leading_zeros() as usize;
    significant_bits.div_ceil(7).max(1)
}

pub fn size_7bit_u32(value: u32) -> usize {
    size_7bit_u64(value as u64)
}

pub trait SevenBitSupportMut: BufMut {
    fn put_7bit_u64(&mut self, value: u64) {
        let len = size_7bit_u64(value);
        for i in (1..len).rev() {
            self.put_u8(0x80 | ((value >> (7 * i)) & 0x7f) as u8);
        }
        self.put_u8((value & 0x7f) as u8);
    }

    fn put_7bit_u32(&mut self, value: u32) {
        self.put_7bit_u64(value as u64);
    }
}
impl <T: BufMut + ?Sized> SevenBitSupportMut for T {}

pub trait SevenBitSupport: Buf {
    fn try_get_7bit_u64(&mut self) -> anyhow::Result<u64> {
        read_7bit(self, MAX_LEN_U64)
    }

    fn try_get_7bit_u32(&mut self) -> anyhow::Result<u32> {
        let raw = read_7bit(self, MAX_LEN_U32)?;
        u32::try_from(raw)
            .map_err(|_| RtmfpError::formatting(format!("7-bit value {} exceeds 32 bits", raw)))
    }
}
impl <T: Buf + ?Sized> SevenBitSupport for T {}

fn read_7bit<B: Buf + ?Sized>(buf: &mut B, max_len: usize) -> anyhow::Result<u64> {
    let mut result = 0u64;
    for _ in 0..max_len {
        let b = buf.try_get_u8()
            .map_err(|_| RtmfpError::formatting("truncated 7-bit value"))?;

        if result >> 57 != 0 {
            return Err(RtmfpError::formatting("7-bit value exceeds 64 bits"));
        }
        result = (result << 7) | (b & 0x7f) as u64;

        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(RtmfpError::formatting(format!("7-bit value longer than {} bytes", max_len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, vec![0])]
    #[case::one(1, vec![1])]
    #[case::max_1(0x7f, vec![0x7f])]
    #[case::min_2(0x80, vec![0x81, 0])]
    #[case::max_2(0x3fff, vec![0xff, 0x7f])]
    #[case::min_3(0x4000, vec![0x81, 0x80, 0])]
    #[case::max_3(0x1f_ffff, vec![0xff, 0xff, 0x7f])]
    #[case::min_4(0x20_0000, vec![0x81, 0x80, 0x80, 0])]
    #[case::max_4(0x0fff_ffff, vec![0xff, 0xff, 0xff, 0x7f])]
    #[case::min_5(0x1000_0000, vec![0x81, 0x80, 0x80, 0x80, 0])]
    #[case::u32_max(u32::MAX, vec![0x8f, 0xff, 0xff, 0xff, 0x7f])]
    fn test_u32(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_7bit_u32(value);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(size_7bit_u32(value), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(b.try_get_7bit_u32().unwrap(), value);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::stage(300, 2)]
    #[case::max_8(0x00ff_ffff_ffff_ffff, 8)]
    #[case::min_9(0x0100_0000_0000_0000, 9)]
    #[case::max_9(0x7fff_ffff_ffff_ffff, 9)]
    #[case::min_10(0x8000_0000_0000_0000, 10)]
    #[case::u64_max(u64::MAX, 10)]
    fn test_u64(#[case] value: u64, #[case] expected_len: usize) {
        let mut buf = BytesMut::new();
        buf.put_7bit_u64(value);
        assert_eq!(buf.len(), expected_len);
        assert_eq!(size_7bit_u64(value), expected_len);
        assert!(buf[..expected_len-1].iter().all(|b| b & 0x80 != 0));
        assert_eq!(buf[expected_len-1] & 0x80, 0);

        let mut b: &[u8] = &buf;
        assert_eq!(b.try_get_7bit_u64().unwrap(), value);
        assert!(b.is_empty());
    }

    #[test]
    fn test_all_length_boundaries() {
        for bits in 0..64 {
            for value in [(1u64 << bits) - 1, 1u64 << bits, (1u64 << bits) + 1] {
                let mut buf = BytesMut::new();
                buf.put_7bit_u64(value);
                assert_eq!(buf.len(), size_7bit_u64(value), "value {}", value);
                let mut b: &[u8] = &buf;
                assert_eq!(b.try_get_7bit_u64().unwrap(), value);
            }
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![0x81])]
    #[case::truncated_long(vec![0x81, 0x80, 0x80])]
    #[case::too_long_u32(vec![0x80, 0x80, 0x80, 0x80, 0x80, 0x01])]
    #[case::overflow_u32(vec![0x90, 0x80, 0x80, 0x80, 0x00])]
    fn test_u32_malformed(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        let e = b.try_get_7bit_u32().unwrap_err();
        assert!(matches!(RtmfpError::of(&e), Some(RtmfpError::Formatting(_))));
    }

    #[rstest]
    #[case::too_long(vec![0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01])]
    #[case::overflow(vec![0x82, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00])]
    fn test_u64_malformed(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        let e = b.try_get_7bit_u64().unwrap_err();
        assert!(matches!(RtmfpError::of(&e), Some(RtmfpError::Formatting(_))));
    }

    #[test]
    fn test_sequence() {
        let mut buf = BytesMut::new();
        buf.put_7bit_u64(5);
        buf.put_7bit_u32(0x3f00);
        buf.put_7bit_u64(1_000_000);

        let mut b: &[u8] = &buf;
        assert_eq!(b.try_get_7bit_u64().unwrap(), 5);
        assert_eq!(b.try_get_7bit_u32().unwrap(), 0x3f00);
        assert_eq!(b.try_get_7bit_u64().unwrap(), 1_000_000);
        assert!(b.is_empty());
    }
}
