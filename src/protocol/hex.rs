use btoi::btou_radix;
use num_traits::{CheckedAdd, CheckedMul, FromPrimitive, Zero};

use crate::error::{Error, Result};

/// Decode a hex-formatted integer (no `0x` prefix, either case).
#[inline]
pub fn decode_hex<I>(buf: &[u8]) -> Result<I>
where
    I: FromPrimitive + Zero + CheckedAdd + CheckedMul,
{
    btou_radix(buf, 16).map_err(|_| Error::BadFormat)
}

fn ascii2byte(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode a two-character hex byte.
pub fn decode_hex_byte(buf: &[u8]) -> Result<u8> {
    match buf {
        [hi, lo] => match (ascii2byte(*hi), ascii2byte(*lo)) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(Error::BadFormat),
        },
        _ => Err(Error::BadFormat),
    }
}

/// Decode a hex string into `dst`. `src` must hold exactly `2 * dst.len()`
/// hex digits.
pub fn decode_hex_buf(src: &[u8], dst: &mut [u8]) -> Result<()> {
    if src.len() != dst.len() * 2 {
        return Err(Error::BadFormat);
    }
    for (i, out) in dst.iter_mut().enumerate() {
        *out = decode_hex_byte(&src[i * 2..i * 2 + 2])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_byte_roundtrip() {
        for b in 0..=255u8 {
            assert_eq!(decode_hex_byte(format!("{:02x}", b).as_bytes()).unwrap(), b);
            assert_eq!(decode_hex_byte(format!("{:02X}", b).as_bytes()).unwrap(), b);
        }
    }

    #[test]
    fn hex_byte_rejects_non_hex() {
        assert!(matches!(decode_hex_byte(b"GZ"), Err(Error::BadFormat)));
        assert!(matches!(decode_hex_byte(b"0"), Err(Error::BadFormat)));
        assert!(matches!(decode_hex_byte(b"000"), Err(Error::BadFormat)));
    }

    #[test]
    fn decode_hex_integers() {
        assert_eq!(decode_hex::<u32>(b"24000000").unwrap(), 0x2400_0000);
        assert_eq!(decode_hex::<usize>(b"1000").unwrap(), 0x1000);
        assert_eq!(decode_hex::<u32>(b"ffFF").unwrap(), 0xffff);
        assert!(decode_hex::<u32>(b"xyz").is_err());
        assert!(decode_hex::<u8>(b"100").is_err());
    }

    #[test]
    fn decode_buf_length_must_match() {
        let mut out = [0u8; 2];
        assert!(decode_hex_buf(b"deadbe", &mut out).is_err());
        decode_hex_buf(b"DEad", &mut out).unwrap();
        assert_eq!(out, [0xde, 0xad]);
    }
}
