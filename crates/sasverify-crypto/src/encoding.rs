//! Base64 flavours used on the wire.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use subtle::ConstantTimeEq;

/// Standard alphabet, no padding on output, padding tolerated on input.
const UNPADDED: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const STANDARD_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    UNPADDED.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    UNPADDED.decode(text)
}

/// Encode the way the legacy `hkdf-hmac-sha256` MAC was produced: the
/// encoder ran in place over the buffer still holding its input, so output
/// quads overwrite input bytes before they are read.
pub(crate) fn encode_in_place_legacy(input: &[u8]) -> String {
    let n = input.len();
    let encoded_len = 4 * (n / 3)
        + match n % 3 {
            0 => 0,
            1 => 2,
            _ => 3,
        };
    let mut buf = vec![0u8; encoded_len.max(n)];
    buf[..n].copy_from_slice(input);

    let symbol = |value: u32| STANDARD_ALPHABET[(value & 0x3f) as usize];
    let end = (n / 3) * 3;
    let mut pos = 0;
    let mut out = 0;
    while pos != end {
        let mut value = u32::from(buf[pos]);
        value = (value << 8) | u32::from(buf[pos + 1]);
        value = (value << 8) | u32::from(buf[pos + 2]);
        pos += 3;
        buf[out + 3] = symbol(value);
        value >>= 6;
        buf[out + 2] = symbol(value);
        value >>= 6;
        buf[out + 1] = symbol(value);
        value >>= 6;
        buf[out] = symbol(value);
        out += 4;
    }

    let remainder = n - pos;
    if remainder > 0 {
        let mut value = u32::from(buf[pos]);
        if remainder == 2 {
            value = (value << 8) | u32::from(buf[pos + 1]);
            value <<= 2;
            buf[out + 2] = symbol(value);
            value >>= 6;
        } else {
            value <<= 4;
        }
        buf[out + 1] = symbol(value);
        value >>= 6;
        buf[out] = symbol(value);
    }

    buf.truncate(encoded_len);
    // Every byte was written from the alphabet above.
    buf.into_iter().map(char::from).collect()
}

/// Compare two strings without leaking the position of the first mismatch.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpadded_roundtrip_accepts_padding() {
        assert_eq!(encode(b"ab"), "YWI");
        assert_eq!(decode("YWI").unwrap(), b"ab");
        assert_eq!(decode("YWI=").unwrap(), b"ab");
    }

    #[test]
    fn legacy_matches_standard_for_short_input() {
        // With fewer than four input bytes no input is overwritten before
        // it is read, so both encoders agree.
        assert_eq!(encode_in_place_legacy(b"abc"), encode(b"abc"));
        assert_eq!(encode_in_place_legacy(b"a"), encode(b"a"));
    }

    #[test]
    fn legacy_diverges_for_mac_sized_input() {
        let input: Vec<u8> = (0u8..32).collect();
        let legacy = encode_in_place_legacy(&input);
        assert_eq!(legacy.len(), 43);
        assert_ne!(legacy, encode(&input));
        // The first quad is encoded before anything is overwritten.
        assert_eq!(&legacy[..4], &encode(&input)[..4]);
        assert!(legacy.bytes().all(|b| STANDARD_ALPHABET.contains(&b)));
    }

    #[test]
    fn constant_time_eq() {
        assert!(constant_time_str_eq("abc", "abc"));
        assert!(!constant_time_str_eq("abc", "abd"));
        assert!(!constant_time_str_eq("abc", "abcd"));
    }
}
