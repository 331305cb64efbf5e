use hmac::{Hmac, Mac};
use md5::Digest as _;
use sha2::Sha256;

pub fn hex(data: impl AsRef<[u8]>) -> String {
    hex_simd::encode_to_string(data.as_ref(), hex_simd::AsciiCase::Lower)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex(sha256(data))
}

pub fn hex_md5(data: &[u8]) -> String {
    let mut hasher = md5::Md5::new();
    hasher.update(data);
    hex(hasher.finalize())
}

/// # Panics
/// HMAC-SHA256 accepts keys of any length.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256>>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn base64_encode(data: &[u8]) -> String {
    base64_simd::STANDARD.encode_to_string(data)
}

pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    base64_simd::STANDARD.decode_to_vec(data).ok()
}

/// Trims and collapses internal whitespace runs to a single space,
/// as required for canonical header values.
pub fn fold_whitespace(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_run = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_whitespace() {
            in_run = true;
        } else {
            if in_run && !out.is_empty() {
                out.push(' ');
            }
            in_run = false;
            out.push(ch);
        }
    }
    out
}

pub fn stable_sort_by_first<T: Ord, U>(pairs: &mut [(T, U)]) {
    pairs.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
}

pub fn epoch_millis() -> u64 {
    let now = time::OffsetDateTime::now_utc();
    u64::try_from(now.unix_timestamp_nanos() / 1_000_000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_whitespace_compresses_runs() {
        assert_eq!(fold_whitespace("  a   b\t c  "), "a b c");
        assert_eq!(fold_whitespace("plain"), "plain");
        assert_eq!(fold_whitespace(""), "");
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(hex_md5(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn base64_round_trip() {
        let data = b"herald mirror payload";
        let encoded = base64_encode(data);
        assert_eq!(base64_decode(&encoded).as_deref(), Some(data.as_slice()));
    }
}
