use ring::digest::{Context, SHA256};

use crate::error::{LedgerError, Result};
use data_encoding::HEXLOWER;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub fn current_timestamp() -> Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LedgerError::Crypto(format!("System time error: {e}")))?
        .as_millis();

    // Ensure the timestamp fits in i64
    if duration > i64::MAX as u128 {
        return Err(LedgerError::Crypto("Timestamp overflow".to_string()));
    }

    Ok(duration as i64)
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

/// Lowercase hex SHA-256. Used for block hashes and record integrity hashes.
pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(&sha256_digest(data))
}

/// Derive the pseudonymous patient UID from a national ID and the node salt.
/// The raw identifier never leaves this function.
pub fn pseudonymous_uid(national_id: &str, salt: &str) -> String {
    let mut input = Vec::with_capacity(national_id.len() + salt.len());
    input.extend_from_slice(national_id.as_bytes());
    input.extend_from_slice(salt.as_bytes());
    sha256_hex(&input)[..16].to_uppercase()
}

/// Compare two byte slices in constant time
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_pseudonymous_uid_is_stable_and_salted() {
        let a = pseudonymous_uid("3174012345678901", "salt-a");
        let b = pseudonymous_uid("3174012345678901", "salt-a");
        let c = pseudonymous_uid("3174012345678901", "salt-b");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(!a.contains("3174012345678901"));
        assert_eq!(a, a.to_uppercase());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_current_timestamp_is_millis() {
        let ts = current_timestamp().unwrap();
        // After 2020-01-01 in milliseconds
        assert!(ts > 1_577_836_800_000);
    }
}
