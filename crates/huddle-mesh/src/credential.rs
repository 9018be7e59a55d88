//! Credential digests and per-listener access keys.

use huddle_core::CredentialTable;

/// Characters used for generated access keys: printable ASCII without space.
const KEY_ALPHABET: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!#$%&()*+,-./:;<=>?@[]^_{|}~";

/// Hex BLAKE3 digest of a participant credential, as stored in the
/// coordinator's credential table.
pub fn hash_credential(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

/// Check a presented secret against a stored digest in constant time.
pub fn verify_credential(secret: &str, digest: &str) -> bool {
    match blake3::Hash::from_hex(digest.trim()) {
        Ok(expected) => blake3::hash(secret.as_bytes()) == expected,
        Err(_) => false,
    }
}

/// Random access key gating a participant's listener.
pub fn generate_access_key(len: usize) -> String {
    (0..len)
        .map(|_| {
            let idx = rand::random::<u32>() as usize % KEY_ALPHABET.len();
            KEY_ALPHABET[idx] as char
        })
        .collect()
}

/// Decide whether a dialer may open a link to a listener.
///
/// The access key must match; when the credential table is non-empty the
/// dialer's name must be listed and its credential must match the digest.
pub fn authorize(
    dialer: &str,
    presented_key: &str,
    credential: Option<&str>,
    expected_key: &str,
    table: &CredentialTable,
) -> Result<(), String> {
    if presented_key != expected_key {
        return Err("bad access key".into());
    }
    if table.is_empty() {
        return Ok(());
    }
    let Some(digest) = table.get(dialer) else {
        return Err(format!("'{dialer}' is not in the credential table"));
    };
    match credential {
        Some(secret) if verify_credential(secret, digest) => Ok(()),
        Some(_) => Err("bad credential".into()),
        None => Err("credential required".into()),
    }
}
