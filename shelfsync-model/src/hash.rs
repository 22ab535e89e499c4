use sha2::{Digest, Sha256};

/// Stable content digest used as `FileRecord::content_hash` and as the input
/// to the upload idempotency key.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// 8-char digest used to identify an enrichment configuration
/// (`FileRecord::enrichment_version`).
pub fn short_digest(input: &str) -> String {
    let full = digest_bytes(input.as_bytes());
    full[..8].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
