//! Shared secp256k1 context and public-key helpers.

use std::sync::OnceLock;

use secp256k1::{PublicKey, Secp256k1, VerifyOnly};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

pub(crate) fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Whether `bytes` parse as a point on the curve (compressed, uncompressed or hybrid).
pub fn is_valid_public_key(bytes: &[u8]) -> bool {
    PublicKey::from_slice(bytes).is_ok()
}

pub fn is_compressed_or_uncompressed_pubkey(bytes: &[u8]) -> bool {
    match bytes.first() {
        Some(0x04) => bytes.len() == 65,
        Some(0x02) | Some(0x03) => bytes.len() == 33,
        _ => false,
    }
}

pub fn is_compressed_pubkey(bytes: &[u8]) -> bool {
    bytes.len() == 33 && matches!(bytes[0], 0x02 | 0x03)
}

/// Expands a 33-byte compressed key to its 65-byte uncompressed form.
pub fn decompress_public_key(compressed: &[u8]) -> Option<[u8; 65]> {
    if !is_compressed_pubkey(compressed) {
        return None;
    }
    PublicKey::from_slice(compressed)
        .ok()
        .map(|key| key.serialize_uncompressed())
}
