//! One-time confirmation codes.
//!
//! A code is 128 bits from the OS CSPRNG rendered as lowercase hex. Only its
//! SHA-256 digest is persisted; submitted codes are digested and compared
//! against every stored digest of the request in constant time.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::models::deletion::DeletionConfirmation;

/// Random bytes per code.
pub const CODE_BYTES: usize = 16;

/// Length of the rendered code.
pub const CODE_LEN: usize = CODE_BYTES * 2;

/// Plaintext confirmation code. Wiped from memory on drop.
#[derive(Clone)]
pub struct ConfirmationCode(Zeroizing<String>);

impl ConfirmationCode {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; CODE_BYTES]);
        OsRng.fill_bytes(bytes.as_mut());
        Self(Zeroizing::new(hex::encode(bytes.as_ref())))
    }

    /// Normalise a code submitted by an approver. Returns `None` for input
    /// that cannot possibly be a code.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != CODE_LEN || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(Zeroizing::new(trimmed.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Hex SHA-256 of the code, the only form that is stored.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl std::fmt::Debug for ConfirmationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfirmationCode(****)")
    }
}

pub fn digest_matches(stored: &str, submitted: &str) -> bool {
    stored.as_bytes().ct_eq(submitted.as_bytes()).into()
}

/// Find the confirmation whose stored digest equals `digest`.
/// Every row is compared; the scan never exits early.
pub fn find_match<'a>(
    confirmations: &'a [DeletionConfirmation],
    digest: &str,
) -> Option<&'a DeletionConfirmation> {
    let mut found = None;
    for c in confirmations {
        if digest_matches(&c.visible_code, digest) && found.is_none() {
            found = Some(c);
        }
    }
    found
}
