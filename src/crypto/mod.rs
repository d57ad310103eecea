//! Thin wrappers over the cryptographic primitives: X25519 key exchange,
//! Ed25519 signatures, HKDF/HMAC derivation, AES-256-GCM and, for the
//! hybrid suites, the ML-KEM key encapsulation.

mod aead;
mod identity;
mod kdf;
#[cfg(feature = "pq")]
mod kem;
mod x25519;

pub(crate) use aead::{aead_open, aead_seal};
pub(crate) use identity::{identity_dh_public, verify_identity_signature, IdentityKey};
pub(crate) use kdf::{hkdf_sha512, hmac_sha512};
#[cfg(feature = "pq")]
pub(crate) use kem::{
    kem_decapsulate, kem_encapsulate, kem_generate, KEM_CIPHERTEXT_SIZE, KEM_PUBLIC_SIZE,
    KEM_SECRET_SIZE,
};
pub(crate) use x25519::{X25519KeyPair, X25519PublicKey};

use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::error::{Error, Result};

/// Fills a boxed 32-byte seed from the OS random source.
pub(crate) fn generate_random_seed() -> Result<Box<[u8; 32]>> {
    let mut seed = Box::new([0u8; 32]);
    OsRng
        .try_fill_bytes(seed.as_mut_slice())
        .map_err(|_| Error::CryptoFail("random source unavailable".to_string()))?;
    Ok(seed)
}
