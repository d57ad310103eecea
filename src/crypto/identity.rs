use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

use crate::crypto::{generate_random_seed, X25519KeyPair, X25519PublicKey};
use crate::error::{Error, Result};

/// Long-term identity keypair of a local user.
///
/// The Ed25519 key signs prekeys and is the identity published on the
/// server; its birational X25519 form takes part in the X3DH exchanges, so
/// peers only ever see one identity key.
pub(crate) struct IdentityKey {
    signing_key: Box<SigningKey>,
}

impl IdentityKey {
    pub(crate) fn generate() -> Result<Self> {
        let mut seed = generate_random_seed()?;
        let signing_key = Box::new(SigningKey::from_bytes(&seed));
        seed.zeroize();
        Ok(Self { signing_key })
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Public identity key as published in bundles, RFC 8032 encoding.
    pub(crate) fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Diffie-Hellman with the X25519 form of this identity.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        X25519KeyPair::from_scalar(self.signing_key.to_scalar_bytes()).dh(public_key)
    }

    /// Storage form: secret seed followed by the public key.
    pub(crate) fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(64);
        blob.extend_from_slice(self.signing_key.as_bytes());
        blob.extend_from_slice(&self.public_bytes());
        blob
    }

    pub(crate) fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != 64 {
            return Err(Error::SerializationFail(
                "bad identity key blob length".to_string(),
            ));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&blob[..32]);
        let signing_key = Box::new(SigningKey::from_bytes(&seed));
        seed.zeroize();
        Ok(Self { signing_key })
    }
}

/// Verifies `signature` over `message` against a wire-format identity key.
pub(crate) fn verify_identity_signature(
    ik_public: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let ik: [u8; 32] = ik_public
        .try_into()
        .map_err(|_| Error::SerializationFail("bad identity key length".to_string()))?;
    let sig: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::SerializationFail("bad signature length".to_string()))?;
    let verifying = VerifyingKey::from_bytes(&ik)?;
    verifying
        .verify_strict(message, &Signature::from_bytes(&sig))
        .map_err(|_| Error::CryptoFail("prekey signature verification failed".to_string()))
}

/// Maps a wire-format identity key to its X25519 form for key agreement.
pub(crate) fn identity_dh_public(ik_public: &[u8]) -> Result<X25519PublicKey> {
    let ik: [u8; 32] = ik_public
        .try_into()
        .map_err(|_| Error::SerializationFail("bad identity key length".to_string()))?;
    let verifying = VerifyingKey::from_bytes(&ik)?;
    Ok(X25519PublicKey::from(verifying.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let identity = IdentityKey::generate().unwrap();
        let message = b"prekey bytes";
        let signature = identity.sign(message);

        verify_identity_signature(
            &identity.public_bytes(),
            message,
            &signature.to_bytes(),
        )
        .unwrap();

        assert!(verify_identity_signature(
            &identity.public_bytes(),
            b"other bytes",
            &signature.to_bytes(),
        )
        .is_err());
    }

    #[test]
    fn identity_dh_agrees_across_conversion() {
        let alice = IdentityKey::generate().unwrap();
        let bob = X25519KeyPair::generate().unwrap();

        // Alice computes DH with her Ed25519 scalar, Bob with the converted
        // Montgomery form of her public key.
        let from_alice = alice.dh(&bob.public_key());
        let alice_x_pub = identity_dh_public(&alice.public_bytes()).unwrap();
        let from_bob = bob.dh(&alice_x_pub);
        assert_eq!(from_alice.as_bytes(), from_bob.as_bytes());
    }

    #[test]
    fn blob_round_trip() {
        let identity = IdentityKey::generate().unwrap();
        let restored = IdentityKey::from_blob(&identity.to_blob()).unwrap();
        assert_eq!(identity.public_bytes(), restored.public_bytes());
    }
}
