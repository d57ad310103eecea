use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::generate_random_seed;
use crate::error::{Error, Result};

/// An X25519 public key used for ratchet and prekey material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub(crate) fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::SerializationFail("bad X25519 public key length".to_string()))?;
        Ok(Self(PublicKey::from(array)))
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

/// An X25519 keypair; the secret half is boxed and wiped on drop.
#[derive(Clone)]
pub(crate) struct X25519KeyPair(Box<StaticSecret>);

impl X25519KeyPair {
    pub(crate) fn generate() -> Result<Self> {
        let mut seed = generate_random_seed()?;
        let secret = StaticSecret::from(*seed);
        seed.zeroize();
        Ok(Self(Box::new(secret)))
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.0.diffie_hellman(&public_key.0)
    }

    pub(crate) fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(PublicKey::from(self.0.as_ref()))
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub(crate) fn from_secret_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::SerializationFail("bad X25519 secret key length".to_string()))?;
        Ok(Self(Box::new(StaticSecret::from(array))))
    }

    /// Builds a keypair from a caller-owned scalar, without clamping twice.
    pub(crate) fn from_scalar(scalar: [u8; 32]) -> Self {
        Self(Box::new(StaticSecret::from(scalar)))
    }
}

impl Zeroize for X25519KeyPair {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl ZeroizeOnDrop for X25519KeyPair {}
