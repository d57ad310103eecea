use ed25519_dalek::Signature;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{generate_random_seed, IdentityKey, X25519KeyPair};
use crate::error::{Error, Result};
use crate::types::CurveId;
use crate::wire::Reader;

/// A random non-zero 32-bit prekey identifier.
pub(crate) fn random_key_id() -> Result<u32> {
    loop {
        let seed = generate_random_seed()?;
        let id = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]);
        if id != 0 {
            return Ok(id);
        }
    }
}

fn keypair_blob(pair: &X25519KeyPair, kem_pair: Option<&(Vec<u8>, Vec<u8>)>) -> Vec<u8> {
    let mut blob = Vec::with_capacity(64);
    blob.extend_from_slice(pair.public_key().as_bytes());
    blob.extend_from_slice(pair.secret_bytes());
    if let Some((dk, ek)) = kem_pair {
        blob.extend_from_slice(&(ek.len() as u16).to_be_bytes());
        blob.extend_from_slice(ek);
        blob.extend_from_slice(&(dk.len() as u16).to_be_bytes());
        blob.extend_from_slice(dk);
    }
    blob
}

fn keypair_from_blob(
    curve: CurveId,
    blob: &[u8],
) -> Result<(X25519KeyPair, Option<(Vec<u8>, Vec<u8>)>)> {
    let mut reader = Reader::new(blob);
    let _public = reader.take(32)?;
    let pair = X25519KeyPair::from_secret_slice(reader.take(32)?)?;
    let kem_pair = if curve.is_kem() {
        let ek_len = reader.u16_be()? as usize;
        let ek = reader.take(ek_len)?.to_vec();
        let dk_len = reader.u16_be()? as usize;
        let dk = reader.take(dk_len)?.to_vec();
        Some((dk, ek))
    } else {
        None
    };
    Ok((pair, kem_pair))
}

#[cfg(feature = "pq")]
fn maybe_kem_pair(curve: CurveId) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    if curve.is_kem() {
        let (dk, ek) = crate::crypto::kem_generate();
        Ok(Some((dk.to_vec(), ek.to_vec())))
    } else {
        Ok(None)
    }
}

#[cfg(not(feature = "pq"))]
fn maybe_kem_pair(curve: CurveId) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    if curve.is_kem() {
        return Err(Error::InvalidArgument(
            "KEM suites are not enabled in this build".to_string(),
        ));
    }
    Ok(None)
}

/// Medium-lived prekey signed by the identity key. The signature covers
/// the full public value (including the KEM half on hybrid suites).
pub(crate) struct SignedPreKey {
    pair: X25519KeyPair,
    kem_pair: Option<(Vec<u8>, Vec<u8>)>,
    id: u32,
}

impl SignedPreKey {
    pub(crate) fn generate(curve: CurveId) -> Result<Self> {
        Ok(Self {
            pair: X25519KeyPair::generate()?,
            kem_pair: maybe_kem_pair(curve)?,
            id: random_key_id()?,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn pair(&self) -> &X25519KeyPair {
        &self.pair
    }

    pub(crate) fn kem_pair(&self) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.kem_pair.as_ref()
    }

    /// Wire form of the public key: X25519 point, then the KEM public.
    pub(crate) fn public_bytes(&self) -> Vec<u8> {
        let mut bytes = self.pair.public_key().to_bytes().to_vec();
        if let Some((_, ek)) = &self.kem_pair {
            bytes.extend_from_slice(ek);
        }
        bytes
    }

    pub(crate) fn sign(&self, identity: &IdentityKey) -> Signature {
        identity.sign(&self.public_bytes())
    }

    pub(crate) fn to_blob(&self) -> Vec<u8> {
        keypair_blob(&self.pair, self.kem_pair.as_ref())
    }

    pub(crate) fn from_blob(curve: CurveId, id: u32, blob: &[u8]) -> Result<Self> {
        let (pair, kem_pair) = keypair_from_blob(curve, blob)?;
        Ok(Self { pair, kem_pair, id })
    }
}

impl Zeroize for SignedPreKey {
    fn zeroize(&mut self) {
        self.pair.zeroize();
        if let Some((dk, _)) = &mut self.kem_pair {
            dk.zeroize();
        }
    }
}

impl ZeroizeOnDrop for SignedPreKey {}

/// Single-use prekey, handed out by the server at most once.
pub(crate) struct OneTimePreKey {
    pair: X25519KeyPair,
    kem_pair: Option<(Vec<u8>, Vec<u8>)>,
    id: u32,
}

impl OneTimePreKey {
    pub(crate) fn generate(curve: CurveId) -> Result<Self> {
        Ok(Self {
            pair: X25519KeyPair::generate()?,
            kem_pair: maybe_kem_pair(curve)?,
            id: random_key_id()?,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn pair(&self) -> &X25519KeyPair {
        &self.pair
    }

    pub(crate) fn public_bytes(&self) -> Vec<u8> {
        let mut bytes = self.pair.public_key().to_bytes().to_vec();
        if let Some((_, ek)) = &self.kem_pair {
            bytes.extend_from_slice(ek);
        }
        bytes
    }

    pub(crate) fn to_blob(&self) -> Vec<u8> {
        keypair_blob(&self.pair, self.kem_pair.as_ref())
    }

    pub(crate) fn from_blob(curve: CurveId, id: u32, blob: &[u8]) -> Result<Self> {
        let (pair, kem_pair) = keypair_from_blob(curve, blob)?;
        Ok(Self { pair, kem_pair, id })
    }
}

impl Zeroize for OneTimePreKey {
    fn zeroize(&mut self) {
        self.pair.zeroize();
        if let Some((dk, _)) = &mut self.kem_pair {
            dk.zeroize();
        }
    }
}

impl ZeroizeOnDrop for OneTimePreKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_identity_signature;

    #[test]
    fn signature_covers_public_bytes() {
        let identity = IdentityKey::generate().unwrap();
        let spk = SignedPreKey::generate(CurveId::C25519).unwrap();
        let signature = spk.sign(&identity);

        verify_identity_signature(
            &identity.public_bytes(),
            &spk.public_bytes(),
            &signature.to_bytes(),
        )
        .unwrap();
    }

    #[test]
    fn blob_round_trip_preserves_key_material() {
        let spk = SignedPreKey::generate(CurveId::C25519).unwrap();
        let restored =
            SignedPreKey::from_blob(CurveId::C25519, spk.id(), &spk.to_blob()).unwrap();
        assert_eq!(restored.id(), spk.id());
        assert_eq!(restored.public_bytes(), spk.public_bytes());

        let opk = OneTimePreKey::generate(CurveId::C25519).unwrap();
        let restored =
            OneTimePreKey::from_blob(CurveId::C25519, opk.id(), &opk.to_blob()).unwrap();
        assert_eq!(restored.public_bytes(), opk.public_bytes());
    }

    #[test]
    fn key_ids_are_nonzero() {
        for _ in 0..32 {
            assert_ne!(random_key_id().unwrap(), 0);
        }
    }
}
