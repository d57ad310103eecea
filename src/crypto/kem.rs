use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem512};

use crate::error::{Error, Result};

type Ek = <MlKem512 as KemCore>::EncapsulationKey;
type Dk = <MlKem512 as KemCore>::DecapsulationKey;

pub(crate) const KEM_PUBLIC_SIZE: usize = 800;
pub(crate) const KEM_SECRET_SIZE: usize = 1632;
pub(crate) const KEM_CIPHERTEXT_SIZE: usize = 768;

/// Generates an ML-KEM-512 keypair as `(secret, public)` byte blobs.
pub(crate) fn kem_generate() -> (Box<[u8; KEM_SECRET_SIZE]>, Box<[u8; KEM_PUBLIC_SIZE]>) {
    let mut rng = rand_core::OsRng;
    let (dk, ek) = MlKem512::generate(&mut rng);

    let mut secret = Box::new([0u8; KEM_SECRET_SIZE]);
    secret.copy_from_slice(dk.as_bytes().as_ref());
    let mut public = Box::new([0u8; KEM_PUBLIC_SIZE]);
    public.copy_from_slice(ek.as_bytes().as_ref());
    (secret, public)
}

/// Encapsulates against a peer public key, returning the ciphertext to send
/// and the shared secret to mix into the key derivation.
pub(crate) fn kem_encapsulate(
    public_key: &[u8],
) -> Result<(Box<[u8; KEM_CIPHERTEXT_SIZE]>, Box<[u8; 32]>)> {
    let ek_array: Encoded<Ek> = public_key
        .try_into()
        .map_err(|_| Error::SerializationFail("bad KEM public key length".to_string()))?;
    let ek = Ek::from_bytes(&ek_array);

    let mut rng = rand_core::OsRng;
    let (ct, ss) = ek
        .encapsulate(&mut rng)
        .map_err(|_| Error::CryptoFail("KEM encapsulation failed".to_string()))?;

    let mut ciphertext = Box::new([0u8; KEM_CIPHERTEXT_SIZE]);
    ciphertext.copy_from_slice(ct.as_ref());
    let mut shared = Box::new([0u8; 32]);
    shared.copy_from_slice(ss.as_ref());
    Ok((ciphertext, shared))
}

pub(crate) fn kem_decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> Result<Box<[u8; 32]>> {
    let dk_array: Encoded<Dk> = secret_key
        .try_into()
        .map_err(|_| Error::SerializationFail("bad KEM secret key length".to_string()))?;
    let dk = Dk::from_bytes(&dk_array);

    let ct: ml_kem::Ciphertext<MlKem512> = ciphertext
        .try_into()
        .map_err(|_| Error::SerializationFail("bad KEM ciphertext length".to_string()))?;

    let ss = dk
        .decapsulate(&ct)
        .map_err(|_| Error::CryptoFail("KEM decapsulation failed".to_string()))?;
    let mut shared = Box::new([0u8; 32]);
    shared.copy_from_slice(ss.as_ref());
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulation_round_trip() {
        let (dk, ek) = kem_generate();
        let (ct, ss_sender) = kem_encapsulate(ek.as_slice()).unwrap();
        let ss_receiver = kem_decapsulate(dk.as_slice(), ct.as_slice()).unwrap();
        assert_eq!(ss_sender, ss_receiver);
    }

    #[test]
    fn bad_lengths_are_rejected() {
        let (dk, _) = kem_generate();
        assert!(kem_encapsulate(&[0u8; 10]).is_err());
        assert!(kem_decapsulate(dk.as_slice(), &[0u8; 10]).is_err());
    }
}
