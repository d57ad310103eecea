use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use crate::error::{Error, Result};

pub(crate) fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::CryptoFail("AEAD seal failed".to_string()))
}

pub(crate) fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::CryptoFail("AEAD open failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let sealed = aead_seal(&key, &nonce, b"ad", b"payload").unwrap();
        // 16-byte authentication tag.
        assert_eq!(sealed.len(), b"payload".len() + 16);
        let opened = aead_open(&key, &nonce, b"ad", &sealed).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn open_rejects_wrong_aad_and_tampering() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let mut sealed = aead_seal(&key, &nonce, b"ad", b"payload").unwrap();
        assert!(aead_open(&key, &nonce, b"da", &sealed).is_err());
        sealed[0] ^= 0x01;
        assert!(aead_open(&key, &nonce, b"ad", &sealed).is_err());
    }

    #[test]
    fn empty_plaintext_is_valid() {
        let key = [9u8; 32];
        let nonce = [3u8; 12];
        let sealed = aead_seal(&key, &nonce, b"", b"").unwrap();
        assert_eq!(aead_open(&key, &nonce, b"", &sealed).unwrap(), b"");
    }
}
