use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::error::{Error, Result};

/// HKDF-SHA512 extract-then-expand.
pub(crate) fn hkdf_sha512(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) -> Result<()> {
    let hkdf = Hkdf::<Sha512>::new(Some(salt), ikm);
    hkdf.expand(info, output)
        .map_err(|_| Error::CryptoFail("invalid HKDF output length".to_string()))
}

/// One-shot HMAC-SHA512, used for the symmetric chain ratchet.
pub(crate) fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_info_separated() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_sha512(b"salt", b"ikm", b"info-a", &mut a).unwrap();
        hkdf_sha512(b"salt", b"ikm", b"info-a", &mut b).unwrap();
        assert_eq!(a, b);

        hkdf_sha512(b"salt", b"ikm", b"info-b", &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hkdf_rejects_oversized_output() {
        // SHA-512 caps HKDF output at 255 * 64 bytes.
        let mut too_long = vec![0u8; 255 * 64 + 1];
        assert!(hkdf_sha512(b"s", b"i", b"n", &mut too_long).is_err());
    }

    #[test]
    fn hmac_separates_labels() {
        let key = [7u8; 32];
        assert_ne!(hmac_sha512(&key, &[0x01]), hmac_sha512(&key, &[0x02]));
    }
}
