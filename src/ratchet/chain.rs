use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::hmac_sha512;
use crate::settings::{DR_CHAIN_KEY_SIZE, DR_MESSAGE_KEY_SIZE};

const LABEL_MESSAGE_KEY: [u8; 1] = [0x01];
const LABEL_CHAIN_KEY: [u8; 1] = [0x02];

/// A message key split into its AEAD key and nonce halves.
pub(crate) struct MessageKey(Box<[u8; DR_MESSAGE_KEY_SIZE]>);

impl MessageKey {
    pub(crate) fn from_bytes(bytes: [u8; DR_MESSAGE_KEY_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    pub(crate) fn aead_key(&self) -> &[u8; 32] {
        self.0[..32].try_into().expect("fixed split")
    }

    pub(crate) fn nonce(&self) -> &[u8; 12] {
        self.0[32..].try_into().expect("fixed split")
    }

    pub(crate) fn as_bytes(&self) -> &[u8; DR_MESSAGE_KEY_SIZE] {
        &self.0
    }
}

impl Zeroize for MessageKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl ZeroizeOnDrop for MessageKey {}

/// One symmetric ratchet chain: each step yields the next message key and
/// advances the chain key, so earlier keys are unrecoverable.
#[derive(Clone)]
pub(crate) struct Chain {
    key: Box<[u8; DR_CHAIN_KEY_SIZE]>,
    pub(crate) index: u32,
}

impl Chain {
    pub(crate) fn new(key: Box<[u8; DR_CHAIN_KEY_SIZE]>) -> Self {
        Self { key, index: 0 }
    }

    /// Rebuilds a chain from its persisted key and counter.
    pub(crate) fn resume(key: Box<[u8; DR_CHAIN_KEY_SIZE]>, index: u32) -> Self {
        Self { key, index }
    }

    pub(crate) fn key_bytes(&self) -> &[u8; DR_CHAIN_KEY_SIZE] {
        &self.key
    }

    pub(crate) fn next(&mut self) -> MessageKey {
        let mk_full = hmac_sha512(self.key.as_slice(), &LABEL_MESSAGE_KEY);
        let ck_full = hmac_sha512(self.key.as_slice(), &LABEL_CHAIN_KEY);

        let mut mk = [0u8; DR_MESSAGE_KEY_SIZE];
        mk.copy_from_slice(&mk_full[..DR_MESSAGE_KEY_SIZE]);
        self.key.copy_from_slice(&ck_full[..DR_CHAIN_KEY_SIZE]);
        self.index = self.index.wrapping_add(1);

        MessageKey::from_bytes(mk)
    }
}

impl Zeroize for Chain {
    fn zeroize(&mut self) {
        self.key.zeroize();
        self.index = 0;
    }
}

impl ZeroizeOnDrop for Chain {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_deterministic_and_distinct() {
        let mut a = Chain::new(Box::new([7u8; 32]));
        let mut b = Chain::new(Box::new([7u8; 32]));

        let mk_a1 = a.next();
        let mk_b1 = b.next();
        assert_eq!(mk_a1.aead_key(), mk_b1.aead_key());
        assert_eq!(a.index, 1);

        let mk_a2 = a.next();
        assert_ne!(mk_a1.aead_key(), mk_a2.aead_key());
        assert_ne!(mk_a1.nonce(), mk_a2.nonce());
    }

    #[test]
    fn chain_key_never_equals_message_key() {
        let mut chain = Chain::new(Box::new([9u8; 32]));
        let mk = chain.next();
        assert_ne!(&mk.aead_key()[..], &chain.key_bytes()[..]);
    }

    #[test]
    fn resume_continues_the_same_sequence() {
        let mut chain = Chain::new(Box::new([3u8; 32]));
        chain.next();
        let resumed_key = *chain.key_bytes();
        let mut resumed = Chain::resume(Box::new(resumed_key), chain.index);

        assert_eq!(
            chain.next().aead_key(),
            resumed.next().aead_key()
        );
        assert_eq!(chain.index, resumed.index);
    }
}
