//! Double Ratchet sessions.
//!
//! A session interleaves a symmetric key chain (one step per message) with
//! an asymmetric ratchet (one step per turnaround): whenever a message
//! arrives under a new peer ratchet key the receiving chain is rebuilt
//! from fresh Diffie-Hellman output, and the next outbound message
//! performs the matching send-side step. The hybrid suites additionally
//! mix a KEM shared secret into the ratchet at a bounded cadence.
//!
//! Decryption never mutates the session on failure: all derivation runs on
//! working copies that are committed only after the AEAD accepts the
//! message. Skipped message keys live in the key store, indexed by a hash
//! of the receiving chain's ratchet key.

mod chain;

use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) use chain::{Chain, MessageKey};

use crate::crypto::{aead_open, aead_seal, hkdf_sha512, X25519KeyPair, X25519PublicKey};
use crate::error::{Error, Result};
use crate::settings;
use crate::store::{SessionRow, Store};
use crate::types::CurveId;
use crate::wire::{DrHeader, KemRatchetPublics, X3dhInit};

/// 96-bit identifier of a receiving chain, derived from its ratchet key.
pub(crate) fn pk_index(dh_pub: &[u8; 32]) -> [u8; settings::DR_PK_INDEX_SIZE] {
    let digest = Sha512::digest(dh_pub);
    digest[..settings::DR_PK_INDEX_SIZE]
        .try_into()
        .expect("digest is long enough")
}

/// Root key step: derives the next root key and a chain key from the
/// ratchet output.
fn kdf_rk(rk: &[u8; 32], ikm: &[u8]) -> Result<(Box<[u8; 32]>, Box<[u8; 32]>)> {
    let mut okm = [0u8; 64];
    hkdf_sha512(rk, ikm, settings::HKDF_RK_INFO, &mut okm)?;
    let mut new_rk = Box::new([0u8; 32]);
    let mut ck = Box::new([0u8; 32]);
    new_rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((new_rk, ck))
}

/// KEM half of the hybrid suites, kept alongside the EC ratchet state.
#[derive(Clone)]
pub(crate) struct KemState {
    pub(crate) dk: Vec<u8>,
    pub(crate) ek: Vec<u8>,
    /// Encapsulation advertised with every message of the current sending
    /// chain, so late or reordered chain heads still let the peer ratchet.
    pub(crate) chain_ct: Option<Vec<u8>>,
    pub(crate) msgs_since_ratchet: u32,
    pub(crate) last_ratchet_ts: i64,
}

/// Keys establishing a fresh outbound session, produced by the X3DH
/// initiator computation.
pub(crate) struct InitiatorKeys {
    pub(crate) shared_secret: Box<[u8; 32]>,
    pub(crate) peer_spk_pub: X25519PublicKey,
    /// Peer signed-prekey KEM public (hybrid suites).
    pub(crate) peer_spk_kem: Option<Vec<u8>>,
    /// Our initial KEM keypair `(dk, ek)`, announced in the X3DH payload.
    pub(crate) kem_pair: Option<(Vec<u8>, Vec<u8>)>,
}

/// Keys establishing a fresh inbound session, recovered from an X3DH
/// initiation payload.
pub(crate) struct ResponderKeys {
    pub(crate) shared_secret: Box<[u8; 32]>,
    pub(crate) spk_pair: X25519KeyPair,
    /// Our signed-prekey KEM keypair `(dk, ek)` (hybrid suites).
    pub(crate) spk_kem_pair: Option<(Vec<u8>, Vec<u8>)>,
    /// Initiator's initial KEM public key.
    pub(crate) peer_kem_ek: Option<Vec<u8>>,
}

pub(crate) struct DrSession {
    /// Key-store id; 0 until first persisted.
    pub(crate) id: i64,
    pub(crate) uid: i64,
    pub(crate) did: i64,
    pub(crate) peer_device_id: String,
    pub(crate) curve: CurveId,
    pub(crate) active: bool,
    pn: u32,
    dhr: Option<[u8; 32]>,
    peer_kem_ek: Option<Vec<u8>>,
    dhs: X25519KeyPair,
    kem: Option<KemState>,
    rk: Box<[u8; 32]>,
    sending: Option<Chain>,
    receiving: Option<Chain>,
    ad: Vec<u8>,
    x3dh_init: Option<X3dhInit>,
    send_ratchet_pending: bool,
    /// Skipped keys derived before the session had a store id; flushed
    /// right after the first persist.
    pending_skipped: Vec<([u8; settings::DR_PK_INDEX_SIZE], Vec<SkippedKey>)>,
}

type SkippedKey = (u32, [u8; settings::DR_MESSAGE_KEY_SIZE]);

impl DrSession {
    /// Initiator construction: the first asymmetric ratchet runs against
    /// the peer's signed prekey, and the X3DH payload stays attached to
    /// every outbound message until the first reply decrypts.
    pub(crate) fn new_initiator(
        curve: CurveId,
        uid: i64,
        did: i64,
        peer_device_id: &str,
        keys: InitiatorKeys,
        ad: Vec<u8>,
        x3dh_init: X3dhInit,
    ) -> Result<Self> {
        let dhs = X25519KeyPair::generate()?;
        let dh_out = dhs.dh(&keys.peer_spk_pub);
        let (rk, ck) = kdf_rk(&keys.shared_secret, dh_out.as_bytes())?;

        let kem = keys.kem_pair.map(|(dk, ek)| KemState {
            dk,
            ek,
            chain_ct: None,
            msgs_since_ratchet: 0,
            last_ratchet_ts: crate::store::now_ts(),
        });

        Ok(Self {
            id: 0,
            uid,
            did,
            peer_device_id: peer_device_id.to_string(),
            curve,
            active: true,
            pn: 0,
            dhr: Some(keys.peer_spk_pub.to_bytes()),
            peer_kem_ek: keys.peer_spk_kem,
            dhs,
            kem,
            rk,
            sending: Some(Chain::new(ck)),
            receiving: None,
            ad,
            x3dh_init: Some(x3dh_init),
            send_ratchet_pending: false,
            pending_skipped: Vec::new(),
        })
    }

    /// Responder construction: seeded with the signed prekey the initiator
    /// ratcheted against; chains appear with the first received message.
    pub(crate) fn new_responder(
        curve: CurveId,
        uid: i64,
        did: i64,
        peer_device_id: &str,
        keys: ResponderKeys,
        ad: Vec<u8>,
    ) -> Self {
        let kem = keys.spk_kem_pair.map(|(dk, ek)| KemState {
            dk,
            ek,
            chain_ct: None,
            msgs_since_ratchet: 0,
            last_ratchet_ts: crate::store::now_ts(),
        });

        Self {
            id: 0,
            uid,
            did,
            peer_device_id: peer_device_id.to_string(),
            curve,
            active: true,
            pn: 0,
            dhr: None,
            peer_kem_ek: keys.peer_kem_ek,
            dhs: keys.spk_pair,
            kem,
            rk: keys.shared_secret,
            sending: None,
            receiving: None,
            ad,
            x3dh_init: None,
            send_ratchet_pending: false,
            pending_skipped: Vec::new(),
        }
    }

    /// The sending chain hit its cap with no reply; only a fresh key
    /// agreement may continue the conversation.
    pub(crate) fn sending_chain_exhausted(&self) -> bool {
        self.sending
            .as_ref()
            .is_some_and(|chain| chain.index >= settings::MAX_SENDING_CHAIN)
    }

    fn kem_ratchet_due(&self, now: i64) -> bool {
        match &self.kem {
            None => false,
            Some(kem) => {
                kem.msgs_since_ratchet >= kem_ratchet_chain_size()
                    || now - kem.last_ratchet_ts >= kem_ratchet_period()
            }
        }
    }

    /// Send-side asymmetric ratchet: fresh ratchet keypair, new root and
    /// sending chain, optionally mixing a KEM encapsulation.
    fn send_ratchet(&mut self, mix_kem: bool) -> Result<()> {
        let dhr_bytes = self
            .dhr
            .ok_or_else(|| Error::CryptoFail("no peer ratchet key to send against".to_string()))?;
        let dhr = X25519PublicKey::from(dhr_bytes);

        self.pn = self.sending.as_ref().map(|c| c.index).unwrap_or(0);
        self.dhs = X25519KeyPair::generate()?;

        let dh_out = self.dhs.dh(&dhr);
        let mut ikm = dh_out.as_bytes().to_vec();

        if let Some(kem) = &mut self.kem {
            if mix_kem {
                let peer_ek = self.peer_kem_ek.as_deref().ok_or_else(|| {
                    Error::CryptoFail("no peer KEM key to encapsulate against".to_string())
                })?;
                let ct = kem_encapsulate_into(peer_ek, &mut ikm)?;
                let (dk, ek) = kem_generate_pair()?;
                kem.dk = dk;
                kem.ek = ek;
                kem.chain_ct = Some(ct);
                kem.msgs_since_ratchet = 0;
                kem.last_ratchet_ts = crate::store::now_ts();
            } else {
                kem.chain_ct = None;
            }
        }

        let (rk, ck) = kdf_rk(&self.rk, &ikm)?;
        ikm.zeroize();
        self.rk = rk;
        self.sending = Some(Chain::new(ck));
        self.send_ratchet_pending = false;
        Ok(())
    }

    /// Encrypts one payload, returning the full message (header followed
    /// by the AEAD ciphertext). `payload_direct` tells the receiver
    /// whether the payload is the plaintext or a cipher-message seed.
    pub(crate) fn encrypt(
        &mut self,
        payload: &[u8],
        payload_direct: bool,
        aad_extra: &[u8],
    ) -> Result<Vec<u8>> {
        let now = crate::store::now_ts();
        if self.send_ratchet_pending || self.sending.is_none() {
            // A first send always carries KEM material so the peer can
            // seed its side; afterwards the cadence decides.
            let mix_kem =
                self.kem.is_some() && (self.sending.is_none() || self.kem_ratchet_due(now));
            self.send_ratchet(mix_kem)?;
        } else if self.kem.is_some() && self.kem_ratchet_due(now) {
            // Cadence forces a unilateral ratchet even with no reply.
            self.send_ratchet(true)?;
        }

        let chain = self
            .sending
            .as_mut()
            .ok_or_else(|| Error::CryptoFail("no sending chain".to_string()))?;
        let ns = chain.index;
        let mk = chain.next();

        let header = DrHeader {
            curve: self.curve,
            ns: ns as u16,
            pn: self.pn as u16,
            payload_direct,
            dh_pub: self.dhs.public_key().to_bytes(),
            kem: self.kem.as_ref().and_then(|kem| {
                kem.chain_ct.as_ref().map(|ct| KemRatchetPublics {
                    ek: kem.ek.clone(),
                    ct: ct.clone(),
                })
            }),
            x3dh_init: self.x3dh_init.clone(),
        };

        let header_bytes = header.to_bytes();
        let mut aad = self.ad.clone();
        aad.extend_from_slice(aad_extra);
        aad.extend_from_slice(&header_bytes);

        let ciphertext = aead_seal(mk.aead_key(), mk.nonce(), &aad, payload)?;
        if let Some(kem) = &mut self.kem {
            kem.msgs_since_ratchet += 1;
        }

        let mut message = header_bytes;
        message.extend_from_slice(&ciphertext);
        Ok(message)
    }

    /// Attempts to decrypt a message for this session. On success the
    /// session state advances and skipped keys are persisted; on failure
    /// the session is left exactly as it was.
    pub(crate) fn decrypt(
        &mut self,
        store: &Store,
        message: &[u8],
        header: &DrHeader,
        header_len: usize,
        aad_extra: &[u8],
    ) -> Result<Vec<u8>> {
        if header.curve != self.curve {
            return Err(Error::CryptoFail("algorithm mismatch".to_string()));
        }
        let ciphertext = &message[header_len..];
        let mut aad = self.ad.clone();
        aad.extend_from_slice(aad_extra);
        aad.extend_from_slice(&message[..header_len]);

        // A key skipped over earlier may already be waiting in the store.
        if self.id != 0 {
            let index = pk_index(&header.dh_pub);
            if let Some(mk_bytes) = store.get_skipped_key(self.id, &index, header.ns as u32)? {
                let mk = MessageKey::from_bytes(mk_bytes);
                let plaintext = aead_open(mk.aead_key(), mk.nonce(), &aad, ciphertext)?;
                store.delete_skipped_key(self.id, &index, header.ns as u32)?;
                self.note_successful_decrypt();
                return Ok(plaintext);
            }
        }

        let same_chain = self.dhr.map(|dhr| dhr == header.dh_pub).unwrap_or(false);
        if same_chain {
            self.decrypt_same_chain(store, header, &aad, ciphertext)
        } else {
            self.decrypt_with_ratchet(store, header, &aad, ciphertext)
        }
    }

    fn decrypt_same_chain(
        &mut self,
        store: &Store,
        header: &DrHeader,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let chain = self
            .receiving
            .as_ref()
            .ok_or_else(|| Error::CryptoFail("no receiving chain".to_string()))?;
        let target = header.ns as u32;
        if target < chain.index {
            // Behind the chain with no stored key: gone for good.
            return Err(Error::CryptoFail("message key no longer available".to_string()));
        }

        let mut work = chain.clone();
        let skipped = skip_to(&mut work, target)?;
        let mk = work.next();
        let plaintext = aead_open(mk.aead_key(), mk.nonce(), aad, ciphertext)?;

        // Commit.
        if !skipped.is_empty() {
            if self.id != 0 {
                store.store_skipped_keys(self.id, &pk_index(&header.dh_pub), &skipped)?;
            } else {
                self.pending_skipped.push((pk_index(&header.dh_pub), skipped));
            }
        }
        self.receiving = Some(work);
        self.note_successful_decrypt();
        Ok(plaintext)
    }

    fn decrypt_with_ratchet(
        &mut self,
        store: &Store,
        header: &DrHeader,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        // Finalize the previous receiving chain up to the sender's PN.
        let mut old_skipped = Vec::new();
        if let Some(old_chain) = &self.receiving {
            let mut work = old_chain.clone();
            old_skipped = skip_to(&mut work, header.pn as u32)?;
        }

        // New receiving chain from the ratchet output. A hybrid chain
        // without KEM material is a plain DH step; the key agreement's own
        // encapsulation is already folded into the root key.
        let dh_out = self.dhs.dh(&X25519PublicKey::from(header.dh_pub));
        let mut ikm = dh_out.as_bytes().to_vec();
        if let (Some(kem), Some(material)) = (&self.kem, &header.kem) {
            kem_decapsulate_into(&kem.dk, &material.ct, &mut ikm)?;
        }

        let (new_rk, ck) = kdf_rk(&self.rk, &ikm)?;
        ikm.zeroize();

        let mut work = Chain::new(ck);
        let new_skipped = skip_to(&mut work, header.ns as u32)?;
        let mk = work.next();
        let plaintext = aead_open(mk.aead_key(), mk.nonce(), aad, ciphertext)?;

        // Commit: persist the finalized chain's keys under its old ratchet
        // key, the fresh chain's under the new one, then swing the state.
        if let (Some(old_dhr), false) = (self.dhr, old_skipped.is_empty()) {
            if self.id != 0 {
                store.store_skipped_keys(self.id, &pk_index(&old_dhr), &old_skipped)?;
            } else {
                self.pending_skipped.push((pk_index(&old_dhr), old_skipped));
            }
        }
        if !new_skipped.is_empty() {
            if self.id != 0 {
                store.store_skipped_keys(self.id, &pk_index(&header.dh_pub), &new_skipped)?;
            } else {
                self.pending_skipped.push((pk_index(&header.dh_pub), new_skipped));
            }
        }

        self.rk = new_rk;
        self.receiving = Some(work);
        self.dhr = Some(header.dh_pub);
        if let Some(material) = &header.kem {
            self.peer_kem_ek = Some(material.ek.clone());
        }
        self.send_ratchet_pending = true;
        self.note_successful_decrypt();
        Ok(plaintext)
    }

    /// Persists skipped keys accumulated while the session had no store
    /// id yet; called once right after the first `insert_session`.
    pub(crate) fn flush_pending_skipped(&mut self, store: &Store) -> Result<()> {
        for (index, keys) in self.pending_skipped.drain(..) {
            store.store_skipped_keys(self.id, &index, &keys)?;
        }
        Ok(())
    }

    fn note_successful_decrypt(&mut self) {
        // The peer holds a session: the key agreement payload has served
        // its purpose.
        self.x3dh_init = None;
    }

    /* ------------------------- persistence --------------------------- */

    pub(crate) fn to_row(&self) -> SessionRow {
        let dhr_blob = match (&self.dhr, &self.peer_kem_ek) {
            (None, None) => None,
            (dhr, kem_ek) => {
                let mut blob = vec![
                    (dhr.is_some() as u8) | ((kem_ek.is_some() as u8) << 1),
                ];
                if let Some(dhr) = dhr {
                    blob.extend_from_slice(dhr);
                }
                if let Some(ek) = kem_ek {
                    blob.extend_from_slice(ek);
                }
                Some(blob)
            }
        };

        let mut dhs_blob = Vec::with_capacity(64);
        dhs_blob.extend_from_slice(self.dhs.public_key().as_bytes());
        dhs_blob.extend_from_slice(self.dhs.secret_bytes());
        if let Some(kem) = &self.kem {
            dhs_blob.extend_from_slice(&(kem.ek.len() as u16).to_be_bytes());
            dhs_blob.extend_from_slice(&kem.ek);
            dhs_blob.extend_from_slice(&(kem.dk.len() as u16).to_be_bytes());
            dhs_blob.extend_from_slice(&kem.dk);
            match &kem.chain_ct {
                Some(ct) => {
                    dhs_blob.extend_from_slice(&(ct.len() as u16).to_be_bytes());
                    dhs_blob.extend_from_slice(ct);
                }
                None => dhs_blob.extend_from_slice(&0u16.to_be_bytes()),
            }
            dhs_blob.extend_from_slice(&kem.msgs_since_ratchet.to_be_bytes());
            dhs_blob.extend_from_slice(&kem.last_ratchet_ts.to_be_bytes());
        }

        SessionRow {
            id: self.id,
            uid: self.uid,
            did: self.did,
            ns: self.sending.as_ref().map(|c| c.index).unwrap_or(0),
            nr: self.receiving.as_ref().map(|c| c.index).unwrap_or(0),
            pn: self.pn,
            dhr: dhr_blob,
            dhr_status: self.send_ratchet_pending as i64,
            dhs: dhs_blob,
            rk: self.rk.to_vec(),
            cks: self.sending.as_ref().map(|c| c.key_bytes().to_vec()),
            ckr: self.receiving.as_ref().map(|c| c.key_bytes().to_vec()),
            ad: self.ad.clone(),
            active: self.active,
            x3dh_init: self
                .x3dh_init
                .as_ref()
                .map(|init| init.to_bytes(self.curve)),
        }
    }

    pub(crate) fn from_row(
        row: SessionRow,
        curve: CurveId,
        peer_device_id: &str,
    ) -> Result<Self> {
        let (dhr, peer_kem_ek) = match &row.dhr {
            None => (None, None),
            Some(blob) => {
                if blob.is_empty() {
                    return Err(Error::StorageFail("empty peer ratchet blob".to_string()));
                }
                let tag = blob[0];
                let mut pos = 1usize;
                let dhr = if tag & 0x01 != 0 {
                    let bytes: [u8; 32] = blob
                        .get(pos..pos + 32)
                        .and_then(|s| s.try_into().ok())
                        .ok_or_else(|| {
                            Error::StorageFail("truncated peer ratchet blob".to_string())
                        })?;
                    pos += 32;
                    Some(bytes)
                } else {
                    None
                };
                let kem_ek = if tag & 0x02 != 0 {
                    Some(blob[pos..].to_vec())
                } else {
                    None
                };
                (dhr, kem_ek)
            }
        };

        if row.dhs.len() < 64 {
            return Err(Error::StorageFail("truncated ratchet keypair".to_string()));
        }
        let dhs = X25519KeyPair::from_secret_slice(&row.dhs[32..64])?;

        let kem = if row.dhs.len() > 64 {
            let mut reader = crate::wire::Reader::new(&row.dhs[64..]);
            let ek_len = reader.u16_be()? as usize;
            let ek = reader.take(ek_len)?.to_vec();
            let dk_len = reader.u16_be()? as usize;
            let dk = reader.take(dk_len)?.to_vec();
            let ct_len = reader.u16_be()? as usize;
            let chain_ct = if ct_len > 0 {
                Some(reader.take(ct_len)?.to_vec())
            } else {
                None
            };
            let msgs_since_ratchet = reader.u32_be()?;
            let ts_bytes: [u8; 8] = reader
                .take(8)?
                .try_into()
                .map_err(|_| Error::StorageFail("truncated KEM state".to_string()))?;
            Some(KemState {
                dk,
                ek,
                chain_ct,
                msgs_since_ratchet,
                last_ratchet_ts: i64::from_be_bytes(ts_bytes),
            })
        } else {
            None
        };

        let rk: [u8; 32] = row
            .rk
            .as_slice()
            .try_into()
            .map_err(|_| Error::StorageFail("bad root key length".to_string()))?;

        let chain_from = |key: &Option<Vec<u8>>, index: u32| -> Result<Option<Chain>> {
            match key {
                None => Ok(None),
                Some(bytes) => {
                    let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                        Error::StorageFail("bad chain key length".to_string())
                    })?;
                    Ok(Some(Chain::resume(Box::new(key), index)))
                }
            }
        };

        let x3dh_init = match &row.x3dh_init {
            None => None,
            Some(blob) => Some(X3dhInit::from_bytes(curve, blob)?),
        };

        Ok(Self {
            id: row.id,
            uid: row.uid,
            did: row.did,
            peer_device_id: peer_device_id.to_string(),
            curve,
            active: row.active,
            pn: row.pn,
            dhr,
            peer_kem_ek,
            dhs,
            kem,
            rk: Box::new(rk),
            sending: chain_from(&row.cks, row.ns)?,
            receiving: chain_from(&row.ckr, row.nr)?,
            ad: row.ad.clone(),
            x3dh_init,
            send_ratchet_pending: row.dhr_status & 0x01 != 0,
            pending_skipped: Vec::new(),
        })
    }
}

impl Zeroize for DrSession {
    fn zeroize(&mut self) {
        self.rk.zeroize();
        if let Some(chain) = &mut self.sending {
            chain.zeroize();
        }
        if let Some(chain) = &mut self.receiving {
            chain.zeroize();
        }
        self.dhs.zeroize();
        if let Some(kem) = &mut self.kem {
            kem.dk.zeroize();
        }
    }
}

impl ZeroizeOnDrop for DrSession {}

/// Advances a working chain to `target`, collecting the skipped keys.
fn skip_to(
    chain: &mut Chain,
    target: u32,
) -> Result<Vec<(u32, [u8; settings::DR_MESSAGE_KEY_SIZE])>> {
    if target < chain.index {
        return Err(Error::CryptoFail("receiving chain ran backwards".to_string()));
    }
    if target - chain.index > settings::MAX_MESSAGE_SKIP {
        return Err(Error::CryptoFail("too many skipped messages".to_string()));
    }
    let mut skipped = Vec::new();
    while chain.index < target {
        let nr = chain.index;
        let mk = chain.next();
        skipped.push((nr, *mk.as_bytes()));
    }
    Ok(skipped)
}

#[cfg(feature = "pq")]
fn kem_encapsulate_into(peer_ek: &[u8], ikm: &mut Vec<u8>) -> Result<Vec<u8>> {
    let (ct, mut ss) = crate::crypto::kem_encapsulate(peer_ek)?;
    ikm.extend_from_slice(ss.as_slice());
    ss.zeroize();
    Ok(ct.to_vec())
}

#[cfg(not(feature = "pq"))]
fn kem_encapsulate_into(_peer_ek: &[u8], _ikm: &mut Vec<u8>) -> Result<Vec<u8>> {
    Err(Error::InvalidArgument(
        "KEM suites are not enabled in this build".to_string(),
    ))
}

#[cfg(feature = "pq")]
fn kem_decapsulate_into(dk: &[u8], ct: &[u8], ikm: &mut Vec<u8>) -> Result<()> {
    let mut ss = crate::crypto::kem_decapsulate(dk, ct)?;
    ikm.extend_from_slice(ss.as_slice());
    ss.zeroize();
    Ok(())
}

#[cfg(not(feature = "pq"))]
fn kem_decapsulate_into(_dk: &[u8], _ct: &[u8], _ikm: &mut Vec<u8>) -> Result<()> {
    Err(Error::InvalidArgument(
        "KEM suites are not enabled in this build".to_string(),
    ))
}

#[cfg(feature = "pq")]
fn kem_generate_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    let (dk, ek) = crate::crypto::kem_generate();
    Ok((dk.to_vec(), ek.to_vec()))
}

#[cfg(not(feature = "pq"))]
fn kem_generate_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    Err(Error::InvalidArgument(
        "KEM suites are not enabled in this build".to_string(),
    ))
}

#[cfg(feature = "pq")]
fn kem_ratchet_chain_size() -> u32 {
    settings::KEM_RATCHET_CHAIN_SIZE
}

#[cfg(not(feature = "pq"))]
fn kem_ratchet_chain_size() -> u32 {
    u32::MAX
}

#[cfg(feature = "pq")]
fn kem_ratchet_period() -> i64 {
    settings::MAX_KEM_RATCHET_PERIOD
}

#[cfg(not(feature = "pq"))]
fn kem_ratchet_period() -> i64 {
    i64::MAX
}
