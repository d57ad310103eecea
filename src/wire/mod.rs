//! Byte layouts shared by peers: Double Ratchet message headers, X3DH
//! initiation payloads and prekey bundle entries.
//!
//! Every field is either fixed-size (known from the algorithm id) or
//! length-prefixed; a short or inconsistent buffer is a hard parse error
//! and the whole message is rejected.

pub(crate) mod x3dh;

use crate::error::{Error, Result};
use crate::settings;
use crate::types::CurveId;

/// An X3DH initiation payload travels with the header.
pub(crate) const FLAG_X3DH_INIT: u8 = 0b0000_0001;
/// The AEAD payload is the plaintext itself rather than a cipher-message key.
pub(crate) const FLAG_PAYLOAD_DIRECT: u8 = 0b0000_0010;
/// The header carries fresh KEM ratchet material (hybrid suites only).
pub(crate) const FLAG_KEM_RATCHET: u8 = 0b0000_0100;

const FLAGS_KNOWN: u8 = FLAG_X3DH_INIT | FLAG_PAYLOAD_DIRECT | FLAG_KEM_RATCHET;

/// Sequential reader over a received buffer; every access is bounds-checked.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::SerializationFail("truncated buffer".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16_be(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32_be(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Fresh KEM ratchet material carried by the messages of a hybrid chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KemRatchetPublics {
    /// Sender's current KEM encapsulation key.
    pub(crate) ek: Vec<u8>,
    /// Encapsulation against the receiver's KEM key.
    pub(crate) ct: Vec<u8>,
}

/// X3DH initiation payload, attached to every outbound message of a fresh
/// initiator session until the first reply decrypts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct X3dhInit {
    /// Initiator's public identity key.
    pub(crate) ik: Vec<u8>,
    /// Initiator's ephemeral X25519 public key.
    pub(crate) ek_pub: [u8; 32],
    /// Initiator's initial KEM encapsulation key (hybrid suites).
    pub(crate) kem_ek: Option<Vec<u8>>,
    /// Encapsulation against the responder's signed-prekey KEM key.
    pub(crate) kem_ct: Option<Vec<u8>>,
    pub(crate) spk_id: u32,
    pub(crate) opk_id: Option<u32>,
}

impl X3dhInit {
    /// Standalone serialization, used to persist the payload with its
    /// session between messages.
    pub(crate) fn to_bytes(&self, curve: CurveId) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_into(curve, &mut out);
        out
    }

    pub(crate) fn from_bytes(curve: CurveId, bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let init = Self::read_from(curve, &mut reader)?;
        if reader.remaining() != 0 {
            return Err(Error::SerializationFail(
                "trailing bytes after key agreement payload".to_string(),
            ));
        }
        Ok(init)
    }

    fn write_into(&self, curve: CurveId, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ik);
        out.extend_from_slice(&self.ek_pub);
        if curve.is_kem() {
            if let (Some(ek), Some(ct)) = (&self.kem_ek, &self.kem_ct) {
                out.extend_from_slice(ek);
                out.extend_from_slice(ct);
            }
        }
        out.extend_from_slice(&self.spk_id.to_be_bytes());
        match self.opk_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
    }

    fn read_from(curve: CurveId, reader: &mut Reader<'_>) -> Result<Self> {
        let ik = reader.take(curve.ik_size())?.to_vec();
        let ek_pub: [u8; 32] = reader
            .take(32)?
            .try_into()
            .map_err(|_| Error::SerializationFail("bad ephemeral key".to_string()))?;
        let (kem_ek, kem_ct) = if curve.is_kem() {
            let kem_pub_len = curve.x_pub_size() - 32;
            let ek = reader.take(kem_pub_len)?.to_vec();
            let ct = reader.take(curve.kem_ct_size())?.to_vec();
            (Some(ek), Some(ct))
        } else {
            (None, None)
        };
        let spk_id = reader.u32_be()?;
        let opk_id = match reader.u8()? {
            0 => None,
            1 => Some(reader.u32_be()?),
            other => {
                return Err(Error::SerializationFail(format!(
                    "bad one-time prekey flag {other}"
                )))
            }
        };
        Ok(Self {
            ik,
            ek_pub,
            kem_ek,
            kem_ct,
            spk_id,
            opk_id,
        })
    }
}

/// Cleartext (but authenticated) header of a Double Ratchet message.
#[derive(Clone, Debug)]
pub(crate) struct DrHeader {
    pub(crate) curve: CurveId,
    pub(crate) ns: u16,
    pub(crate) pn: u16,
    pub(crate) payload_direct: bool,
    /// Sender's current X25519 ratchet public key.
    pub(crate) dh_pub: [u8; 32],
    pub(crate) kem: Option<KemRatchetPublics>,
    pub(crate) x3dh_init: Option<X3dhInit>,
}

impl DrHeader {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.x3dh_init.is_some() {
            flags |= FLAG_X3DH_INIT;
        }
        if self.payload_direct {
            flags |= FLAG_PAYLOAD_DIRECT;
        }
        if self.kem.is_some() {
            flags |= FLAG_KEM_RATCHET;
        }

        let mut out = Vec::with_capacity(64);
        out.push(settings::DR_PROTOCOL_VERSION);
        out.push(flags);
        out.push(self.curve as u8);
        out.extend_from_slice(&self.ns.to_be_bytes());
        out.extend_from_slice(&self.pn.to_be_bytes());
        out.extend_from_slice(&self.dh_pub);
        if let Some(kem) = &self.kem {
            out.extend_from_slice(&kem.ek);
            out.extend_from_slice(&kem.ct);
        }
        if let Some(init) = &self.x3dh_init {
            init.write_into(self.curve, &mut out);
        }
        out
    }

    /// Parses a header off the front of a received message, returning it
    /// together with its length so the caller can locate the payload.
    pub(crate) fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = Reader::new(buf);
        let version = reader.u8()?;
        if version != settings::DR_PROTOCOL_VERSION {
            return Err(Error::SerializationFail(format!(
                "unknown message version {version}"
            )));
        }
        let flags = reader.u8()?;
        if flags & !FLAGS_KNOWN != 0 {
            return Err(Error::SerializationFail(format!(
                "unknown header flags {flags:#04x}"
            )));
        }
        let curve = CurveId::from_u8(reader.u8()?)
            .map_err(|_| Error::SerializationFail("unknown algorithm id".to_string()))?;
        let ns = reader.u16_be()?;
        let pn = reader.u16_be()?;
        let dh_pub: [u8; 32] = reader
            .take(32)?
            .try_into()
            .map_err(|_| Error::SerializationFail("bad ratchet key".to_string()))?;

        let kem = if flags & FLAG_KEM_RATCHET != 0 {
            if !curve.is_kem() {
                return Err(Error::SerializationFail(
                    "KEM material on a non-hybrid suite".to_string(),
                ));
            }
            let ek = reader.take(curve.x_pub_size() - 32)?.to_vec();
            let ct = reader.take(curve.kem_ct_size())?.to_vec();
            Some(KemRatchetPublics { ek, ct })
        } else {
            None
        };

        let x3dh_init = if flags & FLAG_X3DH_INIT != 0 {
            Some(X3dhInit::read_from(curve, &mut reader)?)
        } else {
            None
        };

        Ok((
            Self {
                curve,
                ns,
                pn,
                payload_direct: flags & FLAG_PAYLOAD_DIRECT != 0,
                dh_pub,
                kem,
                x3dh_init,
            },
            reader.position(),
        ))
    }
}

/// Tag in front of each per-device bundle in a server response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BundleFlag {
    NoOpk = 0,
    Opk = 1,
    /// The server does not know this device; the bundle is just the id.
    NoBundle = 2,
}

impl BundleFlag {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::NoOpk),
            1 => Ok(Self::Opk),
            2 => Ok(Self::NoBundle),
            other => Err(Error::SerializationFail(format!(
                "unknown bundle flag {other}"
            ))),
        }
    }
}

/// One peer device's key bundle as served by the key-distribution server.
#[derive(Clone, Debug)]
pub(crate) struct PeerBundle {
    pub(crate) device_id: String,
    pub(crate) flag: BundleFlag,
    pub(crate) ik: Vec<u8>,
    pub(crate) spk_pub: Vec<u8>,
    pub(crate) spk_sig: Vec<u8>,
    pub(crate) spk_id: u32,
    pub(crate) opk: Option<(Vec<u8>, u32)>,
}

/// `SPk_pub || signature || SPk_id` as uploaded and served.
pub(crate) fn write_spk_entry(out: &mut Vec<u8>, spk_pub: &[u8], signature: &[u8], id: u32) {
    out.extend_from_slice(spk_pub);
    out.extend_from_slice(signature);
    out.extend_from_slice(&id.to_be_bytes());
}

/// `OPk_pub || OPk_id` as uploaded and served.
pub(crate) fn write_opk_entry(out: &mut Vec<u8>, opk_pub: &[u8], id: u32) {
    out.extend_from_slice(opk_pub);
    out.extend_from_slice(&id.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header(x3dh_init: bool) -> DrHeader {
        DrHeader {
            curve: CurveId::C25519,
            ns: 7,
            pn: 3,
            payload_direct: true,
            dh_pub: [0x42; 32],
            kem: None,
            x3dh_init: x3dh_init.then(|| X3dhInit {
                ik: vec![0x11; 32],
                ek_pub: [0x22; 32],
                kem_ek: None,
                kem_ct: None,
                spk_id: 0xdead_beef,
                opk_id: Some(81),
            }),
        }
    }

    #[test]
    fn header_round_trip() {
        for with_init in [false, true] {
            let header = sample_header(with_init);
            let mut bytes = header.to_bytes();
            let header_len = bytes.len();
            bytes.extend_from_slice(b"ciphertext");

            let (parsed, len) = DrHeader::parse(&bytes).unwrap();
            assert_eq!(len, header_len);
            assert_eq!(parsed.ns, header.ns);
            assert_eq!(parsed.pn, header.pn);
            assert_eq!(parsed.dh_pub, header.dh_pub);
            assert_eq!(parsed.payload_direct, header.payload_direct);
            assert_eq!(parsed.x3dh_init, header.x3dh_init);
        }
    }

    #[test]
    fn header_rejects_bad_version_and_flags() {
        let mut bytes = sample_header(false).to_bytes();
        bytes[0] = 0x02;
        assert!(DrHeader::parse(&bytes).is_err());

        let mut bytes = sample_header(false).to_bytes();
        bytes[1] |= 0x80;
        assert!(DrHeader::parse(&bytes).is_err());
    }

    #[test]
    fn header_rejects_truncation() {
        let bytes = sample_header(true).to_bytes();
        for len in 0..bytes.len() {
            assert!(DrHeader::parse(&bytes[..len]).is_err(), "length {len}");
        }
    }

    #[test]
    fn kem_flag_on_classic_suite_is_rejected() {
        let mut bytes = sample_header(false).to_bytes();
        bytes[1] |= FLAG_KEM_RATCHET;
        assert!(DrHeader::parse(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn parse_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = DrHeader::parse(&data);
        }

        #[test]
        fn counters_round_trip(ns in any::<u16>(), pn in any::<u16>()) {
            let mut header = sample_header(false);
            header.ns = ns;
            header.pn = pn;
            let (parsed, _) = DrHeader::parse(&header.to_bytes()).unwrap();
            prop_assert_eq!(parsed.ns, ns);
            prop_assert_eq!(parsed.pn, pn);
        }
    }
}
