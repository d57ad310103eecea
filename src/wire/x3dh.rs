//! Request/response codec for the key-distribution server.
//!
//! Every request starts with `version | type | algorithm id`; the sender's
//! device id travels in the transport's `from` field. Responses echo the
//! same three-byte header. Type and error-code numbering is shared with
//! deployed servers and must not change.

use crate::error::{Error, Result};
use crate::settings;
use crate::types::CurveId;
use crate::wire::{BundleFlag, PeerBundle, Reader};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageType {
    DeleteUser = 0x02,
    PostSpk = 0x03,
    PostOpks = 0x04,
    GetPeerBundle = 0x05,
    PeerBundle = 0x06,
    GetSelfOpks = 0x07,
    SelfOpks = 0x08,
    RegisterUser = 0x09,
    Error = 0xff,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(Self::DeleteUser),
            0x03 => Ok(Self::PostSpk),
            0x04 => Ok(Self::PostOpks),
            0x05 => Ok(Self::GetPeerBundle),
            0x06 => Ok(Self::PeerBundle),
            0x07 => Ok(Self::GetSelfOpks),
            0x08 => Ok(Self::SelfOpks),
            0x09 => Ok(Self::RegisterUser),
            0xff => Ok(Self::Error),
            other => Err(Error::SerializationFail(format!(
                "unknown server message type {other:#04x}"
            ))),
        }
    }
}

/// Error codes carried by a typed server error response. Only the code
/// the engine reacts to is named; the rest surface verbatim in
/// `ServerFail`.
pub(crate) mod error_codes {
    pub(crate) const USER_NOT_FOUND: u8 = 0x06;
}

fn header(message_type: MessageType, curve: CurveId) -> Vec<u8> {
    vec![
        settings::X3DH_PROTOCOL_VERSION,
        message_type as u8,
        curve as u8,
    ]
}

/// `Ik | SPk entry | OPk count (BE16) | OPk entries`
pub(crate) fn build_register_user(
    curve: CurveId,
    ik: &[u8],
    spk_pub: &[u8],
    spk_sig: &[u8],
    spk_id: u32,
    opks: &[(Vec<u8>, u32)],
) -> Vec<u8> {
    let mut out = header(MessageType::RegisterUser, curve);
    out.extend_from_slice(ik);
    super::write_spk_entry(&mut out, spk_pub, spk_sig, spk_id);
    out.extend_from_slice(&(opks.len() as u16).to_be_bytes());
    for (opk_pub, opk_id) in opks {
        super::write_opk_entry(&mut out, opk_pub, *opk_id);
    }
    out
}

pub(crate) fn build_delete_user(curve: CurveId) -> Vec<u8> {
    header(MessageType::DeleteUser, curve)
}

pub(crate) fn build_post_spk(
    curve: CurveId,
    spk_pub: &[u8],
    spk_sig: &[u8],
    spk_id: u32,
) -> Vec<u8> {
    let mut out = header(MessageType::PostSpk, curve);
    super::write_spk_entry(&mut out, spk_pub, spk_sig, spk_id);
    out
}

pub(crate) fn build_post_opks(curve: CurveId, opks: &[(Vec<u8>, u32)]) -> Vec<u8> {
    let mut out = header(MessageType::PostOpks, curve);
    out.extend_from_slice(&(opks.len() as u16).to_be_bytes());
    for (opk_pub, opk_id) in opks {
        super::write_opk_entry(&mut out, opk_pub, *opk_id);
    }
    out
}

/// `count (BE16) | (device id length (BE16) | device id)*`
pub(crate) fn build_get_peer_bundles(curve: CurveId, device_ids: &[String]) -> Vec<u8> {
    let mut out = header(MessageType::GetPeerBundle, curve);
    out.extend_from_slice(&(device_ids.len() as u16).to_be_bytes());
    for id in device_ids {
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id.as_bytes());
    }
    out
}

pub(crate) fn build_get_self_opks(curve: CurveId) -> Vec<u8> {
    header(MessageType::GetSelfOpks, curve)
}

/// A successfully parsed server response.
pub(crate) enum Response {
    /// Empty acknowledgement, echoing the request type.
    Ack(MessageType),
    PeerBundles(Vec<PeerBundle>),
    SelfOpkIds(Vec<u32>),
}

/// Parses a server response body. A typed error response surfaces as
/// `Error::ServerFail` with the server's code and detail string.
pub(crate) fn parse_response(curve: CurveId, body: &[u8]) -> Result<Response> {
    let mut reader = Reader::new(body);
    let version = reader.u8()?;
    if version != settings::X3DH_PROTOCOL_VERSION {
        return Err(Error::SerializationFail(format!(
            "unknown server protocol version {version}"
        )));
    }
    let message_type = MessageType::from_u8(reader.u8()?)?;
    let response_curve = reader.u8()?;
    if message_type != MessageType::Error && response_curve != curve as u8 {
        return Err(Error::SerializationFail(format!(
            "server answered for algorithm {response_curve}, expected {}",
            curve as u8
        )));
    }

    match message_type {
        MessageType::Error => {
            let code = reader.u8()?;
            let detail = String::from_utf8_lossy(reader.take(reader.remaining())?).into_owned();
            Err(Error::ServerFail {
                code: code as u16,
                detail,
            })
        }
        MessageType::PeerBundle => {
            let count = reader.u16_be()?;
            let mut bundles = Vec::with_capacity(count as usize);
            for _ in 0..count {
                bundles.push(read_peer_bundle(curve, &mut reader)?);
            }
            if reader.remaining() != 0 {
                return Err(Error::SerializationFail(
                    "trailing bytes after peer bundles".to_string(),
                ));
            }
            Ok(Response::PeerBundles(bundles))
        }
        MessageType::SelfOpks => {
            let count = reader.u16_be()?;
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ids.push(reader.u32_be()?);
            }
            Ok(Response::SelfOpkIds(ids))
        }
        other => Ok(Response::Ack(other)),
    }
}

/// `device id length (BE16) | device id | flag | [Ik | SPk entry | [OPk entry]]`
fn read_peer_bundle(curve: CurveId, reader: &mut Reader<'_>) -> Result<PeerBundle> {
    let id_len = reader.u16_be()? as usize;
    let device_id = String::from_utf8(reader.take(id_len)?.to_vec())
        .map_err(|_| Error::SerializationFail("device id is not UTF-8".to_string()))?;
    let flag = BundleFlag::from_u8(reader.u8()?)?;

    if flag == BundleFlag::NoBundle {
        return Ok(PeerBundle {
            device_id,
            flag,
            ik: Vec::new(),
            spk_pub: Vec::new(),
            spk_sig: Vec::new(),
            spk_id: 0,
            opk: None,
        });
    }

    let ik = reader.take(curve.ik_size())?.to_vec();
    let spk_pub = reader.take(curve.x_pub_size())?.to_vec();
    let spk_sig = reader.take(curve.sig_size())?.to_vec();
    let spk_id = reader.u32_be()?;
    let opk = if flag == BundleFlag::Opk {
        let opk_pub = reader.take(curve.x_pub_size())?.to_vec();
        let opk_id = reader.u32_be()?;
        Some((opk_pub, opk_id))
    } else {
        None
    };

    Ok(PeerBundle {
        device_id,
        flag,
        ik,
        spk_pub,
        spk_sig,
        spk_id,
        opk,
    })
}
